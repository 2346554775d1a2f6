//! Conditionals, boolean operators, `case` and loops.

use super::Builder;
use super::context::{Context, EnsureFrame, LoopLabels};
use crate::bytecode::compile_error::{InternalError, Result};
use crate::bytecode::ir::{CaseDispatch, LabelId, Operand, Seq};
use crate::bytecode::iseq::CatchKind;
use crate::bytecode::op::{Opcode, checkmatch};
use crate::lang::node::{Node, NodeKind, When};
use crate::lang::value::Value;

/// Arms of an `if`, either of which may be missing.
#[derive(Debug, Clone, Copy)]
pub(super) struct IfArms<'f> {
    pub then: Option<&'f Node>,
    pub else_: Option<&'f Node>,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct CaseParts<'f> {
    pub subject: Option<&'f Node>,
    pub whens: &'f [When],
    pub else_: Option<&'f Node>,
}

/// A `while` or `until` loop.
#[derive(Debug, Clone, Copy)]
pub(super) struct LoopParts<'f> {
    pub is_while: bool,
    pub cond: &'f Node,
    pub body: Option<&'f Node>,
    /// The body runs once before the first test.
    pub do_while: bool,
}

impl<'a> Builder<'a> {
    /// Jump to `then_label` or `else_label` depending on `cond`.
    ///
    /// Leaves the stack unchanged on both edges.
    pub(super) fn compile_branch_condition<'f>(
        &mut self,
        ret: &mut Seq,
        cond: &'f Node,
        then_label: LabelId,
        else_label: LabelId,
        ctx: Context<'f>,
    ) -> Result<()> {
        let line = cond.line;
        match &cond.kind {
            NodeKind::And(l, r) => {
                let mid = self.arena.new_label();
                self.compile_branch_condition(ret, l, mid, else_label, ctx)?;
                if self.arena.label(mid).refcnt == 0 {
                    return Ok(());
                }
                self.bind(ret, mid);
                self.compile_branch_condition(ret, r, then_label, else_label, ctx)
            }
            NodeKind::Or(l, r) => {
                let mid = self.arena.new_label();
                self.compile_branch_condition(ret, l, then_label, mid, ctx)?;
                if self.arena.label(mid).refcnt == 0 {
                    return Ok(());
                }
                self.bind(ret, mid);
                self.compile_branch_condition(ret, r, then_label, else_label, ctx)
            }
            NodeKind::Nil | NodeKind::False => {
                self.branch(ret, line, Opcode::Jump, else_label);
                Ok(())
            }
            NodeKind::Lit(v) if !v.is_truthy() => {
                self.branch(ret, line, Opcode::Jump, else_label);
                Ok(())
            }
            NodeKind::True | NodeKind::Lit(_) | NodeKind::Str(_) => {
                self.branch(ret, line, Opcode::Jump, then_label);
                Ok(())
            }
            NodeKind::Array(items) if items.is_empty() => {
                self.branch(ret, line, Opcode::Jump, then_label);
                Ok(())
            }
            NodeKind::Hash(pairs) if pairs.is_empty() => {
                self.branch(ret, line, Opcode::Jump, then_label);
                Ok(())
            }
            _ => {
                self.compile_node(ret, cond, false, ctx)?;
                self.branch(ret, line, Opcode::BranchUnless, else_label);
                self.branch(ret, line, Opcode::Jump, then_label);
                Ok(())
            }
        }
    }

    pub(super) fn compile_if<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        cond: &'f Node,
        arms: IfArms<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let IfArms { then, else_ } = arms;
        let then_label = self.arena.new_label();
        let else_label = self.arena.new_label();
        let end_label = self.arena.new_label();

        self.compile_branch_condition(ret, cond, then_label, else_label, ctx)?;

        // a branch the condition never reaches is not compiled at all, so
        // it cannot leave catch entries or children behind
        let then_live = self.arena.label(then_label).refcnt > 0;
        let else_live = self.arena.label(else_label).refcnt > 0;

        if then_live {
            self.bind(ret, then_label);
            self.compile_opt(ret, line, then, popped, ctx)?;
            if else_live {
                self.branch(ret, line, Opcode::Jump, end_label);
            }
        }
        if else_live {
            self.bind(ret, else_label);
            self.compile_opt(ret, line, else_, popped, ctx)?;
        }
        self.bind(ret, end_label);
        Ok(())
    }

    /// Value-producing `&&` / `||`. `skip` is the branch that keeps the
    /// left value: `branchunless` for `&&`, `branchif` for `||`.
    pub(super) fn compile_logical<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        (left, right): (&'f Node, &'f Node),
        skip: Opcode,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let end = self.arena.new_label();
        self.compile_node(ret, left, false, ctx)?;
        self.dup_unless(ret, line, popped);
        self.branch(ret, line, skip, end);
        if !popped {
            self.emit(ret, line, Opcode::Pop, vec![]);
        }
        self.compile_node(ret, right, popped, ctx)?;
        self.bind(ret, end);
        Ok(())
    }

    // =========================================================================
    // CASE
    // =========================================================================

    /// `when` value usable as an `opt_case_dispatch` key.
    fn case_literal(&self, node: &Node) -> Option<Value> {
        let value = match &node.kind {
            NodeKind::Lit(v) => v.clone(),
            NodeKind::Nil => Value::Nil,
            NodeKind::True => Value::True,
            NodeKind::False => Value::False,
            NodeKind::Str(s) => Value::String(s.clone()),
            _ => return None,
        };
        value.case_dispatch_key().map(|_| value)
    }

    pub(super) fn compile_case<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        case: CaseParts<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let CaseParts { subject, whens, else_ } = case;
        if whens.is_empty() {
            return Err(InternalError::EmptyCaseClauses.into());
        }
        let Some(subject) = subject else {
            return self.compile_case_without_subject(ret, line, whens, else_, popped, ctx);
        };

        let end_label = self.arena.new_label();
        let else_label = self.arena.new_label();
        let mut cond_seq = Seq::new();
        let mut body_seq = Seq::new();

        self.compile_node(ret, subject, false, ctx)?;

        let mut dispatch = CaseDispatch::default();
        let mut all_special = true;

        for when in whens {
            let body_label = self.arena.new_label();
            self.bind(&mut body_seq, body_label);
            self.emit(&mut body_seq, when.line, Opcode::Pop, vec![]);
            self.compile_opt(&mut body_seq, when.line, when.body.as_ref(), popped, ctx)?;
            self.branch(&mut body_seq, when.line, Opcode::Jump, end_label);

            for value in &when.values {
                let vline = value.line;
                if let NodeKind::Splat(inner) = &value.kind {
                    all_special = false;
                    self.emit(&mut cond_seq, vline, Opcode::Dup, vec![]);
                    self.compile_node(&mut cond_seq, inner, false, ctx)?;
                    self.emit(
                        &mut cond_seq,
                        vline,
                        Opcode::CheckMatch,
                        vec![Operand::Num(checkmatch::CASE | checkmatch::ARRAY)],
                    );
                    self.branch(&mut cond_seq, vline, Opcode::BranchIf, body_label);
                    continue;
                }

                self.emit(&mut cond_seq, vline, Opcode::Dup, vec![]);
                match self.case_literal(value) {
                    Some(literal) => {
                        if let Some(key) = literal.case_dispatch_key() {
                            if dispatch.entries.iter().any(|(k, _)| *k == key) {
                                tracing::warn!(
                                    path = self.path(),
                                    line = vline,
                                    "duplicated when clause {} is ignored",
                                    literal
                                );
                            } else {
                                dispatch.entries.push((key, body_label));
                            }
                        }
                        self.emit(&mut cond_seq, vline, Opcode::PutObject, vec![Operand::Value(literal)]);
                    }
                    None => {
                        all_special = false;
                        self.compile_node(&mut cond_seq, value, false, ctx)?;
                    }
                }
                self.emit(&mut cond_seq, vline, Opcode::CheckMatch, vec![Operand::Num(checkmatch::CASE)]);
                self.branch(&mut cond_seq, vline, Opcode::BranchIf, body_label);
            }
        }

        self.bind(&mut cond_seq, else_label);
        self.emit(&mut cond_seq, line, Opcode::Pop, vec![]);
        self.compile_opt(&mut cond_seq, line, else_, popped, ctx)?;
        self.branch(&mut cond_seq, line, Opcode::Jump, end_label);

        if all_special && !dispatch.entries.is_empty() && self.options().specialized_instruction {
            self.emit(ret, line, Opcode::Dup, vec![]);
            self.emit(
                ret,
                line,
                Opcode::OptCaseDispatch,
                vec![Operand::Dispatch(dispatch), Operand::Label(else_label)],
            );
        }

        self.arena.concat(ret, cond_seq);
        self.arena.concat(ret, body_seq);
        self.bind(ret, end_label);
        Ok(())
    }

    fn compile_case_without_subject<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        whens: &'f [When],
        else_: Option<&'f Node>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let end_label = self.arena.new_label();
        let mut body_seq = Seq::new();

        for when in whens {
            let body_label = self.arena.new_label();
            self.bind(&mut body_seq, body_label);
            self.compile_opt(&mut body_seq, when.line, when.body.as_ref(), popped, ctx)?;
            self.branch(&mut body_seq, when.line, Opcode::Jump, end_label);

            for value in &when.values {
                let vline = value.line;
                if let NodeKind::Splat(inner) = &value.kind {
                    self.emit(ret, vline, Opcode::PutNil, vec![]);
                    self.compile_node(ret, inner, false, ctx)?;
                    self.emit(
                        ret,
                        vline,
                        Opcode::CheckMatch,
                        vec![Operand::Num(checkmatch::WHEN | checkmatch::ARRAY)],
                    );
                } else {
                    self.compile_node(ret, value, false, ctx)?;
                }
                self.branch(ret, vline, Opcode::BranchIf, body_label);
            }
        }

        self.compile_opt(ret, line, else_, popped, ctx)?;
        self.branch(ret, line, Opcode::Jump, end_label);
        self.arena.concat(ret, body_seq);
        self.bind(ret, end_label);
        Ok(())
    }

    // =========================================================================
    // LOOPS
    // =========================================================================

    /// `while` / `until`.
    ///
    /// ```text
    ///     jump next          (jump body when the body runs first)
    /// adjust:
    ///     putnil
    /// next_catch:
    ///     pop
    ///     jump next
    /// body:
    /// redo:
    ///     <body, discarded>
    /// next:
    ///     <condition: redo / end>
    /// end:
    ///     putnil
    /// break:
    /// ```
    pub(super) fn compile_loop<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        parts: LoopParts<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let LoopParts {
            is_while,
            cond,
            body,
            do_while,
        } = parts;
        let next_label = self.arena.new_label();
        let redo_label = self.arena.new_label();
        let break_label = self.arena.new_label();
        let end_label = self.arena.new_label();
        let adjust_label = self.arena.new_label();
        let next_catch_label = self.arena.new_label();

        let marker = EnsureFrame::loop_marker(ctx.ensure);
        let inner = ctx
            .with_loop(LoopLabels {
                start: next_label,
                end: break_label,
                redo: Some(redo_label),
            })
            .with_ensure(&marker);

        let body_label = if do_while {
            let l = self.arena.new_label();
            self.branch(ret, line, Opcode::Jump, l);
            Some(l)
        } else {
            self.branch(ret, line, Opcode::Jump, next_label);
            None
        };
        self.bind(ret, adjust_label);
        self.emit(ret, line, Opcode::PutNil, vec![]);
        self.bind(ret, next_catch_label);
        self.emit(ret, line, Opcode::Pop, vec![]);
        self.branch(ret, line, Opcode::Jump, next_label);
        if let Some(l) = body_label {
            self.bind(ret, l);
        }

        self.bind(ret, redo_label);
        if let Some(body) = body {
            self.compile_stmt(ret, body, true, inner)?;
        }
        self.bind(ret, next_label);
        if is_while {
            self.compile_branch_condition(ret, cond, redo_label, end_label, inner)?;
        } else {
            self.compile_branch_condition(ret, cond, end_label, redo_label, inner)?;
        }

        self.bind(ret, end_label);
        self.arena.adjust_restore(ret, adjust_label);
        self.emit(ret, line, Opcode::PutNil, vec![]);
        self.bind(ret, break_label);
        self.pop_if(ret, line, popped);

        self.add_catch(CatchKind::Break, redo_label, break_label, break_label, None);
        self.add_catch(CatchKind::Next, redo_label, break_label, next_catch_label, None);
        self.add_catch(CatchKind::Redo, redo_label, break_label, redo_label, None);
        Ok(())
    }
}
