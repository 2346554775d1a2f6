//! `begin`/`rescue`/`else` and `begin`/`ensure`.

use super::context::{Context, EnsureFrame};
use super::{Builder, ChildBody, ERRINFO_LOCAL};
use crate::bytecode::compile_error::Result;
use crate::bytecode::ir::{Operand, RescueMark, Seq};
use crate::bytecode::iseq::{CatchKind, IseqKind};
use crate::bytecode::op::{Opcode, checkmatch};
use crate::lang::node::{Node, NodeKind, RescueClause};

#[derive(Debug, Clone, Copy)]
pub(super) struct RescueParts<'f> {
    pub body: Option<&'f Node>,
    pub clauses: &'f [RescueClause],
    pub else_: Option<&'f Node>,
}

impl<'a> Builder<'a> {
    /// Layout:
    ///
    /// ```text
    /// lstart: body        ; rescue catch lstart..lend -> lcont
    /// lend:   [pop; else] ; retry catch lend..lcont -> lstart
    ///         nop
    /// lcont:  [pop]
    /// ```
    pub(super) fn compile_rescue<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        parts: RescueParts<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let RescueParts { body, clauses, else_ } = parts;
        let name = format!("rescue in {}", self.base_label());
        let child = self.new_child(
            name,
            IseqKind::Rescue,
            vec![ERRINFO_LOCAL.to_string()],
            line,
            ChildBody::Rescue(clauses),
            ctx,
        )?;

        let lstart = self.arena.new_label();
        let lend = self.arena.new_label();
        let lcont = self.arena.new_label();
        self.arena.label_mut(lstart).rescued = RescueMark::Begin;
        self.arena.label_mut(lend).rescued = RescueMark::End;

        self.bind(ret, lstart);
        self.compile_opt(ret, line, body, false, ctx.with_rescue())?;
        self.bind(ret, lend);
        if let Some(else_) = else_ {
            self.emit(ret, line, Opcode::Pop, vec![]);
            self.compile_node(ret, else_, false, ctx)?;
        }
        self.emit(ret, line, Opcode::Nop, vec![]);
        self.bind(ret, lcont);
        self.pop_if(ret, line, popped);

        self.add_catch(CatchKind::Rescue, lstart, lend, lcont, Some(child));
        self.add_catch(CatchKind::Retry, lend, lcont, lstart, None);
        Ok(())
    }

    /// Body of a rescue handler: test each clause against `$!` in order and
    /// `leave` with the value of the first that matches. Falls through to
    /// the re-raise tail when none does.
    pub(super) fn compile_rescue_clauses<'f>(
        &mut self,
        ret: &mut Seq,
        clauses: &'f [RescueClause],
        ctx: Context<'f>,
    ) -> Result<()> {
        for clause in clauses {
            let line = clause.line;
            let hit = self.arena.new_label();
            let miss = self.arena.new_label();

            if clause.exceptions.is_empty() {
                self.get_local(ret, line, ERRINFO_LOCAL)?;
                self.emit(ret, line, Opcode::PutNil, vec![]);
                self.emit(
                    ret,
                    line,
                    Opcode::GetConstant,
                    vec![Operand::Id("StandardError".to_string())],
                );
                self.emit(ret, line, Opcode::CheckMatch, vec![Operand::Num(checkmatch::RESCUE)]);
                self.branch(ret, line, Opcode::BranchIf, hit);
            }
            for exc in &clause.exceptions {
                let mut flag = checkmatch::RESCUE;
                if matches!(exc.kind, NodeKind::Splat(_)) {
                    flag |= checkmatch::ARRAY;
                }
                self.get_local(ret, line, ERRINFO_LOCAL)?;
                self.compile_node(ret, exc, false, ctx)?;
                self.emit(ret, line, Opcode::CheckMatch, vec![Operand::Num(flag)]);
                self.branch(ret, line, Opcode::BranchIf, hit);
            }
            self.branch(ret, line, Opcode::Jump, miss);

            self.bind(ret, hit);
            if let Some(var) = &clause.var {
                self.get_local(ret, line, ERRINFO_LOCAL)?;
                self.assign_target(ret, line, var, ctx)?;
            }
            self.compile_opt(ret, line, clause.body.as_ref(), false, ctx)?;
            if self.options().tailcall_optimization {
                self.emit(ret, line, Opcode::Nop, vec![]);
            }
            self.emit(ret, line, Opcode::Leave, vec![]);
            self.bind(ret, miss);
        }
        Ok(())
    }

    /// Layout:
    ///
    /// ```text
    /// lstart: body        ; ensure catch per range -> lcont
    /// lend:   ensure body (or nop)
    /// lcont:
    /// ```
    ///
    /// Exits inside the body inline the ensure body and split the protected
    /// range around the copy.
    pub(super) fn compile_ensure<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        body: Option<&'f Node>,
        ensure: Option<&'f Node>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let Some(ensure) = ensure else {
            return self.compile_opt(ret, line, body, popped, ctx);
        };

        let name = format!("ensure in {}", self.base_label());
        let child = self.new_child(
            name,
            IseqKind::Ensure,
            vec![ERRINFO_LOCAL.to_string()],
            line,
            ChildBody::Ensure(Some(ensure)),
            ctx,
        )?;

        let mut ensr = Seq::new();
        self.compile_node(&mut ensr, ensure, true, ctx)?;

        let lstart = self.arena.new_label();
        let lend = self.arena.new_label();
        let lcont = self.arena.new_label();

        let range = self.ensure_ranges.len();
        self.ensure_ranges.push(vec![(lstart, lend)]);
        let frame = EnsureFrame::new(ensure, range, ctx.ensure);

        self.bind(ret, lstart);
        self.compile_opt(ret, line, body, popped, ctx.with_ensure(&frame))?;
        self.bind(ret, lend);
        if ensr.is_empty() {
            self.emit(ret, line, Opcode::Nop, vec![]);
        } else {
            self.arena.concat(ret, ensr);
        }
        self.bind(ret, lcont);

        let start_elem = self.arena.label_elem(lstart);
        let body_is_empty = start_elem.and_then(|e| self.arena.next(e)) == self.arena.label_elem(lend);
        if !body_is_empty {
            let ranges = std::mem::take(&mut self.ensure_ranges[range]);
            for (start, end) in ranges {
                self.add_catch(CatchKind::Ensure, start, end, lcont, Some(child));
            }
        }
        Ok(())
    }

    /// Name of the enclosing method-like scope, without handler prefixes.
    pub(super) fn base_label(&self) -> &str {
        let mut name = self.name.as_str();
        for prefix in ["block in ", "rescue in ", "ensure in "] {
            while let Some(rest) = name.strip_prefix(prefix) {
                name = rest;
            }
        }
        name
    }
}
