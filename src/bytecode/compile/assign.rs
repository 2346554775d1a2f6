//! Multiple, operator and attribute assignment.

use rustc_hash::FxHashSet;

use super::Builder;
use super::context::Context;
use crate::bytecode::compile_error::{CompileError, InternalError, Result};
use crate::bytecode::ir::{Operand, Seq};
use crate::bytecode::iseq::{CallSite, call_flag};
use crate::bytecode::op::Opcode;
use crate::lang::node::{AssignTarget, CallArgs, MultiAssign, Node, NodeKind, OpAsgnKind, OpAsgnOp, SplatTarget};

/// Right-hand side of an operator assignment.
#[derive(Debug, Clone, Copy)]
pub(super) struct OpUpdate<'f> {
    pub op: &'f OpAsgnOp,
    pub value: &'f Node,
}

/// `recv.name` or `recv[args]` as an assignment target. `name` is the
/// setter.
#[derive(Debug, Clone, Copy)]
pub(super) struct AttrRef<'f, A: ?Sized> {
    pub recv: &'f Node,
    pub name: &'f str,
    pub args: &'f A,
}

impl<'a> Builder<'a> {
    /// `a, b, *c, d = value`
    ///
    /// In discard mode a literal array assigned to distinct simple
    /// variables is unrolled into plain stores. Otherwise the value is
    /// destructured with `expandarray`.
    pub(super) fn compile_masgn<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        masgn: &'f MultiAssign,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let Some(value) = masgn.value.as_deref() else {
            return Err(InternalError::unknown_node("multiple assignment", "without a value").into());
        };

        if popped
            && let NodeKind::Array(items) = &value.kind
            && Self::can_unroll(masgn, items)
        {
            let llen = masgn.targets.len();
            for (i, item) in items.iter().enumerate() {
                self.compile_node(ret, item, i >= llen, ctx)?;
            }
            for _ in items.len()..llen {
                self.emit(ret, line, Opcode::PutNil, vec![]);
            }
            for target in masgn.targets.iter().rev() {
                self.assign_target(ret, line, target, ctx)?;
            }
            return Ok(());
        }

        self.compile_node(ret, value, false, ctx)?;
        self.dup_unless(ret, line, popped);
        self.expand_targets(ret, line, masgn, ctx)
    }

    /// Every target is a distinct simple variable and no value is a splat.
    fn can_unroll(masgn: &MultiAssign, items: &[Node]) -> bool {
        if masgn.splat.is_some() || !masgn.post.is_empty() {
            return false;
        }
        if items.iter().any(|i| matches!(i.kind, NodeKind::Splat(_))) {
            return false;
        }
        let mut seen = FxHashSet::default();
        masgn
            .targets
            .iter()
            .all(|t| t.simple_name().is_some_and(|name| seen.insert(name)))
    }

    /// `( array -- )` into the targets of `masgn`.
    fn expand_targets<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        masgn: &'f MultiAssign,
        ctx: Context<'f>,
    ) -> Result<()> {
        let splat_target = match &masgn.splat {
            Some(SplatTarget::Target(target)) => {
                if matches!(**target, AssignTarget::Nested(_)) {
                    return Err(self.compile_error(CompileError::malformed_masgn, line));
                }
                Some(&**target)
            }
            Some(SplatTarget::Anonymous) | None => None,
        };
        let has_rest = splat_target.is_some() || !masgn.post.is_empty();

        self.emit(
            ret,
            line,
            Opcode::ExpandArray,
            vec![
                Operand::Num(masgn.targets.len() as i64),
                Operand::Num(i64::from(has_rest)),
            ],
        );
        for target in &masgn.targets {
            self.assign_target(ret, line, target, ctx)?;
        }

        if !masgn.post.is_empty() {
            // post-argument mode: the rest array first, then the trailing
            // targets in order
            let flag = 0x02 | i64::from(splat_target.is_some());
            self.emit(
                ret,
                line,
                Opcode::ExpandArray,
                vec![Operand::Num(masgn.post.len() as i64), Operand::Num(flag)],
            );
            if let Some(target) = splat_target {
                self.assign_target(ret, line, target, ctx)?;
            }
            for target in &masgn.post {
                self.assign_target(ret, line, target, ctx)?;
            }
        } else if let Some(target) = splat_target {
            self.assign_target(ret, line, target, ctx)?;
        }
        Ok(())
    }

    /// `( value -- )` into `target`.
    pub(super) fn assign_target<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        target: &'f AssignTarget,
        ctx: Context<'f>,
    ) -> Result<()> {
        match target {
            AssignTarget::Local(name) => self.set_local(ret, line, name)?,
            AssignTarget::IVar(name) => self.set_ivar(ret, line, name),
            AssignTarget::GVar(name) => {
                self.emit(ret, line, Opcode::SetGlobal, vec![Operand::Global(name.clone())])
            }
            AssignTarget::CVar(name) => {
                self.emit(ret, line, Opcode::SetClassVariable, vec![Operand::Id(name.clone())])
            }
            AssignTarget::Const(name) => self.store_const(ret, line, name),
            AssignTarget::Attr { recv, name, args } => {
                self.compile_node(ret, recv, false, ctx)?;
                for arg in args {
                    self.compile_node(ret, arg, false, ctx)?;
                }
                let argc = args.len() as i64;
                self.emit(ret, line, Opcode::TopN, vec![Operand::Num(argc + 1)]);
                self.send(ret, line, CallSite::new(name.as_str(), args.len() as u32 + 1, call_flag::ARGS_SIMPLE));
                self.emit(ret, line, Opcode::Pop, vec![]);
                self.emit(ret, line, Opcode::Pop, vec![]);
            }
            AssignTarget::Nested(inner) => self.expand_targets(ret, line, inner, ctx)?,
        }
        Ok(())
    }

    /// `( -- value )` of a simple variable or constant target.
    fn read_target(&mut self, ret: &mut Seq, line: u32, target: &AssignTarget) -> Result<()> {
        match target {
            AssignTarget::Local(name) => self.get_local(ret, line, name)?,
            AssignTarget::IVar(name) => self.get_ivar(ret, line, name),
            AssignTarget::GVar(name) => {
                self.emit(ret, line, Opcode::GetGlobal, vec![Operand::Global(name.clone())])
            }
            AssignTarget::CVar(name) => {
                self.emit(ret, line, Opcode::GetClassVariable, vec![Operand::Id(name.clone())])
            }
            AssignTarget::Const(name) => self.compile_const(ret, line, name, false),
            AssignTarget::Attr { .. } | AssignTarget::Nested(_) => {
                return Err(InternalError::unknown_node("compound target", "as a plain read").into());
            }
        }
        Ok(())
    }

    /// `target op= value`, `target ||= value`, `target &&= value`.
    pub(super) fn compile_op_asgn<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        target: &'f AssignTarget,
        update: OpUpdate<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let OpUpdate { op, value } = update;
        match target {
            AssignTarget::Attr { recv, name, args } => {
                let attr = AttrRef {
                    recv,
                    name,
                    args: args.as_slice(),
                };
                self.compile_attr_op_asgn(ret, line, attr, update, popped, ctx)
            }
            AssignTarget::Nested(_) => {
                Err(InternalError::unknown_node("nested target", "in operator assignment").into())
            }
            _ => {
                self.read_target(ret, line, target)?;
                match op {
                    OpAsgnOp::Short(kind) => {
                        let lfin = self.arena.new_label();
                        self.emit(ret, line, Opcode::Dup, vec![]);
                        let branch = match kind {
                            OpAsgnKind::Or => Opcode::BranchIf,
                            OpAsgnKind::And => Opcode::BranchUnless,
                        };
                        self.branch(ret, line, branch, lfin);
                        self.emit(ret, line, Opcode::Pop, vec![]);
                        self.compile_node(ret, value, false, ctx)?;
                        self.emit(ret, line, Opcode::Dup, vec![]);
                        self.assign_target(ret, line, target, ctx)?;
                        self.bind(ret, lfin);
                        self.pop_if(ret, line, popped);
                    }
                    OpAsgnOp::Binary(op) => {
                        self.compile_node(ret, value, false, ctx)?;
                        self.send(ret, line, CallSite::new(op.as_str(), 1, call_flag::ARGS_SIMPLE));
                        self.dup_unless(ret, line, popped);
                        self.assign_target(ret, line, target, ctx)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// `recv.name op= value` and `recv[args] op= value`. The getter is the
    /// setter name without its trailing `=`.
    fn compile_attr_op_asgn<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        attr: AttrRef<'f, [Node]>,
        update: OpUpdate<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let AttrRef {
            recv,
            name: setter,
            args,
        } = attr;
        let OpUpdate { op, value } = update;
        let getter = setter.strip_suffix('=').unwrap_or(setter);
        let argc = args.len() as u32;

        self.nil_unless(ret, line, popped);
        self.compile_node(ret, recv, false, ctx)?;
        for arg in args {
            self.compile_node(ret, arg, false, ctx)?;
        }
        self.emit(ret, line, Opcode::DupN, vec![Operand::Num(i64::from(argc) + 1)]);
        self.send(ret, line, CallSite::new(getter, argc, call_flag::ARGS_SIMPLE));

        match op {
            OpAsgnOp::Binary(op) => {
                self.compile_node(ret, value, false, ctx)?;
                self.send(ret, line, CallSite::new(op.as_str(), 1, call_flag::ARGS_SIMPLE));
                if !popped {
                    self.emit(ret, line, Opcode::SetN, vec![Operand::Num(i64::from(argc) + 2)]);
                }
                self.send(ret, line, CallSite::new(setter, argc + 1, call_flag::ARGS_SIMPLE));
                self.emit(ret, line, Opcode::Pop, vec![]);
            }
            OpAsgnOp::Short(kind) => {
                let keep = self.arena.new_label();
                let lfin = self.arena.new_label();
                self.emit(ret, line, Opcode::Dup, vec![]);
                let branch = match kind {
                    OpAsgnKind::Or => Opcode::BranchIf,
                    OpAsgnKind::And => Opcode::BranchUnless,
                };
                self.branch(ret, line, branch, keep);
                self.emit(ret, line, Opcode::Pop, vec![]);
                self.compile_node(ret, value, false, ctx)?;
                if !popped {
                    self.emit(ret, line, Opcode::SetN, vec![Operand::Num(i64::from(argc) + 2)]);
                }
                self.send(ret, line, CallSite::new(setter, argc + 1, call_flag::ARGS_SIMPLE));
                self.emit(ret, line, Opcode::Pop, vec![]);
                self.branch(ret, line, Opcode::Jump, lfin);

                // current value kept: drop receiver, arguments and the copy
                self.bind(ret, keep);
                if !popped {
                    self.emit(ret, line, Opcode::SetN, vec![Operand::Num(i64::from(argc) + 2)]);
                }
                self.emit(ret, line, Opcode::AdjustStack, vec![Operand::Num(i64::from(argc) + 2)]);
                self.bind(ret, lfin);
            }
        }
        Ok(())
    }

    /// `recv.name = value` and `recv[args] = value`. The value is the last
    /// argument; in keep mode it is also the result of the expression.
    pub(super) fn compile_attr_asgn<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        attr: AttrRef<'f, CallArgs>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let AttrRef { recv, name, args } = attr;
        self.nil_unless(ret, line, popped);
        self.compile_node(ret, recv, false, ctx)?;
        let setup = self.setup_args(ret, line, args, ctx)?;

        if !popped {
            let splat = setup.flags & call_flag::ARGS_SPLAT != 0;
            let blockarg = setup.flags & call_flag::ARGS_BLOCKARG != 0;
            let slots = i64::from(setup.argc) + i64::from(blockarg);
            if splat || blockarg {
                // copy the value out of the last argument
                if blockarg {
                    self.emit(ret, line, Opcode::TopN, vec![Operand::Num(1)]);
                } else {
                    self.emit(ret, line, Opcode::Dup, vec![]);
                }
                if splat {
                    self.put_value(ret, line, crate::lang::value::Value::Integer(-1), false);
                    self.send(ret, line, CallSite::new("[]", 1, call_flag::ARGS_SIMPLE));
                }
                self.emit(ret, line, Opcode::SetN, vec![Operand::Num(slots + 2)]);
                self.emit(ret, line, Opcode::Pop, vec![]);
            } else {
                self.emit(ret, line, Opcode::SetN, vec![Operand::Num(slots + 1)]);
            }
        }

        let mut flags = setup.flags;
        if setup.is_simple() {
            flags |= call_flag::ARGS_SIMPLE;
        }
        let mut ci = CallSite::new(name, setup.argc, flags);
        ci.kw_arg = setup.kw_arg;
        self.send(ret, line, ci);
        self.emit(ret, line, Opcode::Pop, vec![]);
        Ok(())
    }
}
