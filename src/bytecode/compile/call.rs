//! Method calls, blocks, `yield` and `super`.

use super::context::{self, Context};
use super::{Builder, ChildBody};
use crate::bytecode::compile_error::{CompileError, InternalError, Result};
use crate::bytecode::ir::{Operand, Seq};
use crate::bytecode::iseq::{CallSite, CatchKind, IseqKind, call_flag};
use crate::bytecode::op::Opcode;
use crate::lang::node::{CallArgs, Node, NodeKind, Scope};
use crate::lang::value::Value;

/// A method call as it appears in the tree.
#[derive(Debug, Clone, Copy)]
pub(super) struct CallParts<'f> {
    /// `None` calls on `self`.
    pub recv: Option<&'f Node>,
    pub name: &'f str,
    pub args: &'f CallArgs,
    pub block: Option<&'f Scope>,
}

/// Argument shape pushed by [`Builder::setup_args`].
pub(super) struct ArgSetup {
    pub argc: u32,
    pub flags: u32,
    pub kw_arg: Vec<String>,
}

impl ArgSetup {
    /// Plain positional arguments only.
    pub fn is_simple(&self) -> bool {
        self.flags & (call_flag::ARGS_SPLAT | call_flag::ARGS_BLOCKARG | call_flag::KWARG) == 0
    }
}

impl<'a> Builder<'a> {
    /// Push the arguments of a call.
    ///
    /// Positional arguments up to the first splat are pushed one by one;
    /// the splat and everything after it become a single array. Keyword
    /// values follow, then the block argument.
    pub(super) fn setup_args<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        args: &'f CallArgs,
        ctx: Context<'f>,
    ) -> Result<ArgSetup> {
        let mut argc = 0u32;
        let mut flags = 0u32;

        let first_splat = args
            .args
            .iter()
            .position(|a| matches!(a.kind, NodeKind::Splat(_)));
        let (leading, tail) = args.args.split_at(first_splat.unwrap_or(args.args.len()));
        for arg in leading {
            self.compile_node(ret, arg, false, ctx)?;
            argc += 1;
        }
        if !tail.is_empty() {
            match tail {
                [
                    Node {
                        kind: NodeKind::Splat(inner),
                        ..
                    },
                ] => {
                    // the callee copies the array, no need to dup it here
                    self.compile_node(ret, inner, false, ctx)?;
                    self.emit(ret, line, Opcode::SplatArray, vec![Operand::Value(Value::False)]);
                }
                _ => {
                    self.compile_splat_list(ret, line, tail, ctx)?;
                }
            }
            argc += 1;
            flags |= call_flag::ARGS_SPLAT;
        }

        let mut kw_arg = Vec::with_capacity(args.keywords.len());
        for (name, value) in &args.keywords {
            self.compile_node(ret, value, false, ctx)?;
            kw_arg.push(name.clone());
            argc += 1;
        }
        if !kw_arg.is_empty() {
            flags |= call_flag::KWARG;
        }

        if let Some(block) = &args.block_pass {
            self.compile_node(ret, block, false, ctx)?;
            flags |= call_flag::ARGS_BLOCKARG;
        }

        Ok(ArgSetup {
            argc,
            flags,
            kw_arg,
        })
    }

    /// `recv.name(args) { block }`
    ///
    /// With a block, the block scope is compiled first and a break catch
    /// entry covers the whole call so that `break` in the block resumes
    /// right after it with the break value.
    pub(super) fn compile_call<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        call: CallParts<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let CallParts {
            recv,
            name,
            args,
            block,
        } = call;
        let block_iseq = match block {
            Some(scope) => {
                let name = format!("block in {}", self.base_label());
                let child = self.new_child(
                    name,
                    IseqKind::Block,
                    scope.locals.clone(),
                    scope.line,
                    ChildBody::Scope(scope),
                    ctx,
                )?;
                Some(child)
            }
            None => None,
        };

        let retry_labels = block_iseq.map(|_| (self.arena.new_label(), self.arena.new_label()));
        if let Some((retry, _)) = retry_labels {
            self.bind(ret, retry);
        }

        let mut flags = 0;
        match recv {
            Some(recv) => self.compile_node(ret, recv, false, ctx)?,
            None => {
                self.emit(ret, line, Opcode::PutSelf, vec![]);
                flags |= call_flag::FCALL;
                if args.is_empty() && block.is_none() {
                    flags |= call_flag::VCALL;
                }
            }
        }

        let setup = self.setup_args(ret, line, args, ctx)?;
        if setup.is_simple() && block_iseq.is_none() {
            flags |= call_flag::ARGS_SIMPLE;
        }
        if block_iseq.is_some() {
            flags |= call_flag::BLOCKISEQ;
        }
        let simple = setup.is_simple();
        let mut ci = CallSite::new(name, setup.argc, flags | setup.flags);
        ci.kw_arg = setup.kw_arg;
        ci.block = block_iseq;
        tracing::trace!(mid = name, argc = ci.argc, simple, "call site");
        self.send(ret, line, ci);

        if let (Some(child), Some((retry, retry_end))) = (block_iseq, retry_labels) {
            self.bind(ret, retry_end);
            self.add_catch(CatchKind::Break, retry, retry_end, retry_end, Some(child));
        }
        self.pop_if(ret, line, popped);
        Ok(())
    }

    pub(super) fn compile_yield<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        args: &'f CallArgs,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        if matches!(
            context::method_level_kind(self.kind, self.parent),
            Some(IseqKind::Top | IseqKind::Main | IseqKind::Class)
        ) {
            return Err(self.compile_error(CompileError::invalid_yield, line));
        }
        if args.block_pass.is_some() {
            return Err(InternalError::unknown_node("block argument", "in yield").into());
        }

        let setup = self.setup_args(ret, line, args, ctx)?;
        let mut flags = setup.flags;
        if setup.is_simple() {
            flags |= call_flag::ARGS_SIMPLE;
        }
        let mut ci = CallSite::new("", setup.argc, flags);
        ci.kw_arg = setup.kw_arg;
        self.emit(ret, line, Opcode::InvokeBlock, vec![Operand::CallInfo(ci)]);
        self.pop_if(ret, line, popped);
        Ok(())
    }

    /// `super(args)`, or a bare `super` forwarding the parameters of the
    /// enclosing method.
    pub(super) fn compile_super<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        args: Option<&'f CallArgs>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        self.emit(ret, line, Opcode::PutSelf, vec![]);

        let ci = match args {
            Some(args) => {
                let setup = self.setup_args(ret, line, args, ctx)?;
                let mut flags = setup.flags | call_flag::SUPER | call_flag::FCALL;
                if setup.is_simple() {
                    flags |= call_flag::ARGS_SIMPLE;
                }
                let mut ci = CallSite::new("", setup.argc, flags);
                ci.kw_arg = setup.kw_arg;
                ci
            }
            None => self.zsuper_args(ret, line),
        };
        self.emit(ret, line, Opcode::InvokeSuper, vec![Operand::CallInfo(ci)]);
        self.pop_if(ret, line, popped);
        Ok(())
    }

    /// Push the current values of the method's parameters for a bare
    /// `super`.
    ///
    /// A rest parameter is splatted with the post parameters appended to
    /// it. Keywords travel as a single hash flagged `KW_SPLAT`.
    fn zsuper_args(&mut self, ret: &mut Seq, line: u32) -> CallSite {
        let mut flags = call_flag::ZSUPER | call_flag::SUPER | call_flag::FCALL;
        let (Some(params), Some(level)) = (
            self.super_params.clone(),
            context::method_level_depth(self.kind, self.parent),
        ) else {
            // outside a method the runtime raises, nothing to forward
            return CallSite::new("", 0, flags);
        };
        let getlocal = |this: &mut Self, ret: &mut Seq, slot: usize| {
            this.emit(
                ret,
                line,
                Opcode::GetLocal,
                vec![Operand::Num(slot as i64), Operand::Num(level as i64)],
            );
        };

        let mut argc = 0u32;
        for &slot in &params.lead {
            getlocal(self, ret, slot);
            argc += 1;
        }

        match params.rest {
            Some(rest) => {
                getlocal(self, ret, rest);
                self.emit(ret, line, Opcode::SplatArray, vec![Operand::Value(Value::False)]);
                if !params.post.is_empty() {
                    for &slot in &params.post {
                        getlocal(self, ret, slot);
                    }
                    self.emit(ret, line, Opcode::NewArray, vec![Operand::Num(params.post.len() as i64)]);
                    self.emit(ret, line, Opcode::ConcatArray, vec![]);
                }
                argc += 1;
                flags |= call_flag::ARGS_SPLAT;
            }
            None => {
                for &slot in &params.post {
                    getlocal(self, ret, slot);
                    argc += 1;
                }
            }
        }

        if !params.keywords.is_empty() || params.kwrest.is_some() {
            if !params.keywords.is_empty() {
                for (name, slot) in &params.keywords {
                    self.emit(ret, line, Opcode::PutObject, vec![Operand::Value(Value::Symbol(name.clone()))]);
                    getlocal(self, ret, *slot);
                }
                let len = 2 * params.keywords.len() as i64;
                self.emit(ret, line, Opcode::NewHash, vec![Operand::Num(len)]);
            }
            if let Some(kwrest) = params.kwrest {
                getlocal(self, ret, kwrest);
                if !params.keywords.is_empty() {
                    self.send(ret, line, CallSite::new("merge", 1, call_flag::ARGS_SIMPLE));
                }
            }
            argc += 1;
            flags |= call_flag::KW_SPLAT;
        }

        if let Some(block) = params.block {
            getlocal(self, ret, block);
            flags |= call_flag::ARGS_BLOCKARG;
        }

        CallSite::new("", argc, flags)
    }
}
