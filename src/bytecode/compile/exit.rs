//! `break`, `next`, `redo`, `retry`, `return` and ensure inlining.
//!
//! An exit that jumps inside the current scope first adjusts the stack to
//! the target's depth, then inlines every ensure body between it and the
//! target. An exit that leaves the scope becomes a `throw` with a tag.

use super::Builder;
use super::context::{self, Context, Escape};
use crate::bytecode::compile_error::{CompileError, Result};
use crate::bytecode::ir::{Operand, Seq};
use crate::bytecode::iseq::IseqKind;
use crate::bytecode::op::{Opcode, event, throw_tag};
use crate::lang::node::Node;

impl<'a> Builder<'a> {
    /// Inline the ensure bodies between here and the exit target.
    ///
    /// Each inlined body splits the protected range of its ensure construct
    /// so the copy is not covered by its own catch entry. A loop marker ends
    /// the walk unless the exit is a `return`.
    pub(super) fn add_ensure_iseq<'f>(
        &mut self,
        ret: &mut Seq,
        ctx: Context<'f>,
        is_return: bool,
    ) -> Result<()> {
        let mut frame = ctx.ensure;
        while let Some(f) = frame {
            match (f.body, f.range) {
                (Some(body), Some(range)) => {
                    let lstart = self.arena.new_label();
                    let lend = self.arena.new_label();
                    let ranges = &mut self.ensure_ranges[range];
                    if let Some(last) = ranges.last_mut() {
                        let old_end = last.1;
                        last.1 = lstart;
                        ranges.push((lend, old_end));
                    }

                    self.bind(ret, lstart);
                    let outer = Context {
                        ensure: f.prev,
                        ..ctx
                    };
                    self.compile_node(ret, body, true, outer)?;
                    self.bind(ret, lend);
                }
                _ => {
                    if !is_return {
                        break;
                    }
                }
            }
            frame = f.prev;
        }
        Ok(())
    }

    /// Whether the ensure bodies an exit would inline all lie inside the
    /// innermost rescue-protected body. A copy of an outer ensure there
    /// would run under the rescue handler, so such exits throw instead.
    fn can_add_ensure_iseq(ctx: Context<'_>, is_return: bool) -> bool {
        let mut frame = ctx.ensure;
        while let Some(f) = frame {
            if f.body.is_some() {
                if f.depth < ctx.rescue_floor {
                    return false;
                }
            } else if !is_return {
                break;
            }
            frame = f.prev;
        }
        true
    }

    pub(super) fn compile_break<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        value: Option<&'f Node>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let while_labels = ctx.loop_.filter(|l| l.is_while());
        if let Some(labels) = while_labels
            && Self::can_add_ensure_iseq(ctx, false)
        {
            let splabel = self.arena.new_label();
            self.bind(ret, splabel);
            self.arena.adjust(ret, line, labels.redo);
            self.compile_opt(ret, line, value, false, ctx)?;
            self.add_ensure_iseq(ret, ctx, false)?;
            self.branch(ret, line, Opcode::Jump, labels.end);
            self.arena.adjust_restore(ret, splabel);
            self.nil_unless(ret, line, popped);
            return Ok(());
        }
        if while_labels.is_some() {
            return self.throw_value(ret, line, value, throw_tag::NO_ESCAPE | throw_tag::BREAK, popped, ctx);
        }

        if self.kind == IseqKind::Block {
            return self.throw_value(ret, line, value, throw_tag::BREAK, popped, ctx);
        }

        match context::find_escape(self.kind, self.parent) {
            Some(Escape::Loop) => {
                self.throw_value(ret, line, value, throw_tag::NO_ESCAPE | throw_tag::BREAK, popped, ctx)
            }
            Some(Escape::Block(level)) => {
                let tag = (level << throw_tag::LEVEL_SHIFT) | throw_tag::BREAK;
                self.throw_value(ret, line, value, tag, popped, ctx)
            }
            Some(Escape::Eval) => Err(CompileError::escape_from_eval("break", self.path(), line).into()),
            None => Err(self.compile_error(CompileError::invalid_break, line)),
        }
    }

    pub(super) fn compile_next<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        value: Option<&'f Node>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        if let Some(labels) = ctx.loop_
            && Self::can_add_ensure_iseq(ctx, false)
        {
            let splabel = self.arena.new_label();
            self.bind(ret, splabel);
            if labels.is_while() {
                self.compile_opt(ret, line, value, false, ctx)?;
                self.add_ensure_iseq(ret, ctx, false)?;
                self.arena.adjust(ret, line, labels.redo);
                self.branch(ret, line, Opcode::Jump, labels.start);
            } else {
                self.arena.adjust(ret, line, Some(labels.start));
                self.compile_opt(ret, line, value, false, ctx)?;
                self.add_ensure_iseq(ret, ctx, false)?;
                self.branch(ret, line, Opcode::Jump, labels.end);
            }
            self.arena.adjust_restore(ret, splabel);
            self.nil_unless(ret, line, popped);
            return Ok(());
        }
        if ctx.loop_.is_some() {
            return self.throw_value(ret, line, value, throw_tag::NO_ESCAPE | throw_tag::NEXT, popped, ctx);
        }

        match context::find_escape(self.kind, self.parent) {
            Some(Escape::Loop | Escape::Block(_)) => {
                self.throw_value(ret, line, value, throw_tag::NO_ESCAPE | throw_tag::NEXT, popped, ctx)
            }
            Some(Escape::Eval) => Err(CompileError::escape_from_eval("next", self.path(), line).into()),
            None => Err(self.compile_error(CompileError::invalid_next, line)),
        }
    }

    pub(super) fn compile_redo<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        if let Some(labels) = ctx.loop_
            && Self::can_add_ensure_iseq(ctx, false)
        {
            let splabel = self.arena.new_label();
            self.bind(ret, splabel);
            match labels.redo {
                Some(redo) => {
                    self.arena.adjust(ret, line, Some(redo));
                    self.add_ensure_iseq(ret, ctx, false)?;
                    self.branch(ret, line, Opcode::Jump, redo);
                }
                None => {
                    self.add_ensure_iseq(ret, ctx, false)?;
                    self.arena.adjust(ret, line, Some(labels.start));
                    self.branch(ret, line, Opcode::Jump, labels.start);
                }
            }
            self.arena.adjust_restore(ret, splabel);
            self.nil_unless(ret, line, popped);
            return Ok(());
        }
        if ctx.loop_.is_some() {
            return self.throw_value(ret, line, None, throw_tag::NO_ESCAPE | throw_tag::REDO, popped, ctx);
        }

        match context::find_escape(self.kind, self.parent) {
            Some(Escape::Loop | Escape::Block(_)) => {
                self.throw_value(ret, line, None, throw_tag::NO_ESCAPE | throw_tag::REDO, popped, ctx)
            }
            Some(Escape::Eval) => Err(CompileError::escape_from_eval("redo", self.path(), line).into()),
            None => Err(self.compile_error(CompileError::invalid_redo, line)),
        }
    }

    pub(super) fn compile_retry(&mut self, ret: &mut Seq, line: u32, popped: bool) -> Result<()> {
        if self.kind != IseqKind::Rescue {
            return Err(self.compile_error(CompileError::invalid_retry, line));
        }
        self.emit(ret, line, Opcode::PutNil, vec![]);
        self.emit(ret, line, Opcode::Throw, vec![Operand::Num(throw_tag::RETRY)]);
        self.pop_if(ret, line, popped);
        Ok(())
    }

    pub(super) fn compile_return<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        value: Option<&'f Node>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let outer = context::non_handler_kind(self.kind, self.parent);
        match outer {
            Some(IseqKind::Class) => return Err(self.compile_error(CompileError::invalid_return, line)),
            Some(IseqKind::Top | IseqKind::Main) => {
                if value.is_some() {
                    tracing::warn!(path = self.path(), line, "argument of top-level return is ignored");
                }
                if !Self::can_add_ensure_iseq(ctx, true) {
                    return self.throw_value(ret, line, None, throw_tag::RETURN, popped, ctx);
                }
                return self.leave_here(ret, line, None, popped, ctx);
            }
            _ => {}
        }

        if self.kind == IseqKind::Method && Self::can_add_ensure_iseq(ctx, true) {
            return self.leave_here(ret, line, value, popped, ctx);
        }
        self.throw_value(ret, line, value, throw_tag::RETURN, popped, ctx)
    }

    /// Return from the current frame with `leave`, running every ensure.
    fn leave_here<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        value: Option<&'f Node>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let splabel = self.arena.new_label();
        self.bind(ret, splabel);
        self.arena.adjust(ret, line, None);
        self.compile_opt(ret, line, value, false, ctx)?;
        self.add_ensure_iseq(ret, ctx, true)?;
        if self.kind == IseqKind::Method {
            self.trace(ret, line, event::RETURN);
        }
        self.emit(ret, line, Opcode::Leave, vec![]);
        self.arena.adjust_restore(ret, splabel);
        self.nil_unless(ret, line, popped);
        Ok(())
    }

    /// `( -- value )` thrown with `tag`.
    fn throw_value<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        value: Option<&'f Node>,
        tag: i64,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        self.compile_opt(ret, line, value, false, ctx)?;
        self.emit(ret, line, Opcode::Throw, vec![Operand::Num(tag)]);
        self.pop_if(ret, line, popped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::compile::tests::{compile_method, compile_with, quiet};
    use crate::bytecode::compile_error::{CompileErrorKind, Error};
    use crate::bytecode::iseq::{CatchKind, IseqKind, Word};
    use crate::bytecode::op::{Opcode, throw_tag};
    use crate::bytecode::options::CompileOptions;
    use crate::lang::build::*;

    fn compile_error_kind(result: crate::bytecode::compile_error::Result<impl Sized>) -> CompileErrorKind {
        match result {
            Err(Error::Compile(e)) => e.kind,
            Err(other) => panic!("expected a compile error, got {}", other),
            Ok(_) => panic!("expected a compile error"),
        }
    }

    #[test]
    fn test_top_level_break_is_invalid() {
        let result = compile_with(&[], brk(None), IseqKind::Top, quiet());
        assert_eq!(compile_error_kind(result), CompileErrorKind::InvalidBreak);
    }

    #[test]
    fn test_next_and_redo_outside_loop_are_invalid() {
        let result = compile_with(&[], next(None), IseqKind::Method, quiet());
        assert_eq!(compile_error_kind(result), CompileErrorKind::InvalidNext);
        let result = compile_with(&[], redo(), IseqKind::Method, quiet());
        assert_eq!(compile_error_kind(result), CompileErrorKind::InvalidRedo);
    }

    #[test]
    fn test_retry_outside_rescue_is_invalid() {
        let result = compile_with(&[], retry(), IseqKind::Method, quiet());
        assert_eq!(compile_error_kind(result), CompileErrorKind::InvalidRetry);
    }

    #[test]
    fn test_break_in_eval_cannot_escape() {
        let result = compile_with(&[], brk(None), IseqKind::Eval, quiet());
        assert!(matches!(
            compile_error_kind(result),
            CompileErrorKind::EscapeFromEval("break")
        ));
    }

    #[test]
    fn test_return_in_class_body_is_invalid() {
        let result = compile_with(&[], ret(None), IseqKind::Class, quiet());
        assert_eq!(compile_error_kind(result), CompileErrorKind::InvalidReturn);
    }

    #[test]
    fn test_break_inside_while_jumps() {
        let body = stmts(vec![while_(tru(), brk(Some(int(7)))), nil()]);
        let iseq = compile_with(&[], body, IseqKind::Method, CompileOptions::none()).unwrap();
        assert!(!iseq.opcodes().contains(&Opcode::Throw));
        crate::bytecode::stack_check::check(&iseq).unwrap();
    }

    #[test]
    fn test_break_in_block_throws() {
        let block = scope(&[], brk(Some(int(1))));
        let iseq = compile_method(&[], iter(self_(), "each", block));
        let child = &iseq.children[0];
        let ops = child.opcodes();
        let at = ops.iter().position(|o| *o == Opcode::Throw).unwrap();
        let pos = child.instruction_boundaries()[at];
        assert_eq!(child.code[pos + 1], Word::Num(throw_tag::BREAK));
    }

    #[test]
    fn test_break_from_rescue_in_block_uses_level() {
        let block = scope(&[], rescue(nil(), brk(None)));
        let iseq = compile_method(&[], iter(self_(), "each", block));
        let rescue_child = &iseq.children[0].children[0];
        assert_eq!(rescue_child.kind, IseqKind::Rescue);
        let expected = Word::Num((1 << throw_tag::LEVEL_SHIFT) | throw_tag::BREAK);
        assert!(rescue_child.code.contains(&expected));
    }

    #[test]
    fn test_next_from_rescue_in_while_does_not_escape() {
        let body = stmts(vec![while_(tru(), rescue(nil(), next(None))), nil()]);
        let iseq = compile_method(&[], body);
        let rescue_child = &iseq.children[0];
        let expected = Word::Num(throw_tag::NO_ESCAPE | throw_tag::NEXT);
        assert!(rescue_child.code.contains(&expected));
    }

    #[test]
    fn test_return_in_block_throws() {
        let block = scope(&[], ret(Some(int(1))));
        let iseq = compile_method(&[], iter(self_(), "each", block));
        assert!(iseq.children[0].code.contains(&Word::Num(throw_tag::RETURN)));
    }

    #[test]
    fn test_return_inside_ensure_inlines_body_and_splits_range() {
        let body = ensure(ret(Some(int(1))), fcall("cleanup", vec![]));
        let iseq = compile_with(&[], body, IseqKind::Method, CompileOptions::none()).unwrap();

        let cleanups = iseq.call_infos.iter().filter(|ci| ci.mid == "cleanup").count();
        assert_eq!(cleanups, 2);

        let entries: Vec<_> = iseq
            .catch_table
            .iter()
            .filter(|c| c.kind == CatchKind::Ensure)
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cont, entries[1].cont);
        assert_eq!(entries[0].child, Some(0));
        assert!(entries[0].end < entries[1].start);

        // the inlined copy sits in the gap between the two ranges
        let gap = entries[0].end as usize..entries[1].start as usize;
        let sends_in_gap = iseq
            .instruction_boundaries()
            .into_iter()
            .filter(|pc| gap.contains(pc))
            .filter(|pc| iseq.code[*pc] == Word::Op(Opcode::Send))
            .count();
        assert_eq!(sends_in_gap, 1);
        crate::bytecode::stack_check::check(&iseq).unwrap();
    }

    #[test]
    fn test_loop_marker_stops_break_before_outer_ensure() {
        let body = ensure(
            stmts(vec![while_(tru(), brk(None)), nil()]),
            fcall("cleanup", vec![]),
        );
        let iseq = compile_with(&[], body, IseqKind::Method, CompileOptions::none()).unwrap();
        let cleanups = iseq.call_infos.iter().filter(|ci| ci.mid == "cleanup").count();
        assert_eq!(cleanups, 1);
        let ensures = iseq.catch_table.iter().filter(|c| c.kind == CatchKind::Ensure).count();
        assert_eq!(ensures, 1);
    }

    #[test]
    fn test_return_under_rescue_throws_past_outer_ensure() {
        let body = ensure(rescue(ret(Some(int(1))), nil()), fcall("cleanup", vec![]));
        let iseq = compile_with(&[], body, IseqKind::Method, CompileOptions::none()).unwrap();
        assert!(iseq.code().contains(&Word::Num(throw_tag::RETURN)));
        let cleanups = iseq.call_infos.iter().filter(|ci| ci.mid == "cleanup").count();
        assert_eq!(cleanups, 1);
        let ensures = iseq.catch_table.iter().filter(|c| c.kind == CatchKind::Ensure).count();
        assert_eq!(ensures, 1);
        crate::bytecode::stack_check::check(&iseq).unwrap();
    }

    #[test]
    fn test_return_inlines_ensure_nested_in_rescue_body() {
        let body = rescue(ensure(ret(Some(int(1))), fcall("cleanup", vec![])), nil());
        let iseq = compile_with(&[], body, IseqKind::Method, CompileOptions::none()).unwrap();
        assert!(!iseq.opcodes().contains(&Opcode::Throw));
        let cleanups = iseq.call_infos.iter().filter(|ci| ci.mid == "cleanup").count();
        assert_eq!(cleanups, 2);
        crate::bytecode::stack_check::check(&iseq).unwrap();
    }

    #[test]
    fn test_break_under_rescue_throws_within_loop() {
        let looped = ensure(rescue(brk(None), nil()), fcall("cleanup", vec![]));
        let body = stmts(vec![while_(tru(), looped), nil()]);
        let iseq = compile_with(&[], body, IseqKind::Method, CompileOptions::none()).unwrap();
        let expected = Word::Num(throw_tag::NO_ESCAPE | throw_tag::BREAK);
        assert!(iseq.code().contains(&expected));
        let cleanups = iseq.call_infos.iter().filter(|ci| ci.mid == "cleanup").count();
        assert_eq!(cleanups, 1);
        crate::bytecode::stack_check::check(&iseq).unwrap();
    }

    #[test]
    fn test_break_under_rescue_without_ensure_still_jumps() {
        let body = stmts(vec![while_(tru(), rescue(brk(None), nil())), nil()]);
        let iseq = compile_with(&[], body, IseqKind::Method, CompileOptions::none()).unwrap();
        assert!(!iseq.opcodes().contains(&Opcode::Throw));
    }
}
