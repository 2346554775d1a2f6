//! Literals, collections and constant references.

use super::Builder;
use super::context::Context;
use crate::bytecode::compile_error::Result;
use crate::bytecode::ir::{LabelId, Operand, Seq};
use crate::bytecode::op::{Opcode, special_object};
use crate::lang::node::{Node, NodeKind};
use crate::lang::value::Value;

#[derive(Debug, Clone, Copy)]
pub(super) struct RangeBounds<'f> {
    pub low: &'f Node,
    pub high: &'f Node,
    pub exclusive: bool,
}

impl<'a> Builder<'a> {
    /// Value of a node that can be baked into a literal operand.
    pub(super) fn static_value(&self, node: &Node) -> Option<Value> {
        match &node.kind {
            NodeKind::Lit(v) => Some(v.clone()),
            NodeKind::Nil => Some(Value::Nil),
            NodeKind::True => Some(Value::True),
            NodeKind::False => Some(Value::False),
            NodeKind::Str(s) if self.options().frozen_string_literal => {
                Some(Value::String(s.clone()))
            }
            _ => None,
        }
    }

    pub(super) fn compile_str(&mut self, ret: &mut Seq, line: u32, s: &str, popped: bool) {
        if popped {
            return;
        }
        let opcode = if self.options().frozen_string_literal {
            Opcode::PutObject
        } else {
            Opcode::PutString
        };
        self.emit(ret, line, opcode, vec![Operand::Value(Value::String(s.to_string()))]);
    }

    pub(super) fn compile_dstr<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        parts: &'f [Node],
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        for part in parts {
            match &part.kind {
                NodeKind::Str(s) => {
                    self.emit(ret, part.line, Opcode::PutObject, vec![Operand::Value(Value::String(s.clone()))]);
                }
                _ => {
                    self.compile_node(ret, part, false, ctx)?;
                    self.emit(ret, part.line, Opcode::ToString, vec![]);
                }
            }
        }
        self.emit(ret, line, Opcode::ConcatStrings, vec![Operand::Num(parts.len() as i64)]);
        self.pop_if(ret, line, popped);
        Ok(())
    }

    pub(super) fn compile_array<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        items: &'f [Node],
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        if items.is_empty() {
            if !popped {
                self.emit(ret, line, Opcode::NewArray, vec![Operand::Num(0)]);
            }
            return Ok(());
        }

        let has_splat = items.iter().any(|i| matches!(i.kind, NodeKind::Splat(_)));
        if !has_splat {
            let statics: Option<Vec<Value>> = items.iter().map(|i| self.static_value(i)).collect();
            if let Some(values) = statics {
                if !popped {
                    self.emit(ret, line, Opcode::DupArray, vec![Operand::Value(Value::Array(values))]);
                }
                return Ok(());
            }
            if popped {
                for item in items {
                    self.compile_node(ret, item, true, ctx)?;
                }
                return Ok(());
            }
            for item in items {
                self.compile_node(ret, item, false, ctx)?;
            }
            self.emit(ret, line, Opcode::NewArray, vec![Operand::Num(items.len() as i64)]);
            return Ok(());
        }

        self.compile_splat_list(ret, line, items, ctx)?;
        self.pop_if(ret, line, popped);
        Ok(())
    }

    /// `[a, *b, c]` as concatenated parts. Leaves one array.
    ///
    /// Returns the number of parts; a single part that is a splat carries
    /// `splatarray true` so the result is always a fresh array.
    pub(super) fn compile_splat_list<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        items: &'f [Node],
        ctx: Context<'f>,
    ) -> Result<usize> {
        let mut parts = 0;
        let mut pending = 0;

        let flush = |this: &mut Self, ret: &mut Seq, pending: &mut i64, parts: &mut usize| {
            if *pending > 0 {
                this.emit(ret, line, Opcode::NewArray, vec![Operand::Num(*pending)]);
                *pending = 0;
                *parts += 1;
                if *parts > 1 {
                    this.emit(ret, line, Opcode::ConcatArray, vec![]);
                }
            }
        };

        for item in items {
            match &item.kind {
                NodeKind::Splat(inner) => {
                    flush(self, ret, &mut pending, &mut parts);
                    self.compile_node(ret, inner, false, ctx)?;
                    self.emit(ret, item.line, Opcode::SplatArray, vec![Operand::Value(Value::True)]);
                    parts += 1;
                    if parts > 1 {
                        self.emit(ret, item.line, Opcode::ConcatArray, vec![]);
                    }
                }
                _ => {
                    self.compile_node(ret, item, false, ctx)?;
                    pending += 1;
                }
            }
        }
        flush(self, ret, &mut pending, &mut parts);
        Ok(parts)
    }

    pub(super) fn compile_hash<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        pairs: &'f [(Node, Node)],
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        for (key, value) in pairs {
            self.compile_node(ret, key, false, ctx)?;
            self.compile_node(ret, value, false, ctx)?;
        }
        self.emit(ret, line, Opcode::NewHash, vec![Operand::Num(2 * pairs.len() as i64)]);
        self.pop_if(ret, line, popped);
        Ok(())
    }

    pub(super) fn compile_range<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        bounds: RangeBounds<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let RangeBounds { low, high, exclusive } = bounds;
        if let (NodeKind::Lit(Value::Integer(lo)), NodeKind::Lit(Value::Integer(hi))) =
            (&low.kind, &high.kind)
        {
            let range = Value::Range {
                low: *lo,
                high: *hi,
                exclusive,
            };
            self.put_value(ret, line, range, popped);
            return Ok(());
        }

        self.compile_node(ret, low, false, ctx)?;
        self.compile_node(ret, high, false, ctx)?;
        self.emit(ret, line, Opcode::NewRange, vec![Operand::Num(i64::from(exclusive))]);
        self.pop_if(ret, line, popped);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Constants
    // -------------------------------------------------------------------------

    /// Open an inline-cache region. Returns the label ending it.
    fn open_const_cache(&mut self, ret: &mut Seq, line: u32) -> Option<(LabelId, u32)> {
        if !self.options().inline_const_cache {
            return None;
        }
        let lend = self.arena.new_label();
        let ic = self.new_inline_cache();
        self.emit(
            ret,
            line,
            Opcode::GetInlineCache,
            vec![Operand::Label(lend), Operand::InlineCache(ic)],
        );
        Some((lend, ic))
    }

    fn close_const_cache(&mut self, ret: &mut Seq, line: u32, cache: Option<(LabelId, u32)>) {
        if let Some((lend, ic)) = cache {
            self.emit(ret, line, Opcode::SetInlineCache, vec![Operand::InlineCache(ic)]);
            self.bind(ret, lend);
        }
    }

    pub(super) fn compile_const(&mut self, ret: &mut Seq, line: u32, name: &str, popped: bool) {
        // getinlinecache pushes nil on a miss, which getconstant takes as
        // the lexical scope
        let cache = self.open_const_cache(ret, line);
        if cache.is_none() {
            self.emit(ret, line, Opcode::PutNil, vec![]);
        }
        self.emit(ret, line, Opcode::GetConstant, vec![Operand::Id(name.to_string())]);
        self.close_const_cache(ret, line, cache);
        self.pop_if(ret, line, popped);
    }

    pub(super) fn compile_top_const(&mut self, ret: &mut Seq, line: u32, name: &str, popped: bool) {
        let cache = self.open_const_cache(ret, line);
        if cache.is_some() {
            self.emit(ret, line, Opcode::Pop, vec![]);
        }
        self.emit(ret, line, Opcode::PutNil, vec![]);
        self.emit(ret, line, Opcode::GetConstant, vec![Operand::Id("Object".to_string())]);
        self.emit(ret, line, Opcode::GetConstant, vec![Operand::Id(name.to_string())]);
        self.close_const_cache(ret, line, cache);
        self.pop_if(ret, line, popped);
    }

    /// `( value -- )` into the constant `name` of the lexical scope.
    pub(super) fn store_const(&mut self, ret: &mut Seq, line: u32, name: &str) {
        self.emit(ret, line, Opcode::PutSpecialObject, vec![Operand::Num(special_object::CONST_BASE)]);
        self.emit(ret, line, Opcode::SetConstant, vec![Operand::Id(name.to_string())]);
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::compile::tests::{compile_method, compile_with, quiet};
    use crate::bytecode::iseq::IseqKind;
    use crate::bytecode::op::Opcode;
    use crate::bytecode::options::CompileOptions;
    use crate::lang::build::*;
    use crate::lang::node::{Node, NodeKind};
    use crate::lang::value::Value;

    #[test]
    fn test_static_array_uses_duparray() {
        let iseq = compile_method(&[], array(vec![int(1), sym("a"), nil()]));
        assert_eq!(iseq.opcodes(), vec![Opcode::DupArray, Opcode::Leave]);
        assert_eq!(
            iseq.literals[0],
            Value::Array(vec![Value::Integer(1), Value::Symbol("a".into()), Value::Nil])
        );
    }

    #[test]
    fn test_string_in_array_is_not_static_unless_frozen() {
        let iseq = compile_method(&[], array(vec![str_("s")]));
        assert_eq!(
            iseq.opcodes(),
            vec![Opcode::PutString, Opcode::NewArray, Opcode::Leave]
        );

        let frozen = CompileOptions {
            frozen_string_literal: true,
            ..quiet()
        };
        let iseq = compile_with(&[], array(vec![str_("s")]), IseqKind::Method, frozen).unwrap();
        assert_eq!(iseq.opcodes(), vec![Opcode::DupArray, Opcode::Leave]);
    }

    #[test]
    fn test_splat_array_concatenates_parts() {
        let iseq = compile_method(&["a"], array(vec![int(1), splat(lvar("a")), int(2)]));
        assert_eq!(
            iseq.opcodes(),
            vec![
                Opcode::PutObject,
                Opcode::NewArray,
                Opcode::GetLocal,
                Opcode::SplatArray,
                Opcode::ConcatArray,
                Opcode::PutObject,
                Opcode::NewArray,
                Opcode::ConcatArray,
                Opcode::Leave
            ]
        );
    }

    #[test]
    fn test_interpolated_string() {
        let dstr = Node::new(1, NodeKind::DStr(vec![str_("a"), lvar("x"), str_("b")]));
        let iseq = compile_method(&["x"], dstr);
        assert_eq!(
            iseq.opcodes(),
            vec![
                Opcode::PutObject,
                Opcode::GetLocal,
                Opcode::ToString,
                Opcode::PutObject,
                Opcode::ConcatStrings,
                Opcode::Leave
            ]
        );
    }

    #[test]
    fn test_integer_range_is_literal() {
        let range = Node::new(
            1,
            NodeKind::Range {
                low: Box::new(int(1)),
                high: Box::new(int(3)),
                exclusive: true,
            },
        );
        let iseq = compile_method(&[], range);
        assert_eq!(iseq.opcodes(), vec![Opcode::PutObject, Opcode::Leave]);
        assert_eq!(
            iseq.literals[0],
            Value::Range {
                low: 1,
                high: 3,
                exclusive: true
            }
        );
    }

    #[test]
    fn test_constant_uses_inline_cache() {
        let iseq = compile_method(&[], konst("Foo"));
        assert_eq!(
            iseq.opcodes(),
            vec![
                Opcode::GetInlineCache,
                Opcode::GetConstant,
                Opcode::SetInlineCache,
                Opcode::Leave
            ]
        );
        assert_eq!(iseq.inline_cache_size, 1);
        assert_eq!(iseq.identifiers, vec!["Foo".to_string()]);

        let plain = CompileOptions {
            inline_const_cache: false,
            ..quiet()
        };
        let iseq = compile_with(&[], konst("Foo"), IseqKind::Method, plain).unwrap();
        assert_eq!(
            iseq.opcodes(),
            vec![Opcode::PutNil, Opcode::GetConstant, Opcode::Leave]
        );
        assert_eq!(iseq.inline_cache_size, 0);
    }

    #[test]
    fn test_instance_variables_share_cache_per_name() {
        let body = array(vec![ivar("@a"), ivar("@b"), ivar("@a")]);
        let iseq = compile_method(&[], body);
        assert_eq!(iseq.inline_cache_size, 2);
        assert_eq!(
            iseq.opcodes(),
            vec![
                Opcode::GetInstanceVariable,
                Opcode::GetInstanceVariable,
                Opcode::GetInstanceVariable,
                Opcode::NewArray,
                Opcode::Leave
            ]
        );
    }
}
