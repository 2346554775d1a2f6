//! `def`, `class` and `module`.

use super::context::Context;
use super::{Builder, ChildBody};
use crate::bytecode::compile_error::Result;
use crate::bytecode::ir::{Operand, Seq};
use crate::bytecode::iseq::IseqKind;
use crate::bytecode::op::{Opcode, define_class, special_object};
use crate::lang::node::{Node, Scope};
use crate::lang::value::Value;

#[derive(Debug, Clone, Copy)]
pub(super) struct ClassParts<'f> {
    pub name: &'f str,
    pub superclass: Option<&'f Node>,
    pub scope: &'f Scope,
}

impl<'a> Builder<'a> {
    /// The method body becomes a child scope; the expression's value is
    /// the method name as a symbol.
    pub(super) fn compile_def<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        name: &str,
        scope: &'f Scope,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let child = self.new_child(
            name.to_string(),
            IseqKind::Method,
            scope.locals.clone(),
            scope.line,
            ChildBody::Scope(scope),
            ctx,
        )?;
        self.emit(
            ret,
            line,
            Opcode::DefineMethod,
            vec![Operand::Id(name.to_string()), Operand::Iseq(child)],
        );
        self.put_value(ret, line, Value::Symbol(name.to_string()), popped);
        Ok(())
    }

    pub(super) fn compile_class<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        class: ClassParts<'f>,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let ClassParts {
            name,
            superclass,
            scope,
        } = class;
        let child = self.new_child(
            format!("<class:{}>", name),
            IseqKind::Class,
            scope.locals.clone(),
            scope.line,
            ChildBody::Scope(scope),
            ctx,
        )?;

        self.emit(ret, line, Opcode::PutSpecialObject, vec![Operand::Num(special_object::CONST_BASE)]);
        let mut flags = define_class::CLASS;
        match superclass {
            Some(sup) => {
                self.compile_node(ret, sup, false, ctx)?;
                flags |= define_class::HAS_SUPERCLASS;
            }
            None => self.emit(ret, line, Opcode::PutNil, vec![]),
        }
        self.define_class(ret, line, name, child, flags, popped);
        Ok(())
    }

    pub(super) fn compile_module<'f>(
        &mut self,
        ret: &mut Seq,
        line: u32,
        name: &str,
        scope: &'f Scope,
        popped: bool,
        ctx: Context<'f>,
    ) -> Result<()> {
        let child = self.new_child(
            format!("<module:{}>", name),
            IseqKind::Class,
            scope.locals.clone(),
            scope.line,
            ChildBody::Scope(scope),
            ctx,
        )?;

        self.emit(ret, line, Opcode::PutSpecialObject, vec![Operand::Num(special_object::CONST_BASE)]);
        self.emit(ret, line, Opcode::PutNil, vec![]);
        self.define_class(ret, line, name, child, define_class::MODULE, popped);
        Ok(())
    }

    /// `( cbase super -- class )`
    fn define_class(&mut self, ret: &mut Seq, line: u32, name: &str, child: u32, flags: i64, popped: bool) {
        self.emit(
            ret,
            line,
            Opcode::DefineClass,
            vec![
                Operand::Id(name.to_string()),
                Operand::Iseq(child),
                Operand::Num(flags),
            ],
        );
        self.pop_if(ret, line, popped);
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::compile::tests::{compile_with, quiet};
    use crate::bytecode::iseq::{IseqKind, Word};
    use crate::bytecode::op::{Opcode, define_class};
    use crate::bytecode::options::CompileOptions;
    use crate::lang::build::*;
    use crate::lang::node::{Node, NodeKind};
    use crate::lang::value::Value;

    #[test]
    fn test_def_defines_method_and_returns_symbol() {
        let body = def("greet", scope(&[], str_("hi")));
        let iseq = compile_with(&[], body, IseqKind::Top, quiet()).unwrap();
        assert_eq!(
            iseq.opcodes(),
            vec![Opcode::DefineMethod, Opcode::PutObject, Opcode::Leave]
        );
        assert_eq!(iseq.literals, vec![Value::Symbol("greet".to_string())]);

        let method = &iseq.children[0];
        assert_eq!(method.kind, IseqKind::Method);
        assert_eq!(method.name, "greet");
        assert_eq!(iseq.code[2], Word::Iseq(0));
    }

    #[test]
    fn test_class_with_superclass() {
        let body = Node::new(
            1,
            NodeKind::Class {
                name: "Point".to_string(),
                superclass: Some(Box::new(konst("Base"))),
                scope: Box::new(scope(&[], nil())),
            },
        );
        let iseq = compile_with(&[], body, IseqKind::Top, CompileOptions::none()).unwrap();
        let ops = iseq.opcodes();
        assert_eq!(ops.first(), Some(&Opcode::PutSpecialObject));
        let at = ops.iter().position(|o| *o == Opcode::DefineClass).unwrap();
        let pos = iseq.instruction_boundaries()[at];
        assert_eq!(
            iseq.code[pos + 3],
            Word::Num(define_class::CLASS | define_class::HAS_SUPERCLASS)
        );
        assert_eq!(iseq.children[0].name, "<class:Point>");
        assert_eq!(iseq.children[0].kind, IseqKind::Class);
    }

    #[test]
    fn test_module_definition() {
        let body = Node::new(
            1,
            NodeKind::Module {
                name: "Util".to_string(),
                scope: Box::new(scope(&[], nil())),
            },
        );
        let iseq = compile_with(&[], body, IseqKind::Top, CompileOptions::none()).unwrap();
        assert_eq!(
            iseq.opcodes(),
            vec![
                Opcode::PutSpecialObject,
                Opcode::PutNil,
                Opcode::DefineClass,
                Opcode::Leave
            ]
        );
        assert_eq!(iseq.children[0].name, "<module:Util>");
        assert!(iseq.code.contains(&Word::Num(define_class::MODULE)));
    }

    #[test]
    fn test_return_inside_class_body_method_is_fine() {
        let method = def("m", scope(&[], ret(Some(int(1)))));
        let body = Node::new(
            1,
            NodeKind::Class {
                name: "C".to_string(),
                superclass: None,
                scope: Box::new(scope(&[], method)),
            },
        );
        assert!(compile_with(&[], body, IseqKind::Top, quiet()).is_ok());
    }
}
