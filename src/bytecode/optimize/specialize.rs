//! Specialized call instructions and operand-unified variants.

use crate::bytecode::compile_error::InternalError;
use crate::bytecode::ir::{Arena, ElemId, ElemKind, Insn, Operand, Seq};
use crate::bytecode::iseq::{CallSite, call_flag};
use crate::bytecode::op::Opcode;
use crate::bytecode::oracle::RedefinitionOracle;
use crate::lang::value::Value;

/// Specialized opcode for a simple call of `mid` with `argc` arguments.
fn specialized_op(mid: &str, argc: u32) -> Option<Opcode> {
    use Opcode::*;
    Some(match (argc, mid) {
        (0, "length") => OptLength,
        (0, "size") => OptSize,
        (0, "empty?") => OptEmptyP,
        (0, "succ") => OptSucc,
        (0, "!") => OptNot,
        (1, "+") => OptPlus,
        (1, "-") => OptMinus,
        (1, "*") => OptMult,
        (1, "/") => OptDiv,
        (1, "%") => OptMod,
        (1, "==") => OptEq,
        (1, "!=") => OptNeq,
        (1, "<") => OptLt,
        (1, "<=") => OptLe,
        (1, ">") => OptGt,
        (1, ">=") => OptGe,
        (1, "<<") => OptLtLt,
        (1, "[]") => OptAref,
        (2, "[]=") => OptAset,
        _ => return None,
    })
}

/// Rewrite a `send` at `id`.
pub(super) fn specialize(arena: &mut Arena, seq: &mut Seq, id: ElemId, oracle: &dyn RedefinitionOracle) {
    let Some(insn) = arena.insn(id) else { return };
    if insn.opcode != Opcode::Send {
        return;
    }
    let Some(ci) = insn.call_site().cloned() else {
        return;
    };
    if ci.block.is_some() || ci.has(call_flag::ARGS_BLOCKARG) {
        return;
    }
    let line = insn.line;

    if ci.has(call_flag::ARGS_SIMPLE) {
        if let Some(op) = specialized_op(&ci.mid, ci.argc)
            && !oracle.is_redefined(&ci.mid)
        {
            let mut operands = vec![Operand::CallInfo(ci.clone())];
            if op == Opcode::OptNeq {
                operands.push(Operand::CallInfo(CallSite::new("==", 1, call_flag::ARGS_SIMPLE)));
            }
            tracing::trace!(mid = %ci.mid, opcode = %op, "specialized call");
            arena.replace(id, ElemKind::Insn(Insn::new(op, line, operands)));
            return;
        }

        // newarray n; send max => opt_newarray_max n
        if ci.argc == 0
            && matches!(ci.mid.as_str(), "max" | "min")
            && !oracle.is_redefined(&ci.mid)
            && let Some(prev) = arena.prev(id)
            && arena.opcode(prev) == Some(Opcode::NewArray)
            && let Some(count) = arena.insn(prev).and_then(|i| i.operands.first().cloned())
        {
            let op = if ci.mid == "max" {
                Opcode::OptNewArrayMax
            } else {
                Opcode::OptNewArrayMin
            };
            arena.replace(prev, ElemKind::Insn(Insn::new(op, line, vec![count])));
            arena.remove(seq, id);
            return;
        }
    }

    if let Some(insn) = arena.insn_mut(id) {
        insn.opcode = Opcode::OptSendWithoutBlock;
    }
}

/// Fold small constant operands into the opcode.
pub(super) fn unify_operands(arena: &mut Arena, id: ElemId) -> Result<(), InternalError> {
    let Some(insn) = arena.insn(id) else {
        return Ok(());
    };
    let replacement = match insn.opcode {
        Opcode::GetLocal | Opcode::SetLocal => {
            let (wc0, wc1) = if insn.opcode == Opcode::GetLocal {
                (Opcode::GetLocalWc0, Opcode::GetLocalWc1)
            } else {
                (Opcode::SetLocalWc0, Opcode::SetLocalWc1)
            };
            let idx = insn.num(0)?;
            match insn.num(1)? {
                0 => Some((wc0, vec![Operand::Num(idx)])),
                1 => Some((wc1, vec![Operand::Num(idx)])),
                _ => None,
            }
        }
        Opcode::PutObject => match insn.value(0) {
            Some(Value::Integer(0)) => Some((Opcode::PutObjectInt0, vec![])),
            Some(Value::Integer(1)) => Some((Opcode::PutObjectInt1, vec![])),
            _ => None,
        },
        _ => None,
    };

    if let Some((opcode, operands)) = replacement
        && let Some(insn) = arena.insn_mut(id)
    {
        insn.opcode = opcode;
        insn.operands = operands;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::optimize::tests::opcodes;
    use crate::bytecode::oracle::StaticOracle;

    fn call(arena: &mut Arena, seq: &mut Seq, mid: &str, argc: u32, flags: u32) -> ElemId {
        arena.emit(seq, 1, Opcode::Send, vec![Operand::CallInfo(CallSite::new(mid, argc, flags))])
    }

    #[test]
    fn test_operator_table() {
        assert_eq!(specialized_op("+", 1), Some(Opcode::OptPlus));
        assert_eq!(specialized_op("[]=", 2), Some(Opcode::OptAset));
        assert_eq!(specialized_op("empty?", 0), Some(Opcode::OptEmptyP));
        assert_eq!(specialized_op("+", 2), None);
        assert_eq!(specialized_op("foo", 1), None);
    }

    #[test]
    fn test_neq_carries_eq_call_info() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let id = call(&mut arena, &mut seq, "!=", 1, call_flag::ARGS_SIMPLE);
        specialize(&mut arena, &mut seq, id, &StaticOracle::pristine());

        let insn = arena.insn(id).unwrap();
        assert_eq!(insn.opcode, Opcode::OptNeq);
        assert!(matches!(&insn.operands[1], Operand::CallInfo(ci) if ci.mid == "=="));
    }

    #[test]
    fn test_non_simple_call_is_generic() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let id = call(&mut arena, &mut seq, "+", 1, call_flag::ARGS_SPLAT);
        specialize(&mut arena, &mut seq, id, &StaticOracle::pristine());
        assert_eq!(arena.opcode(id), Some(Opcode::OptSendWithoutBlock));
    }

    #[test]
    fn test_block_arg_call_keeps_send() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let id = call(&mut arena, &mut seq, "each", 0, call_flag::ARGS_BLOCKARG);
        specialize(&mut arena, &mut seq, id, &StaticOracle::pristine());
        assert_eq!(arena.opcode(id), Some(Opcode::Send));
    }

    #[test]
    fn test_newarray_max() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        arena.emit(&mut seq, 1, Opcode::PutObject, vec![Operand::Value(Value::Integer(3))]);
        arena.emit(&mut seq, 1, Opcode::PutObject, vec![Operand::Value(Value::Integer(4))]);
        arena.emit(&mut seq, 1, Opcode::NewArray, vec![Operand::Num(2)]);
        let id = call(&mut arena, &mut seq, "max", 0, call_flag::ARGS_SIMPLE);
        specialize(&mut arena, &mut seq, id, &StaticOracle::pristine());
        assert_eq!(
            opcodes(&arena, &seq),
            vec![Opcode::PutObject, Opcode::PutObject, Opcode::OptNewArrayMax]
        );

        let mut arena = Arena::new();
        let mut seq = Seq::new();
        arena.emit(&mut seq, 1, Opcode::NewArray, vec![Operand::Num(0)]);
        let id = call(&mut arena, &mut seq, "min", 0, call_flag::ARGS_SIMPLE);
        specialize(&mut arena, &mut seq, id, &StaticOracle::with_redefined(["min"]));
        assert_eq!(
            opcodes(&arena, &seq),
            vec![Opcode::NewArray, Opcode::OptSendWithoutBlock]
        );
    }

    #[test]
    fn test_operand_unification() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let get = arena.emit(&mut seq, 1, Opcode::GetLocal, vec![Operand::Num(3), Operand::Num(1)]);
        let far = arena.emit(&mut seq, 1, Opcode::SetLocal, vec![Operand::Num(3), Operand::Num(2)]);
        let one = arena.emit(&mut seq, 1, Opcode::PutObject, vec![Operand::Value(Value::Integer(1))]);
        let two = arena.emit(&mut seq, 1, Opcode::PutObject, vec![Operand::Value(Value::Integer(2))]);
        for id in [get, far, one, two] {
            unify_operands(&mut arena, id).unwrap();
        }

        assert_eq!(arena.opcode(get), Some(Opcode::GetLocalWc1));
        assert_eq!(arena.insn(get).unwrap().operands, vec![Operand::Num(3)]);
        assert_eq!(arena.opcode(far), Some(Opcode::SetLocal));
        assert_eq!(arena.opcode(one), Some(Opcode::PutObjectInt1));
        assert!(arena.insn(one).unwrap().operands.is_empty());
        assert_eq!(arena.opcode(two), Some(Opcode::PutObject));
    }
}
