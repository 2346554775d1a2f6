//! Fuse adjacent instruction pairs into single unified instructions.

use crate::bytecode::ir::{Arena, ElemKind, Insn, Seq};
use crate::bytecode::op::Opcode;

fn unified(first: Opcode, second: Opcode) -> Option<Opcode> {
    use Opcode::*;
    Some(match (first, second) {
        (PutObject, PutObject) => PutObjectPutObject,
        (PutObject, PutString) => PutObjectPutString,
        (PutString, PutString) => PutStringPutString,
        (PutString, PutObject) => PutStringPutObject,
        (PutObject, SetLocal) => PutObjectSetLocal,
        (PutString, SetLocal) => PutStringSetLocal,
        (Dup, SetLocal) => DupSetLocal,
        (GetLocal, GetLocal) => GetLocalGetLocal,
        (GetLocal, PutObject) => GetLocalPutObject,
        _ => return None,
    })
}

/// Pairs are only fused when nothing can jump between them, so a label or
/// stack adjustment always separates candidates.
pub fn run(arena: &mut Arena, seq: &mut Seq) {
    let mut cur = seq.first();
    while let Some(id) = cur {
        if let Some(next) = arena.next(id)
            && let (Some(a), Some(b)) = (arena.insn(id), arena.insn(next))
            && let Some(op) = unified(a.opcode, b.opcode)
        {
            let mut operands = a.operands.clone();
            operands.extend(b.operands.iter().cloned());
            let line = a.line;
            arena.replace(id, ElemKind::Insn(Insn::new(op, line, operands)));
            arena.remove(seq, next);
        }
        cur = arena.next(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::Operand;
    use crate::bytecode::optimize::tests::opcodes;
    use crate::lang::value::Value;

    #[test]
    fn test_pairs_fuse_left_to_right() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        for n in 1..=3 {
            arena.emit(&mut seq, 1, Opcode::PutObject, vec![Operand::Value(Value::Integer(n))]);
        }
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        run(&mut arena, &mut seq);
        assert_eq!(
            opcodes(&arena, &seq),
            vec![Opcode::PutObjectPutObject, Opcode::PutObject, Opcode::Leave]
        );
        let first = arena.insn(arena.ids(&seq)[0]).unwrap();
        assert_eq!(
            first.operands,
            vec![Operand::Value(Value::Integer(1)), Operand::Value(Value::Integer(2))]
        );
        assert_eq!(first.stack_effect().unwrap(), (0, 2));
    }

    #[test]
    fn test_label_blocks_fusion() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let l = arena.new_label();
        arena.emit(&mut seq, 1, Opcode::GetLocal, vec![Operand::Num(1), Operand::Num(0)]);
        arena.bind(&mut seq, l);
        arena.emit(&mut seq, 1, Opcode::GetLocal, vec![Operand::Num(2), Operand::Num(0)]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        run(&mut arena, &mut seq);
        assert_eq!(
            opcodes(&arena, &seq),
            vec![Opcode::GetLocal, Opcode::GetLocal, Opcode::Leave]
        );
    }

    #[test]
    fn test_dup_setlocal_effect() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        arena.emit(&mut seq, 1, Opcode::Dup, vec![]);
        arena.emit(&mut seq, 1, Opcode::SetLocal, vec![Operand::Num(1), Operand::Num(0)]);

        run(&mut arena, &mut seq);
        let fused = arena.insn(arena.ids(&seq)[0]).unwrap();
        assert_eq!(fused.opcode, Opcode::DupSetLocal);
        assert_eq!(fused.stack_effect().unwrap(), (1, 1));
    }
}
