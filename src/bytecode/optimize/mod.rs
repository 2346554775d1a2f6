//! Passes over a scope's instruction list between lowering and assembly.
//!
//! [`run`] walks the list once, front to back, applying the peephole rules,
//! call specialization and operand unification to each instruction as
//! the options allow. Instruction unification and stack caching run
//! afterwards as separate walks.

mod peephole;
mod specialize;
pub mod stack_cache;
pub mod unify;

use crate::bytecode::compile_error::InternalError;
use crate::bytecode::ir::{Arena, ElemKind, RescueMark, Seq};
use crate::bytecode::iseq::IseqKind;
use crate::bytecode::options::CompileOptions;
use crate::bytecode::oracle::RedefinitionOracle;

/// Scopes whose calls may never be marked as tail calls.
fn allows_tailcall(kind: IseqKind) -> bool {
    !matches!(
        kind,
        IseqKind::Top | IseqKind::Main | IseqKind::Eval | IseqKind::Rescue | IseqKind::Ensure
    )
}

pub fn run(
    arena: &mut Arena,
    seq: &mut Seq,
    kind: IseqKind,
    options: &CompileOptions,
    oracle: &dyn RedefinitionOracle,
) -> Result<(), InternalError> {
    let tailcall = options.tailcall_optimization && allows_tailcall(kind);
    // inside a range covered by a rescue or block catch entry
    let mut rescued = 0usize;

    let mut cur = seq.first();
    while let Some(id) = cur {
        match arena.kind(id) {
            ElemKind::Label(label) => match arena.label(*label).rescued {
                RescueMark::Begin => rescued += 1,
                RescueMark::End => rescued = rescued.saturating_sub(1),
                RescueMark::None => {}
            },
            ElemKind::Insn(_) => {
                if options.peephole_optimization {
                    peephole::optimize(arena, seq, id, tailcall && rescued == 0);
                }
                if arena.is_linked(id) && options.specialized_instruction {
                    specialize::specialize(arena, seq, id, oracle);
                }
                if arena.is_linked(id) && options.operands_unification {
                    specialize::unify_operands(arena, id)?;
                }
            }
            ElemKind::Adjust(_) => {}
        }

        cur = if arena.is_linked(id) {
            arena.next(id)
        } else {
            arena.next_linked(id)
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::Operand;
    use crate::bytecode::op::Opcode;
    use crate::bytecode::oracle::StaticOracle;

    pub(super) fn opcodes(arena: &Arena, seq: &Seq) -> Vec<Opcode> {
        arena
            .ids(seq)
            .into_iter()
            .filter_map(|id| arena.opcode(id))
            .collect()
    }

    #[test]
    fn test_disabled_passes_leave_list_alone() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let l = arena.new_label();
        arena.emit(&mut seq, 1, Opcode::Jump, vec![Operand::Label(l)]);
        arena.bind(&mut seq, l);
        arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        let oracle = StaticOracle::pristine();
        run(&mut arena, &mut seq, IseqKind::Method, &CompileOptions::none(), &oracle).unwrap();
        assert_eq!(
            opcodes(&arena, &seq),
            vec![Opcode::Jump, Opcode::PutNil, Opcode::Leave]
        );

        run(&mut arena, &mut seq, IseqKind::Method, &CompileOptions::default(), &oracle).unwrap();
        assert_eq!(opcodes(&arena, &seq), vec![Opcode::PutNil, Opcode::Leave]);
    }

    #[test]
    fn test_tailcall_scopes() {
        assert!(allows_tailcall(IseqKind::Method));
        assert!(allows_tailcall(IseqKind::Block));
        assert!(!allows_tailcall(IseqKind::Top));
        assert!(!allows_tailcall(IseqKind::Rescue));
    }
}
