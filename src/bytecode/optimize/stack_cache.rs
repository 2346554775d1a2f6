//! Register caching of the top of the operand stack.
//!
//! Up to two values live in registers A and B. Each instruction is given
//! the cache state it expects on entry and the one it leaves behind, and a
//! `pop` or `swap` that only shuffles registers is dropped from the code.
//!
//! Join points (labels and stack adjustments) always see an empty cache:
//! the instruction before one, and every branch or terminator, spills its
//! registers to memory.

use crate::bytecode::compile_error::InternalError;
use crate::bytecode::ir::{Arena, ElemId, ElemKind, Seq};
use crate::bytecode::iseq::CacheState;
use crate::bytecode::op::Opcode;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Reg {
    A,
    B,
}

/// Registers holding cached values, deepest first.
fn regs(state: CacheState) -> Vec<Reg> {
    match state {
        CacheState::XX => vec![],
        CacheState::AX => vec![Reg::A],
        CacheState::BX => vec![Reg::B],
        CacheState::AB => vec![Reg::A, Reg::B],
        CacheState::BA => vec![Reg::B, Reg::A],
    }
}

fn state_of(regs: &[Reg]) -> CacheState {
    match regs {
        [] => CacheState::XX,
        [Reg::A] => CacheState::AX,
        [Reg::B] => CacheState::BX,
        [Reg::A, Reg::B] => CacheState::AB,
        _ => CacheState::BA,
    }
}

/// Cache state after popping `pops` and pushing `pushes` values.
fn transition(entry: CacheState, pops: usize, pushes: usize) -> CacheState {
    let mut cached = regs(entry);
    let keep = cached.len().saturating_sub(pops);
    cached.truncate(keep);
    for _ in 0..pushes {
        match cached.as_slice() {
            [] => cached.push(Reg::A),
            [Reg::A] => cached.push(Reg::B),
            [Reg::B] => cached.push(Reg::A),
            // spill the deeper register and reuse it for the new top
            [deeper, top] => cached = vec![*top, *deeper],
            _ => {}
        }
    }
    state_of(&cached)
}

fn is_join_point(arena: &Arena, id: Option<ElemId>) -> bool {
    id.is_some_and(|n| matches!(arena.kind(n), ElemKind::Label(_) | ElemKind::Adjust(_)))
}

/// Assign cache states and elide register-only instructions. Returns the
/// `(instruction, entry, exit)` state of every instruction left in the code.
pub fn run(
    arena: &mut Arena,
    seq: &Seq,
) -> Result<Vec<(ElemId, CacheState, CacheState)>, InternalError> {
    let mut out = Vec::new();
    let mut state = CacheState::XX;

    for id in arena.ids(seq) {
        let next = arena.next(id);
        match arena.kind(id).clone() {
            ElemKind::Label(label) => {
                let data = arena.label_mut(label);
                match data.sc_state {
                    Some(expected) if expected != state => {
                        return Err(InternalError::StackCacheMismatch {
                            label: label.0,
                            expected: expected.name(),
                            found: state.name(),
                        });
                    }
                    Some(_) => {}
                    None => data.sc_state = Some(state),
                }
            }
            ElemKind::Adjust(_) => state = CacheState::XX,
            ElemKind::Insn(insn) => {
                let entry = state;
                let at_join = is_join_point(arena, next);

                let elide = !at_join
                    && match insn.opcode {
                        Opcode::Pop => entry.depth() >= 1,
                        Opcode::Swap => entry.depth() == 2,
                        _ => false,
                    };
                if elide {
                    let exit = if insn.opcode == Opcode::Pop {
                        transition(entry, 1, 0)
                    } else {
                        state_of(&regs(entry).into_iter().rev().collect::<Vec<_>>())
                    };
                    if let Some(i) = arena.insn_mut(id) {
                        i.elided = true;
                    }
                    state = exit;
                    continue;
                }

                let labels = insn.labels();
                let spill = at_join
                    || insn.opcode.is_terminator()
                    || insn.opcode.is_branch()
                    || !labels.is_empty();
                let exit = if spill {
                    CacheState::XX
                } else {
                    let (pops, pushes) = insn.stack_effect()?;
                    transition(entry, pops, pushes)
                };

                for label in labels {
                    let data = arena.label_mut(label);
                    match data.sc_state {
                        Some(expected) if expected != exit => {
                            return Err(InternalError::StackCacheMismatch {
                                label: label.0,
                                expected: expected.name(),
                                found: exit.name(),
                            });
                        }
                        Some(_) => {}
                        None => data.sc_state = Some(exit),
                    }
                }

                out.push((id, entry, exit));
                state = if insn.opcode.is_terminator() {
                    CacheState::XX
                } else {
                    exit
                };
            }
        }
    }
    Ok(out)
}
