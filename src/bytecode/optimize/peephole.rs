//! Local rewrites around jumps, branches and constant pushes.

use crate::bytecode::ir::{Arena, ElemId, ElemKind, Insn, LabelId, Operand, Seq};
use crate::bytecode::iseq::call_flag;
use crate::bytecode::op::{Opcode, event};
use crate::lang::value::Value;

/// Bound on jump chains followed while retargeting.
const MAX_CHAIN: usize = 32;

/// Rewrite around `id` until no rule applies. `id` may be removed.
pub(super) fn optimize(arena: &mut Arena, seq: &mut Seq, id: ElemId, tailcall: bool) {
    for _ in 0..MAX_CHAIN {
        if !arena.is_linked(id) {
            return;
        }
        let Some(op) = arena.opcode(id) else { return };
        let again = match op {
            Opcode::Jump => jump(arena, seq, id),
            Opcode::Leave => {
                remove_unreachable(arena, seq, id);
                false
            }
            Opcode::BranchIf | Opcode::BranchUnless => branch(arena, seq, id),
            Opcode::NewArray => {
                if let Some(next) = next_elem_insn(arena, id, Opcode::SplatArray) {
                    arena.remove(seq, next);
                }
                false
            }
            Opcode::Trace => {
                if is_line_trace(arena, id) && arena.next(id).is_some_and(|n| is_line_trace(arena, n)) {
                    arena.remove(seq, id);
                }
                false
            }
            op if op.is_pure_push() => {
                if let Some(pop) = next_elem_insn(arena, id, Opcode::Pop) {
                    arena.remove(seq, pop);
                    arena.remove(seq, id);
                }
                false
            }
            Opcode::Send | Opcode::InvokeSuper => {
                if tailcall {
                    mark_tailcall(arena, id);
                }
                false
            }
            _ => false,
        };
        if !again {
            return;
        }
    }
}

/// The element right after `id`, if it is an instruction with `opcode`.
fn next_elem_insn(arena: &Arena, id: ElemId, opcode: Opcode) -> Option<ElemId> {
    let next = arena.next(id)?;
    (arena.opcode(next) == Some(opcode)).then_some(next)
}

fn is_line_trace(arena: &Arena, id: ElemId) -> bool {
    arena
        .insn(id)
        .is_some_and(|i| i.opcode == Opcode::Trace && matches!(i.operands.first(), Some(Operand::Num(e)) if *e == event::LINE))
}

/// Instruction control falls into after `id` with only labels in between.
fn falls_into(arena: &Arena, id: ElemId) -> Option<ElemId> {
    let mut cur = arena.next(id);
    while let Some(c) = cur {
        match arena.kind(c) {
            ElemKind::Label(_) => cur = arena.next(c),
            ElemKind::Insn(_) => return Some(c),
            ElemKind::Adjust(_) => return None,
        }
    }
    None
}

fn target(arena: &Arena, id: ElemId) -> Option<(LabelId, ElemId)> {
    let label = arena.insn(id)?.label(0)?;
    Some((label, arena.destination(label)?))
}

/// Delete everything after a terminator up to the next referenced label or
/// stack adjustment.
fn remove_unreachable(arena: &mut Arena, seq: &mut Seq, id: ElemId) -> bool {
    let mut removed = false;
    let mut cur = arena.next(id);
    while let Some(c) = cur {
        match arena.kind(c) {
            ElemKind::Label(l) if arena.label(*l).refcnt > 0 => break,
            ElemKind::Adjust(_) => break,
            _ => {}
        }
        cur = arena.next(c);
        arena.remove(seq, c);
        removed = true;
    }
    removed
}

fn jump(arena: &mut Arena, seq: &mut Seq, id: ElemId) -> bool {
    let Some((label, dest)) = target(arena, id) else {
        return false;
    };
    let next = falls_into(arena, id);

    // jump L; L: => L:
    if next == Some(dest) {
        arena.remove(seq, id);
        return false;
    }

    let dest_insn = arena.insn(dest).cloned();
    if let Some(dest_insn) = dest_insn {
        // jump L1; ... L1: jump L2 => jump L2
        if dest != id
            && dest_insn.opcode == Opcode::Jump
            && let Some(further) = dest_insn.label(0)
            && further != label
        {
            arena.retarget(id, 0, further);
            remove_unreachable(arena, seq, id);
            return true;
        }

        // jump L; ... L: leave => leave; pop
        if dest_insn.opcode == Opcode::Leave {
            arena.replace(id, ElemKind::Insn(Insn::new(Opcode::Leave, dest_insn.line, vec![])));
            let line = dest_insn.line;
            arena.insert_after(seq, id, ElemKind::Insn(Insn::new(Opcode::Pop, line, vec![])));
            return true;
        }
    }

    if let Some(prev) = arena.prev(id)
        && let Some(branch) = arena.insn(prev).cloned()
        && matches!(branch.opcode, Opcode::BranchIf | Opcode::BranchUnless)
        && let Some(branch_label) = branch.label(0)
    {
        let branch_dest = arena.destination(branch_label);
        if next.is_some() && next == branch_dest {
            // branchif L1; jump L2; L1: => branchunless L2; L1:
            let inverted = if branch.opcode == Opcode::BranchIf {
                Opcode::BranchUnless
            } else {
                Opcode::BranchIf
            };
            if let Some(insn) = arena.insn_mut(prev) {
                insn.opcode = inverted;
            }
            arena.retarget(prev, 0, label);
            arena.remove(seq, id);
            return false;
        }
        if branch_dest == Some(dest) {
            // branchif L; jump L => pop; jump L
            arena.replace(prev, ElemKind::Insn(Insn::new(Opcode::Pop, branch.line, vec![])));
        }
    }

    remove_unreachable(arena, seq, id)
}

fn branch(arena: &mut Arena, seq: &mut Seq, id: ElemId) -> bool {
    let Some(op) = arena.opcode(id) else { return false };
    let prev = arena.prev(id).filter(|p| arena.insn(*p).is_some());

    // putobject true; branchif L => jump L
    if let Some(prev) = prev
        && let Some(push) = arena.insn(prev)
        && let Some(truthy) = constant_truthiness(push)
    {
        let taken = truthy == (op == Opcode::BranchIf);
        arena.remove(seq, prev);
        if taken {
            if let Some(insn) = arena.insn_mut(id) {
                insn.opcode = Opcode::Jump;
            }
        } else {
            arena.remove(seq, id);
        }
        return true;
    }

    let prev_dup = prev.is_some_and(|p| arena.opcode(p) == Some(Opcode::Dup));
    for _ in 0..MAX_CHAIN {
        let Some((label, dest)) = target(arena, id) else {
            return false;
        };
        let Some(dest_insn) = arena.insn(dest) else { return false };

        if dest_insn.opcode == Opcode::Jump {
            // branchif L1; ... L1: jump L2 => branchif L2
            match dest_insn.label(0) {
                Some(further) if further != label => arena.retarget(id, 0, further),
                _ => return false,
            }
        } else if prev_dup
            && dest_insn.opcode == Opcode::Dup
            && let Some(second) = next_elem_insn(arena, dest, op)
            && second != id
            && let Some(further) = arena.insn(second).and_then(|i| i.label(0))
            && further != label
        {
            // dup; branchif L1; ... L1: dup; branchif L2 => dup; branchif L2
            arena.retarget(id, 0, further);
        } else {
            return false;
        }
    }
    false
}

/// Truthiness of a side-effect-free constant push.
fn constant_truthiness(insn: &Insn) -> Option<bool> {
    match insn.opcode {
        Opcode::PutNil => Some(false),
        Opcode::PutString => Some(true),
        Opcode::PutObject => insn.value(0).map(Value::is_truthy),
        _ => None,
    }
}

/// A block-less call whose continuation is `leave` becomes a tail call.
fn mark_tailcall(arena: &mut Arena, id: ElemId) {
    let Some(ci) = arena.insn(id).and_then(Insn::call_site) else {
        return;
    };
    if ci.block.is_some() || ci.has(call_flag::ARGS_BLOCKARG) {
        return;
    }

    let mut cur = arena.next(id);
    let mut steps = 0;
    while let Some(c) = cur {
        steps += 1;
        if steps > MAX_CHAIN {
            return;
        }
        match arena.kind(c) {
            ElemKind::Label(_) => cur = arena.next(c),
            ElemKind::Adjust(adj) if adj.is_restore() => cur = arena.next(c),
            ElemKind::Adjust(_) => return,
            ElemKind::Insn(insn) => match insn.opcode {
                Opcode::Nop => cur = arena.next(c),
                Opcode::Jump => cur = insn.label(0).and_then(|l| arena.label_elem(l)),
                Opcode::Leave => break,
                _ => return,
            },
        }
    }
    if cur.is_none() {
        return;
    }
    if let Some(ci) = arena.insn_mut(id).and_then(Insn::call_site_mut) {
        ci.flags |= call_flag::TAILCALL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::iseq::CallSite;
    use crate::bytecode::optimize::tests::opcodes;

    fn scan(arena: &mut Arena, seq: &mut Seq, tailcall: bool) {
        let mut cur = seq.first();
        while let Some(id) = cur {
            if arena.insn(id).is_some() {
                optimize(arena, seq, id, tailcall);
            }
            cur = if arena.is_linked(id) {
                arena.next(id)
            } else {
                arena.next_linked(id)
            };
        }
    }

    fn put(arena: &mut Arena, seq: &mut Seq, v: Value) {
        arena.emit(seq, 1, Opcode::PutObject, vec![Operand::Value(v)]);
    }

    #[test]
    fn test_jump_to_leave_becomes_leave() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let end = arena.new_label();
        put(&mut arena, &mut seq, Value::Integer(1));
        arena.emit(&mut seq, 1, Opcode::Jump, vec![Operand::Label(end)]);
        put(&mut arena, &mut seq, Value::Integer(2));
        arena.bind(&mut seq, end);
        arena.emit(&mut seq, 2, Opcode::Leave, vec![]);

        scan(&mut arena, &mut seq, false);
        // the old target became unreachable along with its leave
        assert_eq!(opcodes(&arena, &seq), vec![Opcode::PutObject, Opcode::Leave]);
        assert_eq!(arena.label(end).refcnt, 0);
        assert_eq!(arena.insn(arena.ids(&seq)[1]).map(|i| i.line), Some(2));
    }

    #[test]
    fn test_jump_chain_is_shortened() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let (l1, l2, other) = (arena.new_label(), arena.new_label(), arena.new_label());
        let first = arena.emit(&mut seq, 1, Opcode::Jump, vec![Operand::Label(l1)]);
        arena.bind(&mut seq, other);
        arena.add_label_ref(other);
        arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);
        arena.bind(&mut seq, l1);
        arena.emit(&mut seq, 1, Opcode::Jump, vec![Operand::Label(l2)]);
        arena.bind(&mut seq, l2);
        arena.emit(&mut seq, 1, Opcode::PutSelf, vec![]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        optimize(&mut arena, &mut seq, first, false);
        assert_eq!(arena.insn(first).and_then(|i| i.label(0)), Some(l2));
        assert_eq!(arena.label(l1).refcnt, 0);
        assert_eq!(arena.label(l2).refcnt, 2);
    }

    #[test]
    fn test_branch_over_jump_is_inverted() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let (l1, l2) = (arena.new_label(), arena.new_label());
        arena.emit(&mut seq, 1, Opcode::GetLocal, vec![Operand::Num(1), Operand::Num(0)]);
        let br = arena.emit(&mut seq, 1, Opcode::BranchIf, vec![Operand::Label(l1)]);
        arena.emit(&mut seq, 1, Opcode::Jump, vec![Operand::Label(l2)]);
        arena.bind(&mut seq, l1);
        arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        arena.bind(&mut seq, l2);
        arena.emit(&mut seq, 1, Opcode::PutSelf, vec![]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        scan(&mut arena, &mut seq, false);
        assert_eq!(arena.opcode(br), Some(Opcode::BranchUnless));
        assert_eq!(arena.insn(br).and_then(|i| i.label(0)), Some(l2));
        assert_eq!(arena.label(l1).refcnt, 0);
        assert_eq!(
            opcodes(&arena, &seq),
            vec![
                Opcode::GetLocal,
                Opcode::BranchUnless,
                Opcode::PutNil,
                Opcode::PutSelf,
                Opcode::Leave
            ]
        );
    }

    #[test]
    fn test_constant_branch_folds() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let l = arena.new_label();
        arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        arena.emit(&mut seq, 1, Opcode::BranchIf, vec![Operand::Label(l)]);
        put(&mut arena, &mut seq, Value::Integer(1));
        arena.bind(&mut seq, l);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        scan(&mut arena, &mut seq, false);
        assert_eq!(opcodes(&arena, &seq), vec![Opcode::PutObject, Opcode::Leave]);

        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let l = arena.new_label();
        put(&mut arena, &mut seq, Value::True);
        arena.emit(&mut seq, 1, Opcode::BranchUnless, vec![Operand::Label(l)]);
        put(&mut arena, &mut seq, Value::Integer(1));
        arena.bind(&mut seq, l);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        scan(&mut arena, &mut seq, false);
        assert_eq!(opcodes(&arena, &seq), vec![Opcode::PutObject, Opcode::Leave]);
    }

    #[test]
    fn test_push_then_pop_vanishes() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        arena.emit(&mut seq, 1, Opcode::PutSelf, vec![]);
        arena.emit(&mut seq, 1, Opcode::Pop, vec![]);
        arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        scan(&mut arena, &mut seq, false);
        assert_eq!(opcodes(&arena, &seq), vec![Opcode::PutNil, Opcode::Leave]);
    }

    #[test]
    fn test_newarray_splat_drops_splat() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        arena.emit(&mut seq, 1, Opcode::NewArray, vec![Operand::Num(0)]);
        arena.emit(&mut seq, 1, Opcode::SplatArray, vec![Operand::Value(Value::False)]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        scan(&mut arena, &mut seq, false);
        assert_eq!(opcodes(&arena, &seq), vec![Opcode::NewArray, Opcode::Leave]);
    }

    #[test]
    fn test_duplicate_line_trace() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        arena.emit(&mut seq, 1, Opcode::Trace, vec![Operand::Num(event::LINE)]);
        arena.emit(&mut seq, 2, Opcode::Trace, vec![Operand::Num(event::LINE)]);
        arena.emit(&mut seq, 2, Opcode::PutNil, vec![]);
        arena.emit(&mut seq, 2, Opcode::Leave, vec![]);

        scan(&mut arena, &mut seq, false);
        let ids = arena.ids(&seq);
        assert_eq!(ids.len(), 3);
        assert_eq!(arena.insn(ids[0]).map(|i| i.line), Some(2));
    }

    #[test]
    fn test_tailcall_through_nop_and_jump() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let end = arena.new_label();
        arena.emit(&mut seq, 1, Opcode::PutSelf, vec![]);
        let send = arena.emit(
            &mut seq,
            1,
            Opcode::Send,
            vec![Operand::CallInfo(CallSite::new("f", 0, call_flag::FCALL))],
        );
        arena.emit(&mut seq, 1, Opcode::Nop, vec![]);
        arena.emit(&mut seq, 1, Opcode::Jump, vec![Operand::Label(end)]);
        arena.bind(&mut seq, end);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        optimize(&mut arena, &mut seq, send, false);
        let flags = |a: &Arena| a.insn(send).and_then(|i| i.call_site()).map(|c| c.flags);
        assert_eq!(flags(&arena), Some(call_flag::FCALL));

        optimize(&mut arena, &mut seq, send, true);
        assert_eq!(flags(&arena), Some(call_flag::FCALL | call_flag::TAILCALL));
    }

    #[test]
    fn test_call_with_block_is_not_tailcall() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let mut ci = CallSite::new("each", 0, call_flag::BLOCKISEQ);
        ci.block = Some(0);
        arena.emit(&mut seq, 1, Opcode::PutSelf, vec![]);
        let send = arena.emit(&mut seq, 1, Opcode::Send, vec![Operand::CallInfo(ci)]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        optimize(&mut arena, &mut seq, send, true);
        let ci = arena.insn(send).and_then(|i| i.call_site()).cloned();
        assert!(ci.is_some_and(|c| !c.has(call_flag::TAILCALL)));
    }

    #[test]
    fn test_unreachable_removal_stops_at_referenced_label() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let (dead, live) = (arena.new_label(), arena.new_label());
        arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);
        arena.bind(&mut seq, dead);
        arena.emit(&mut seq, 1, Opcode::PutSelf, vec![]);
        arena.bind(&mut seq, live);
        arena.add_label_ref(live);
        arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        scan(&mut arena, &mut seq, false);
        assert_eq!(
            opcodes(&arena, &seq),
            vec![Opcode::PutNil, Opcode::Leave, Opcode::PutNil, Opcode::Leave]
        );
        assert!(arena.label_elem(dead).is_none());
        assert!(arena.label_elem(live).is_some());
    }
}
