//! Verifier for finalized instruction sequences.
//!
//! Walks every path through the code from the entry point and from each
//! catch continuation, checking that instructions decode, that jumps land
//! on instruction boundaries, that pool indices are in range and that the
//! operand stack depth agrees wherever paths meet.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::bytecode::ir::{CaseDispatch, Insn, Operand};
use crate::bytecode::iseq::{InstructionSequence, Word};
use crate::bytecode::op::Opcode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stack-check error in '{scope}': {message}")]
pub struct StackCheckError {
    pub scope: String,
    pub message: String,
}

impl StackCheckError {
    fn new(iseq: &InstructionSequence, message: impl Into<String>) -> Self {
        Self {
            scope: iseq.name.clone(),
            message: message.into(),
        }
    }
}

/// Check `iseq` and all of its children.
pub fn check(iseq: &InstructionSequence) -> Result<(), StackCheckError> {
    check_scope(iseq)?;
    for child in &iseq.children {
        check(child)?;
    }
    Ok(())
}

fn check_scope(iseq: &InstructionSequence) -> Result<(), StackCheckError> {
    let code = iseq.code();
    let mut insns = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let Word::Op(op) = code[pc] else {
            return Err(StackCheckError::new(iseq, format!("expected an opcode at {}", pc)));
        };
        if pc + op.len() > code.len() {
            return Err(StackCheckError::new(iseq, format!("`{}` at {} is truncated", op, pc)));
        }
        insns.push(decode(iseq, pc, op)?);
        pc += op.len();
    }
    let boundaries: FxHashSet<usize> = iseq.instruction_boundaries().into_iter().collect();
    let is_target = |pos: usize| boundaries.contains(&pos) || pos == code.len();

    for (i, entry) in iseq.catch_table.iter().enumerate() {
        let positions = [entry.start, entry.end, entry.cont];
        if positions.iter().any(|p| !is_target(*p as usize)) || entry.start > entry.end {
            return Err(StackCheckError::new(iseq, format!("catch entry {} has a bad range", i)));
        }
        if let Some(child) = entry.child
            && child as usize >= iseq.children.len()
        {
            return Err(StackCheckError::new(iseq, format!("catch entry {} names missing child {}", i, child)));
        }
    }
    for (pc, insn) in &insns {
        for target in targets(iseq, *pc, insn)? {
            if !boundaries.contains(&target) {
                return Err(StackCheckError::new(
                    iseq,
                    format!("jump at {} lands off an instruction boundary ({})", pc, target),
                ));
            }
        }
    }

    // elided instructions leave the code, so depths no longer add up
    if !iseq.stack_cache.is_empty() || insns.is_empty() {
        return Ok(());
    }

    let by_pc: FxHashMap<usize, &Insn> = insns.iter().map(|(pc, i)| (*pc, i)).collect();
    let mut depth: FxHashMap<usize, usize> = FxHashMap::default();
    let mut work = vec![(0usize, 0usize)];
    for entry in &iseq.catch_table {
        let sp = entry.sp as usize + usize::from(entry.kind.pushes_value());
        work.push((entry.cont as usize, sp));
    }

    while let Some((pc, sp)) = work.pop() {
        if let Some(known) = depth.get(&pc) {
            if *known != sp {
                return Err(StackCheckError::new(
                    iseq,
                    format!("depth at {} is {} on one path and {} on another", pc, known, sp),
                ));
            }
            continue;
        }
        depth.insert(pc, sp);

        let Some(insn) = by_pc.get(&pc) else {
            return Err(StackCheckError::new(iseq, format!("control falls off the end at {}", pc)));
        };
        let (pops, pushes) = insn
            .stack_effect()
            .map_err(|e| StackCheckError::new(iseq, e.to_string()))?;
        if pops > sp {
            return Err(StackCheckError::new(
                iseq,
                format!("`{}` at {} pops {} with depth {}", insn.opcode, pc, pops, sp),
            ));
        }
        let after = sp - pops + pushes;
        if after > iseq.stack_max as usize {
            return Err(StackCheckError::new(
                iseq,
                format!("depth {} at {} exceeds stack_max {}", after, pc, iseq.stack_max),
            ));
        }

        for target in targets(iseq, pc, insn)? {
            work.push((target, after));
        }
        if !insn.opcode.is_terminator() {
            work.push((pc + insn.opcode.len(), after));
        }
    }
    Ok(())
}

/// Rebuild an instruction from its code words.
fn decode(iseq: &InstructionSequence, pc: usize, op: Opcode) -> Result<(usize, Insn), StackCheckError> {
    let bad = |what: &str, idx: u32| StackCheckError::new(iseq, format!("bad {} index {} at {}", what, idx, pc));
    let mut operands = Vec::with_capacity(op.arity());
    for (slot, word) in iseq.code()[pc + 1..pc + op.len()].iter().enumerate() {
        operands.push(match *word {
            Word::Op(inner) => {
                return Err(StackCheckError::new(
                    iseq,
                    format!("`{}` at {} is missing operand {} (found `{}`)", op, pc, slot, inner),
                ));
            }
            Word::Offset(off) => Operand::Num(i64::from(off)),
            Word::Num(n) => Operand::Num(n),
            Word::Literal(i) => Operand::Value(iseq.literal(i).cloned().ok_or_else(|| bad("literal", i))?),
            Word::Id(i) => Operand::Id(iseq.identifier(i).ok_or_else(|| bad("identifier", i))?.to_string()),
            Word::Global(i) => Operand::Global(iseq.globals.get(i as usize).cloned().ok_or_else(|| bad("global", i))?),
            Word::InlineCache(i) if i < iseq.inline_cache_size => Operand::InlineCache(i),
            Word::InlineCache(i) => return Err(bad("inline cache", i)),
            Word::CallInfo(i) => Operand::CallInfo(iseq.call_infos.get(i as usize).cloned().ok_or_else(|| bad("call info", i))?),
            Word::Dispatch(i) if (i as usize) < iseq.dispatch_maps.len() => {
                Operand::Dispatch(CaseDispatch { entries: Vec::new() })
            }
            Word::Dispatch(i) => return Err(bad("dispatch map", i)),
            Word::Iseq(i) if (i as usize) < iseq.children.len() => Operand::Iseq(i),
            Word::Iseq(i) => return Err(bad("child", i)),
        });
    }
    Ok((pc, Insn::new(op, 0, operands)))
}

/// Absolute positions `insn` may jump to.
fn targets(iseq: &InstructionSequence, pc: usize, insn: &Insn) -> Result<Vec<usize>, StackCheckError> {
    let next = (pc + insn.opcode.len()) as i64;
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    for word in &iseq.code()[pc + 1..next as usize] {
        match word {
            Word::Offset(off) => offsets.push(i64::from(*off)),
            Word::Dispatch(i) => {
                if let Some(map) = iseq.dispatch_maps.get(*i as usize) {
                    offsets.extend(map.entries.iter().map(|(_, off)| i64::from(*off)));
                }
            }
            _ => {}
        }
    }
    for off in offsets {
        let target = next + off;
        if target < 0 {
            return Err(StackCheckError::new(iseq, format!("jump at {} lands before the start", pc)));
        }
        out.push(target as usize);
    }
    Ok(out)
}
