//! Final assembly of an instruction list into code words.
//!
//! Two passes over the list:
//!
//! 1. Lay out positions and simulate the stack depth, recording each
//!    label's position and depth and the depth at every adjust marker.
//! 2. Serialize instructions, interning operands into the constant pools,
//!    resolving labels to relative offsets and emitting the line table.
//!
//! The catch table and optional-argument table are resolved last.

use rustc_hash::FxHashMap;

use crate::bytecode::compile_error::InternalError;
use crate::bytecode::ir::{Arena, CatchRegion, ElemId, ElemKind, Insn, LabelId, Operand, Seq};
use crate::bytecode::iseq::{
    CacheEntry, CacheState, CallSite, CatchEntry, DispatchMap, LineEntry, Word,
};
use crate::bytecode::op::Opcode;
use crate::lang::value::Value;

/// Scope-level tables that refer into the instruction list.
pub struct Tables<'t> {
    pub catches: &'t [CatchRegion],
    pub opt_labels: &'t [LabelId],
    pub inline_cache_size: u32,
    pub stack_cache: &'t [(ElemId, CacheState, CacheState)],
}

#[derive(Debug, Default)]
pub struct Output {
    pub code: Vec<Word>,
    pub literals: Vec<Value>,
    pub identifiers: Vec<String>,
    pub globals: Vec<String>,
    pub call_infos: Vec<CallSite>,
    pub dispatch_maps: Vec<DispatchMap>,
    pub line_table: Vec<LineEntry>,
    pub catch_table: Vec<CatchEntry>,
    pub stack_max: u32,
    pub stack_cache: Vec<CacheEntry>,
    pub opt_table: Vec<u32>,
}

/// Interning pool: each distinct entry is stored once.
struct Pool<T> {
    items: Vec<T>,
    index: FxHashMap<T, u32>,
}

impl<T: Clone + Eq + std::hash::Hash> Pool<T> {
    fn new() -> Self {
        Pool {
            items: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    fn intern(&mut self, item: &T) -> u32 {
        if let Some(idx) = self.index.get(item) {
            return *idx;
        }
        let idx = self.items.len() as u32;
        self.items.push(item.clone());
        self.index.insert(item.clone(), idx);
        idx
    }
}

/// Results of the layout pass.
struct Layout {
    /// Words to emit for each code-emitting adjust marker.
    adjusts: FxHashMap<ElemId, usize>,
    positions: FxHashMap<ElemId, usize>,
    stack_max: usize,
}

pub fn assemble(arena: &mut Arena, seq: &Seq, tables: &Tables<'_>) -> Result<Output, InternalError> {
    let ids = arena.ids(seq);
    let layout = lay_out(arena, &ids)?;

    let mut code = Vec::new();
    let mut literals = Pool::new();
    let mut identifiers = Pool::new();
    let mut globals = Pool::new();
    let mut call_infos = Vec::new();
    let mut dispatch_maps = Vec::new();
    let mut line_table: Vec<LineEntry> = Vec::new();
    let mut last_line = None;

    for id in &ids {
        let (line, words) = match arena.kind(*id) {
            ElemKind::Label(_) => continue,
            ElemKind::Adjust(adj) => {
                let (Some(line), Some(pop)) = (adj.line, layout.adjusts.get(id)) else {
                    continue;
                };
                let words = if *pop > 0 {
                    vec![Word::Op(Opcode::AdjustStack), Word::Num(*pop as i64)]
                } else {
                    vec![Word::Op(Opcode::Nop), Word::Op(Opcode::Nop)]
                };
                (line, words)
            }
            ElemKind::Insn(insn) => {
                if insn.elided {
                    continue;
                }
                check_operands(insn)?;
                let pc = code.len();
                let next_pc = (pc + insn.width()) as i64;
                let mut words = vec![Word::Op(insn.opcode)];
                for operand in &insn.operands {
                    words.push(match operand {
                        Operand::Label(l) => Word::Offset(offset(arena, *l, next_pc)?),
                        Operand::Num(n) => Word::Num(*n),
                        Operand::Value(v) => Word::Literal(literals.intern(v)),
                        Operand::Id(name) => Word::Id(identifiers.intern(name)),
                        Operand::Global(name) => Word::Global(globals.intern(name)),
                        Operand::Iseq(idx) => Word::Iseq(*idx),
                        Operand::InlineCache(idx) => {
                            if *idx >= tables.inline_cache_size {
                                return Err(InternalError::InlineCacheOverflow {
                                    index: *idx,
                                    size: tables.inline_cache_size,
                                });
                            }
                            Word::InlineCache(*idx)
                        }
                        Operand::CallInfo(ci) => {
                            call_infos.push(ci.clone());
                            Word::CallInfo(call_infos.len() as u32 - 1)
                        }
                        Operand::Dispatch(dispatch) => {
                            let mut map = DispatchMap::default();
                            for (key, label) in &dispatch.entries {
                                map.entries.push((literals.intern(key), offset(arena, *label, next_pc)?));
                            }
                            dispatch_maps.push(map);
                            Word::Dispatch(dispatch_maps.len() as u32 - 1)
                        }
                    });
                }
                (insn.line, words)
            }
        };

        if last_line != Some(line) {
            line_table.push(LineEntry {
                line,
                position: code.len() as u32,
            });
            last_line = Some(line);
        }
        code.extend(words);
    }

    let catch_table = tables
        .catches
        .iter()
        .map(|region| resolve_catch(arena, region))
        .collect::<Result<Vec<_>, _>>()?;
    let opt_table = tables
        .opt_labels
        .iter()
        .map(|l| position(arena, *l))
        .collect::<Result<Vec<_>, _>>()?;
    let stack_cache = tables
        .stack_cache
        .iter()
        .filter_map(|(id, entry, exit)| {
            layout.positions.get(id).map(|pos| CacheEntry {
                position: *pos as u32,
                entry: *entry,
                exit: *exit,
            })
        })
        .collect();

    tracing::trace!(words = code.len(), stack_max = layout.stack_max, "assembled");
    Ok(Output {
        code,
        literals: literals.items,
        identifiers: identifiers.items,
        globals: globals.items,
        call_infos,
        dispatch_maps,
        line_table,
        catch_table,
        stack_max: layout.stack_max as u32,
        stack_cache,
        opt_table,
    })
}

/// Pass one: positions and stack depths.
///
/// Depth is only checked on paths control can reach. Code after a
/// terminator is dead until a referenced label or a restore marker.
fn lay_out(arena: &mut Arena, ids: &[ElemId]) -> Result<Layout, InternalError> {
    let mut adjusts = FxHashMap::default();
    let mut positions = FxHashMap::default();
    let mut pos = 0usize;
    let mut sp = 0usize;
    let mut stack_max = 0usize;
    let mut reachable = true;

    for id in ids {
        match arena.kind(*id).clone() {
            ElemKind::Label(label) => {
                let data = arena.label_mut(label);
                data.position = Some(pos);
                if !reachable && data.refcnt == 0 {
                    continue;
                }
                match data.sp {
                    Some(known) => {
                        if reachable && known != sp {
                            return Err(InternalError::StackDepthMismatch {
                                label: label.0,
                                expected: known,
                                found: sp,
                            });
                        }
                        sp = known;
                    }
                    None => data.sp = Some(sp),
                }
                reachable = true;
            }
            ElemKind::Adjust(adj) => {
                let target = match adj.label {
                    Some(l) => arena.label(l).sp.ok_or(InternalError::UnboundLabel(l.0))?,
                    None => 0,
                };
                if adj.is_restore() {
                    sp = target;
                    reachable = true;
                    continue;
                }
                let pop = if reachable {
                    if sp < target {
                        return Err(InternalError::AdjustUnderflow {
                            label: adj.label.map_or(0, |l| l.0),
                            count: sp as i64 - target as i64,
                        });
                    }
                    sp - target
                } else {
                    0
                };
                adjusts.insert(*id, pop);
                sp = target;
                pos += adj.width();
            }
            ElemKind::Insn(insn) => {
                let (pops, pushes) = insn.stack_effect()?;
                if reachable && pops > sp {
                    return Err(InternalError::StackUnderflow {
                        opcode: insn.opcode,
                        position: pos,
                    });
                }
                sp = sp.saturating_sub(pops) + pushes;
                if reachable {
                    stack_max = stack_max.max(sp);
                }
                for label in insn.labels() {
                    note_branch_depth(arena, label, sp, reachable)?;
                }

                positions.insert(*id, pos);
                pos += insn.width();
                if insn.opcode.is_terminator() {
                    reachable = false;
                }
            }
        }
    }

    Ok(Layout {
        adjusts,
        positions,
        stack_max,
    })
}

fn note_branch_depth(arena: &mut Arena, label: LabelId, sp: usize, reachable: bool) -> Result<(), InternalError> {
    let data = arena.label_mut(label);
    match data.sp {
        Some(known) if reachable && known != sp => Err(InternalError::StackDepthMismatch {
            label: label.0,
            expected: known,
            found: sp,
        }),
        Some(_) => Ok(()),
        None => {
            data.sp = Some(sp);
            Ok(())
        }
    }
}

fn position(arena: &Arena, label: LabelId) -> Result<u32, InternalError> {
    if arena.label_elem(label).is_none() {
        return Err(InternalError::UnboundLabel(label.0));
    }
    arena
        .label(label)
        .position
        .map(|p| p as u32)
        .ok_or(InternalError::UnboundLabel(label.0))
}

/// Offset of `label` relative to the end of the referring instruction.
fn offset(arena: &Arena, label: LabelId, next_pc: i64) -> Result<i32, InternalError> {
    Ok((i64::from(position(arena, label)?) - next_pc) as i32)
}

fn resolve_catch(arena: &Arena, region: &CatchRegion) -> Result<CatchEntry, InternalError> {
    let cont_sp = arena
        .label(region.cont)
        .sp
        .ok_or(InternalError::UnboundLabel(region.cont.0))?;
    let sp = if region.kind.pushes_value() {
        cont_sp.saturating_sub(1)
    } else {
        cont_sp
    };
    Ok(CatchEntry {
        kind: region.kind,
        start: position(arena, region.start)?,
        end: position(arena, region.end)?,
        cont: position(arena, region.cont)?,
        sp: sp as u32,
        child: region.child,
    })
}

fn check_operands(insn: &Insn) -> Result<(), InternalError> {
    let types = insn.opcode.operand_types();
    if types.len() != insn.operands.len() {
        return Err(InternalError::OperandCountMismatch {
            opcode: insn.opcode,
            expected: types.len(),
            found: insn.operands.len(),
        });
    }
    for (index, (operand, ty)) in insn.operands.iter().zip(types).enumerate() {
        if !operand.matches(ty) {
            return Err(InternalError::OperandTypeMismatch {
                opcode: insn.opcode,
                index,
                expected: ty,
                found: operand.kind_name(),
            });
        }
    }
    Ok(())
}
