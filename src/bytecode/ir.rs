//! Intermediate representation.
//!
//! A scope is lowered into a doubly linked list of labels, instructions and
//! adjust markers. Elements live in an [`Arena`] and link to each other by
//! index, so splicing never invalidates a handle. A [`Seq`] is a head/tail
//! anchor into the arena; several anchors can be built independently and
//! spliced together.

use std::fmt::Write as _;

use crate::bytecode::compile_error::InternalError;
use crate::bytecode::iseq::{CacheState, CallSite, CatchKind};
use crate::bytecode::op::{Opcode, OperandType};
use crate::lang::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElemId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

impl std::fmt::Display for LabelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

// =============================================================================
// OPERANDS
// =============================================================================

/// Literal-to-label map of `opt_case_dispatch`, in clause order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CaseDispatch {
    pub entries: Vec<(Value, LabelId)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Label(LabelId),
    Num(i64),
    Value(Value),
    Id(String),
    InlineCache(u32),
    CallInfo(CallSite),
    Dispatch(CaseDispatch),
    Global(String),
    /// Index into the scope's children.
    Iseq(u32),
}

impl Operand {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Operand::Label(_) => OperandType::Offset.name(),
            Operand::Num(_) => OperandType::Num.name(),
            Operand::Value(_) => OperandType::Value.name(),
            Operand::Id(_) => OperandType::Id.name(),
            Operand::InlineCache(_) => OperandType::InlineCache.name(),
            Operand::CallInfo(_) => OperandType::CallInfo.name(),
            Operand::Dispatch(_) => OperandType::Dispatch.name(),
            Operand::Global(_) => OperandType::Global.name(),
            Operand::Iseq(_) => OperandType::Iseq.name(),
        }
    }

    pub fn matches(&self, ty: OperandType) -> bool {
        matches!(
            (self, ty),
            (Operand::Label(_), OperandType::Offset)
                | (Operand::Num(_), OperandType::Num)
                | (Operand::Value(_), OperandType::Value)
                | (Operand::Id(_), OperandType::Id)
                | (Operand::InlineCache(_), OperandType::InlineCache)
                | (Operand::CallInfo(_), OperandType::CallInfo)
                | (Operand::Dispatch(_), OperandType::Dispatch)
                | (Operand::Global(_), OperandType::Global)
                | (Operand::Iseq(_), OperandType::Iseq)
        )
    }

    fn labels(&self, out: &mut Vec<LabelId>) {
        match self {
            Operand::Label(l) => out.push(*l),
            Operand::Dispatch(d) => out.extend(d.entries.iter().map(|(_, l)| *l)),
            _ => {}
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Label(l) => write!(f, "{}", l),
            Operand::Num(n) => write!(f, "{}", n),
            Operand::Value(v) => write!(f, "{}", v),
            Operand::Id(id) => write!(f, ":{}", id),
            Operand::InlineCache(ic) => write!(f, "<ic:{}>", ic),
            Operand::CallInfo(ci) => write!(f, "<callinfo!mid:{}, argc:{}>", ci.mid, ci.argc),
            Operand::Dispatch(d) => {
                write!(f, "<cdhash")?;
                for (v, l) in &d.entries {
                    write!(f, " {}=>{}", v, l)?;
                }
                write!(f, ">")
            }
            Operand::Global(g) => write!(f, "{}", g),
            Operand::Iseq(i) => write!(f, "<iseq:{}>", i),
        }
    }
}

// =============================================================================
// INSTRUCTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Insn {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub line: u32,
    /// Set by stack caching: the instruction occupies no code words.
    pub elided: bool,
}

impl Insn {
    pub fn new(opcode: Opcode, line: u32, operands: Vec<Operand>) -> Self {
        Insn {
            opcode,
            operands,
            line,
            elided: false,
        }
    }

    /// Code words this instruction occupies.
    pub fn width(&self) -> usize {
        if self.elided { 0 } else { self.opcode.len() }
    }

    pub fn num(&self, idx: usize) -> Result<i64, InternalError> {
        match self.operands.get(idx) {
            Some(Operand::Num(n)) => Ok(*n),
            other => Err(self.type_mismatch(idx, OperandType::Num, other)),
        }
    }

    pub fn label(&self, idx: usize) -> Option<LabelId> {
        match self.operands.get(idx) {
            Some(Operand::Label(l)) => Some(*l),
            _ => None,
        }
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        match self.operands.get(idx) {
            Some(Operand::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// The first call-site operand.
    pub fn call_site(&self) -> Option<&CallSite> {
        self.operands.iter().find_map(|op| match op {
            Operand::CallInfo(ci) => Some(ci),
            _ => None,
        })
    }

    pub fn call_site_mut(&mut self) -> Option<&mut CallSite> {
        self.operands.iter_mut().find_map(|op| match op {
            Operand::CallInfo(ci) => Some(ci),
            _ => None,
        })
    }

    /// Every label this instruction refers to.
    pub fn labels(&self) -> Vec<LabelId> {
        let mut out = Vec::new();
        for op in &self.operands {
            op.labels(&mut out);
        }
        out
    }

    fn type_mismatch(
        &self,
        index: usize,
        expected: OperandType,
        found: Option<&Operand>,
    ) -> InternalError {
        InternalError::OperandTypeMismatch {
            opcode: self.opcode,
            index,
            expected,
            found: found.map_or("nothing", Operand::kind_name),
        }
    }

    /// `(pops, pushes)` of this instruction.
    pub fn stack_effect(&self) -> Result<(usize, usize), InternalError> {
        let Some(parts) = self.opcode.parts() else {
            return self.base_effect(self.opcode, &self.operands, 0);
        };

        let mut offset = 0;
        let mut acc: Option<(usize, usize)> = None;
        for part in parts {
            let n = part.arity();
            let ops = self.operands.get(offset..offset + n).ok_or(
                InternalError::OperandCountMismatch {
                    opcode: self.opcode,
                    expected: self.opcode.arity(),
                    found: self.operands.len(),
                },
            )?;
            let (p2, q2) = self.base_effect(*part, ops, offset)?;
            acc = Some(match acc {
                None => (p2, q2),
                Some((p1, q1)) => (p1 + p2.saturating_sub(q1), q2 + q1.saturating_sub(p2)),
            });
            offset += n;
        }
        Ok(acc.unwrap_or((0, 0)))
    }

    fn base_effect(
        &self,
        opcode: Opcode,
        ops: &[Operand],
        base: usize,
    ) -> Result<(usize, usize), InternalError> {
        use Opcode::*;

        let count = |i: usize| -> Result<usize, InternalError> {
            match ops.get(i) {
                Some(Operand::Num(n)) if *n >= 0 => Ok(*n as usize),
                other => Err(self.type_mismatch(base + i, OperandType::Num, other)),
            }
        };
        // (argc, block-arg slots) of a call-site operand
        let call = |i: usize| -> Result<(usize, usize), InternalError> {
            match ops.get(i) {
                Some(Operand::CallInfo(ci)) => Ok((ci.argc as usize, ci.block_arg_slots())),
                other => Err(self.type_mismatch(base + i, OperandType::CallInfo, other)),
            }
        };

        Ok(match opcode {
            Nop | Trace | Jump | DefineMethod => (0, 0),

            GetLocal | GetLocalWc0 | GetLocalWc1 | GetInstanceVariable | GetClassVariable
            | GetGlobal | PutNil | PutSelf | PutObject | PutObjectInt0 | PutObjectInt1
            | PutSpecialObject | PutIseq | PutString | DupArray | CheckKeyword
            | GetInlineCache => (0, 1),

            SetLocal | SetLocalWc0 | SetLocalWc1 | SetInstanceVariable | SetClassVariable
            | SetGlobal | Pop | BranchIf | BranchUnless | OptCaseDispatch => (1, 0),

            GetConstant | ToString | SplatArray | SetInlineCache | Leave | Throw => (1, 1),
            SetConstant => (2, 0),
            ConcatArray | NewRange | CheckMatch => (2, 1),
            DefineClass => (2, 1),

            ConcatStrings | NewArray | NewHash | OptNewArrayMax | OptNewArrayMin => {
                (count(0)?, 1)
            }
            ExpandArray => {
                let num = count(0)?;
                let flag = count(1)?;
                (1, num + (flag & 1))
            }

            Dup => (1, 2),
            DupN => {
                let n = count(0)?;
                (n, 2 * n)
            }
            Swap => (2, 2),
            Reverse => {
                let n = count(0)?;
                (n, n)
            }
            // the operand counts values below the top that must exist
            TopN => {
                let n = count(0)?;
                (n + 1, n + 2)
            }
            SetN => {
                let n = count(0)?;
                (n + 1, n + 1)
            }
            AdjustStack => (count(0)?, 0),

            Send | OptSendWithoutBlock | InvokeSuper => {
                let (argc, block) = call(0)?;
                (argc + 1 + block, 1)
            }
            InvokeBlock => (call(0)?.0, 1),

            OptPlus | OptMinus | OptMult | OptDiv | OptMod | OptEq | OptNeq | OptLt | OptLe
            | OptGt | OptGe | OptLtLt | OptAref | OptAset | OptLength | OptSize | OptEmptyP
            | OptSucc | OptNot => (call(0)?.0 + 1, 1),

            PutObjectPutObject | PutObjectPutString | PutStringPutString | PutStringPutObject
            | PutObjectSetLocal | PutStringSetLocal | DupSetLocal | GetLocalGetLocal
            | GetLocalPutObject => {
                return Err(InternalError::unknown_node(opcode.name(), "as a unified part"));
            }
        })
    }
}

impl std::fmt::Display for Insn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " " } else { ", " }, op)?;
        }
        Ok(())
    }
}

// =============================================================================
// LABELS & ADJUST MARKERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RescueMark {
    #[default]
    None,
    Begin,
    End,
}

#[derive(Debug, Clone, Default)]
pub struct LabelData {
    pub position: Option<usize>,
    pub sp: Option<usize>,
    /// References from instructions, adjusts, the catch table and the
    /// optional-argument table.
    pub refcnt: u32,
    pub rescued: RescueMark,
    pub sc_state: Option<CacheState>,
    elem: Option<ElemId>,
}

/// Stack-depth marker.
///
/// With a line it emits `adjuststack` down to the label's depth (or `nop nop`
/// when nothing needs popping). Without a line it emits nothing and resets
/// the simulated depth to the label's. A missing label means depth 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjust {
    pub label: Option<LabelId>,
    pub line: Option<u32>,
}

impl Adjust {
    pub fn is_restore(&self) -> bool {
        self.line.is_none()
    }

    /// Code words the marker expands to.
    pub fn width(&self) -> usize {
        if self.is_restore() { 0 } else { 2 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElemKind {
    Label(LabelId),
    Insn(Insn),
    Adjust(Adjust),
}

impl ElemKind {
    fn label_refs(&self) -> Vec<LabelId> {
        match self {
            ElemKind::Label(_) => Vec::new(),
            ElemKind::Insn(insn) => insn.labels(),
            ElemKind::Adjust(adj) => adj.label.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Elem {
    pub kind: ElemKind,
    prev: Option<ElemId>,
    next: Option<ElemId>,
    linked: bool,
}

/// Head/tail anchor of a list in an [`Arena`].
#[derive(Debug, Default)]
pub struct Seq {
    head: Option<ElemId>,
    tail: Option<ElemId>,
}

impl Seq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first(&self) -> Option<ElemId> {
        self.head
    }

    pub fn last(&self) -> Option<ElemId> {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// Catch-table entry before label resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchRegion {
    pub kind: CatchKind,
    pub start: LabelId,
    pub end: LabelId,
    pub cont: LabelId,
    /// Index into the scope's children.
    pub child: Option<u32>,
}

// =============================================================================
// ARENA
// =============================================================================

#[derive(Debug, Default)]
pub struct Arena {
    elems: Vec<Elem>,
    labels: Vec<LabelData>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(LabelData::default());
        id
    }

    pub fn label(&self, id: LabelId) -> &LabelData {
        &self.labels[id.0 as usize]
    }

    pub fn label_mut(&mut self, id: LabelId) -> &mut LabelData {
        &mut self.labels[id.0 as usize]
    }

    pub fn label_ids(&self) -> impl Iterator<Item = LabelId> + '_ {
        (0..self.labels.len() as u32).map(LabelId)
    }

    /// Record a reference held outside the instruction list.
    pub fn add_label_ref(&mut self, id: LabelId) {
        self.label_mut(id).refcnt += 1;
    }

    /// Element the label is bound at, if it is in a list.
    pub fn label_elem(&self, id: LabelId) -> Option<ElemId> {
        self.label(id).elem
    }

    pub fn elem(&self, id: ElemId) -> &Elem {
        &self.elems[id.0 as usize]
    }

    pub fn kind(&self, id: ElemId) -> &ElemKind {
        &self.elem(id).kind
    }

    pub fn insn(&self, id: ElemId) -> Option<&Insn> {
        match self.kind(id) {
            ElemKind::Insn(insn) => Some(insn),
            _ => None,
        }
    }

    /// Mutable access to an instruction. Label operands must be changed
    /// through [`Arena::retarget`] to keep reference counts right.
    pub fn insn_mut(&mut self, id: ElemId) -> Option<&mut Insn> {
        match &mut self.elems[id.0 as usize].kind {
            ElemKind::Insn(insn) => Some(insn),
            _ => None,
        }
    }

    pub fn opcode(&self, id: ElemId) -> Option<Opcode> {
        self.insn(id).map(|i| i.opcode)
    }

    pub fn next(&self, id: ElemId) -> Option<ElemId> {
        self.elem(id).next
    }

    pub fn prev(&self, id: ElemId) -> Option<ElemId> {
        self.elem(id).prev
    }

    fn take_refs(&mut self, kind: &ElemKind) {
        for l in kind.label_refs() {
            self.label_mut(l).refcnt += 1;
        }
    }

    fn drop_refs(&mut self, kind: &ElemKind) {
        for l in kind.label_refs() {
            let data = self.label_mut(l);
            data.refcnt = data.refcnt.saturating_sub(1);
        }
    }

    fn alloc(&mut self, kind: ElemKind) -> ElemId {
        let id = ElemId(self.elems.len() as u32);
        self.take_refs(&kind);
        if let ElemKind::Label(l) = kind {
            debug_assert!(self.label(l).elem.is_none(), "{} bound twice", l);
            self.label_mut(l).elem = Some(id);
        }
        self.elems.push(Elem {
            kind,
            prev: None,
            next: None,
            linked: true,
        });
        id
    }

    // -------------------------------------------------------------------------
    // Building
    // -------------------------------------------------------------------------

    pub fn append(&mut self, seq: &mut Seq, kind: ElemKind) -> ElemId {
        let id = self.alloc(kind);
        match seq.tail {
            Some(tail) => {
                self.elems[tail.0 as usize].next = Some(id);
                self.elems[id.0 as usize].prev = Some(tail);
            }
            None => seq.head = Some(id),
        }
        seq.tail = Some(id);
        id
    }

    pub fn emit(
        &mut self,
        seq: &mut Seq,
        line: u32,
        opcode: Opcode,
        operands: Vec<Operand>,
    ) -> ElemId {
        self.append(seq, ElemKind::Insn(Insn::new(opcode, line, operands)))
    }

    pub fn bind(&mut self, seq: &mut Seq, label: LabelId) -> ElemId {
        self.append(seq, ElemKind::Label(label))
    }

    /// `adjuststack` down to `label`'s depth.
    pub fn adjust(&mut self, seq: &mut Seq, line: u32, label: Option<LabelId>) -> ElemId {
        self.append(
            seq,
            ElemKind::Adjust(Adjust {
                label,
                line: Some(line),
            }),
        )
    }

    /// Reset the simulated depth to `label`'s after an exit.
    pub fn adjust_restore(&mut self, seq: &mut Seq, label: LabelId) -> ElemId {
        self.append(
            seq,
            ElemKind::Adjust(Adjust {
                label: Some(label),
                line: None,
            }),
        )
    }

    /// Splice `src` onto the end of `dst`.
    pub fn concat(&mut self, dst: &mut Seq, src: Seq) {
        let (Some(src_head), Some(src_tail)) = (src.head, src.tail) else {
            return;
        };
        match dst.tail {
            Some(tail) => {
                self.elems[tail.0 as usize].next = Some(src_head);
                self.elems[src_head.0 as usize].prev = Some(tail);
            }
            None => dst.head = Some(src_head),
        }
        dst.tail = Some(src_tail);
    }

    /// Splice `src` onto the front of `dst`.
    pub fn prepend(&mut self, dst: &mut Seq, src: Seq) {
        let (Some(src_head), Some(src_tail)) = (src.head, src.tail) else {
            return;
        };
        match dst.head {
            Some(head) => {
                self.elems[src_tail.0 as usize].next = Some(head);
                self.elems[head.0 as usize].prev = Some(src_tail);
            }
            None => dst.tail = Some(src_tail),
        }
        dst.head = Some(src_head);
    }

    pub fn insert_after(&mut self, seq: &mut Seq, at: ElemId, kind: ElemKind) -> ElemId {
        let id = self.alloc(kind);
        let next = self.next(at);
        self.elems[id.0 as usize].prev = Some(at);
        self.elems[id.0 as usize].next = next;
        self.elems[at.0 as usize].next = Some(id);
        match next {
            Some(n) => self.elems[n.0 as usize].prev = Some(id),
            None => seq.tail = Some(id),
        }
        id
    }

    pub fn insert_before(&mut self, seq: &mut Seq, at: ElemId, kind: ElemKind) -> ElemId {
        let id = self.alloc(kind);
        let prev = self.prev(at);
        self.elems[id.0 as usize].next = Some(at);
        self.elems[id.0 as usize].prev = prev;
        self.elems[at.0 as usize].prev = Some(id);
        match prev {
            Some(p) => self.elems[p.0 as usize].next = Some(id),
            None => seq.head = Some(id),
        }
        id
    }

    /// Unlink an element. Its label references are released.
    ///
    /// The removed element keeps its forward link so a scan that is
    /// standing on it can still step to the next element.
    pub fn remove(&mut self, seq: &mut Seq, id: ElemId) {
        if !self.elem(id).linked {
            return;
        }
        let (prev, next) = (self.prev(id), self.next(id));
        match prev {
            Some(p) => self.elems[p.0 as usize].next = next,
            None => seq.head = next,
        }
        match next {
            Some(n) => self.elems[n.0 as usize].prev = prev,
            None => seq.tail = prev,
        }

        let kind = self.elems[id.0 as usize].kind.clone();
        self.drop_refs(&kind);
        if let ElemKind::Label(l) = kind {
            self.label_mut(l).elem = None;
        }
        let elem = &mut self.elems[id.0 as usize];
        elem.prev = None;
        elem.linked = false;
    }

    /// Swap an element's content in place.
    pub fn replace(&mut self, id: ElemId, kind: ElemKind) {
        let old = std::mem::replace(&mut self.elems[id.0 as usize].kind, kind.clone());
        self.drop_refs(&old);
        self.take_refs(&kind);
        if let ElemKind::Label(l) = old {
            self.label_mut(l).elem = None;
        }
        if let ElemKind::Label(l) = kind {
            self.label_mut(l).elem = Some(id);
        }
    }

    /// Point a label operand at a new target.
    pub fn retarget(&mut self, id: ElemId, slot: usize, target: LabelId) {
        let old = match self.insn_mut(id).and_then(|insn| insn.operands.get_mut(slot)) {
            Some(Operand::Label(l)) => std::mem::replace(l, target),
            _ => return,
        };
        let data = self.label_mut(old);
        data.refcnt = data.refcnt.saturating_sub(1);
        self.label_mut(target).refcnt += 1;
    }

    // -------------------------------------------------------------------------
    // Walking
    // -------------------------------------------------------------------------

    /// Snapshot of the element ids in list order.
    pub fn ids(&self, seq: &Seq) -> Vec<ElemId> {
        let mut out = Vec::new();
        let mut cur = seq.head;
        while let Some(id) = cur {
            out.push(id);
            cur = self.next(id);
        }
        out
    }

    pub fn is_linked(&self, id: ElemId) -> bool {
        self.elem(id).linked
    }

    /// Next linked element after `id`, which may itself have been removed.
    pub fn next_linked(&self, id: ElemId) -> Option<ElemId> {
        let mut cur = self.next(id);
        while let Some(c) = cur {
            if self.is_linked(c) {
                return Some(c);
            }
            cur = self.next(c);
        }
        None
    }

    fn transparent(&self, id: ElemId) -> bool {
        match self.kind(id) {
            ElemKind::Label(_) => true,
            ElemKind::Adjust(adj) => adj.is_restore(),
            ElemKind::Insn(_) => false,
        }
    }

    /// Next instruction, skipping labels and restore markers. Stops at an
    /// adjust that emits code.
    pub fn next_insn(&self, id: ElemId) -> Option<ElemId> {
        let mut cur = self.next(id);
        while let Some(c) = cur {
            if self.insn(c).is_some() {
                return Some(c);
            }
            if !self.transparent(c) {
                return None;
            }
            cur = self.next(c);
        }
        None
    }

    pub fn prev_insn(&self, id: ElemId) -> Option<ElemId> {
        let mut cur = self.prev(id);
        while let Some(c) = cur {
            if self.insn(c).is_some() {
                return Some(c);
            }
            if !self.transparent(c) {
                return None;
            }
            cur = self.prev(c);
        }
        None
    }

    /// First instruction executed after jumping to `label`.
    pub fn destination(&self, label: LabelId) -> Option<ElemId> {
        let at = self.label_elem(label)?;
        self.next_insn(at)
    }

    /// Render a list for trace logs.
    pub fn dump(&self, seq: &Seq) -> String {
        let mut out = String::new();
        for id in self.ids(seq) {
            let _ = match self.kind(id) {
                ElemKind::Label(l) => writeln!(out, "{}: (refcnt {})", l, self.label(*l).refcnt),
                ElemKind::Insn(insn) => writeln!(out, "    {:<40} ({})", insn.to_string(), insn.line),
                ElemKind::Adjust(adj) => match adj.label {
                    Some(l) => writeln!(out, "    adjust {}{}", l, if adj.is_restore() { " (restore)" } else { "" }),
                    None => writeln!(out, "    adjust 0"),
                },
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::iseq::call_flag;

    fn opcodes(arena: &Arena, seq: &Seq) -> Vec<Opcode> {
        arena
            .ids(seq)
            .into_iter()
            .filter_map(|id| arena.opcode(id))
            .collect()
    }

    #[test]
    fn test_append_and_concat() {
        let mut arena = Arena::new();
        let mut a = Seq::new();
        let mut b = Seq::new();
        arena.emit(&mut a, 1, Opcode::PutNil, vec![]);
        arena.emit(&mut b, 1, Opcode::Pop, vec![]);
        arena.emit(&mut b, 1, Opcode::Leave, vec![]);
        arena.concat(&mut a, b);

        assert_eq!(
            opcodes(&arena, &a),
            vec![Opcode::PutNil, Opcode::Pop, Opcode::Leave]
        );
    }

    #[test]
    fn test_prepend() {
        let mut arena = Arena::new();
        let mut a = Seq::new();
        let mut b = Seq::new();
        arena.emit(&mut a, 1, Opcode::Leave, vec![]);
        arena.emit(&mut b, 1, Opcode::PutSelf, vec![]);
        arena.prepend(&mut a, b);

        assert_eq!(opcodes(&arena, &a), vec![Opcode::PutSelf, Opcode::Leave]);
    }

    #[test]
    fn test_concat_empty_is_noop() {
        let mut arena = Arena::new();
        let mut a = Seq::new();
        arena.emit(&mut a, 1, Opcode::Leave, vec![]);
        arena.concat(&mut a, Seq::new());
        assert_eq!(opcodes(&arena, &a), vec![Opcode::Leave]);
    }

    #[test]
    fn test_insert_and_remove_maintain_links() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let first = arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        let last = arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        let mid = arena.insert_after(&mut seq, first, ElemKind::Insn(Insn::new(Opcode::Dup, 1, vec![])));
        arena.insert_before(&mut seq, first, ElemKind::Insn(Insn::new(Opcode::Nop, 1, vec![])));
        assert_eq!(
            opcodes(&arena, &seq),
            vec![Opcode::Nop, Opcode::PutNil, Opcode::Dup, Opcode::Leave]
        );

        arena.remove(&mut seq, mid);
        arena.remove(&mut seq, last);
        assert_eq!(opcodes(&arena, &seq), vec![Opcode::Nop, Opcode::PutNil]);
        assert_eq!(seq.last(), Some(first));
        assert!(!arena.is_linked(mid));
    }

    #[test]
    fn test_refcnt_follows_references() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let target = arena.new_label();
        let other = arena.new_label();

        let jump = arena.emit(&mut seq, 1, Opcode::Jump, vec![Operand::Label(target)]);
        arena.adjust(&mut seq, 1, Some(target));
        assert_eq!(arena.label(target).refcnt, 2);

        arena.retarget(jump, 0, other);
        assert_eq!(arena.label(target).refcnt, 1);
        assert_eq!(arena.label(other).refcnt, 1);

        arena.remove(&mut seq, jump);
        assert_eq!(arena.label(other).refcnt, 0);
    }

    #[test]
    fn test_replace_swaps_references() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let l = arena.new_label();
        let id = arena.emit(&mut seq, 1, Opcode::Jump, vec![Operand::Label(l)]);

        arena.replace(id, ElemKind::Insn(Insn::new(Opcode::Leave, 1, vec![])));
        assert_eq!(arena.label(l).refcnt, 0);
        assert_eq!(arena.opcode(id), Some(Opcode::Leave));
    }

    #[test]
    fn test_destination_skips_labels() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let a = arena.new_label();
        let b = arena.new_label();
        arena.bind(&mut seq, a);
        arena.bind(&mut seq, b);
        let leave = arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        assert_eq!(arena.destination(a), Some(leave));
        assert_eq!(arena.label_elem(b).and_then(|e| arena.next_insn(e)), Some(leave));
    }

    #[test]
    fn test_next_insn_stops_at_emitting_adjust() {
        let mut arena = Arena::new();
        let mut seq = Seq::new();
        let first = arena.emit(&mut seq, 1, Opcode::PutNil, vec![]);
        arena.adjust(&mut seq, 1, None);
        arena.emit(&mut seq, 1, Opcode::Leave, vec![]);

        assert_eq!(arena.next_insn(first), None);
    }

    #[test]
    fn test_send_effect_counts_receiver_and_block_arg() {
        let mut ci = CallSite::new("foo", 2, call_flag::ARGS_BLOCKARG);
        let insn = Insn::new(Opcode::Send, 1, vec![Operand::CallInfo(ci.clone())]);
        assert_eq!(insn.stack_effect().unwrap(), (4, 1));

        ci.flags = 0;
        let insn = Insn::new(Opcode::InvokeBlock, 1, vec![Operand::CallInfo(ci)]);
        assert_eq!(insn.stack_effect().unwrap(), (2, 1));
    }

    #[test]
    fn test_expandarray_effect() {
        let insn = Insn::new(Opcode::ExpandArray, 1, vec![Operand::Num(3), Operand::Num(1)]);
        assert_eq!(insn.stack_effect().unwrap(), (1, 4));
    }

    #[test]
    fn test_unified_effect_composes_parts() {
        let insn = Insn::new(
            Opcode::PutObjectSetLocal,
            1,
            vec![
                Operand::Value(Value::Integer(1)),
                Operand::Num(0),
                Operand::Num(0),
            ],
        );
        assert_eq!(insn.stack_effect().unwrap(), (0, 0));

        let insn = Insn::new(
            Opcode::DupSetLocal,
            1,
            vec![Operand::Num(0), Operand::Num(0)],
        );
        assert_eq!(insn.stack_effect().unwrap(), (1, 1));

        let insn = Insn::new(
            Opcode::GetLocalGetLocal,
            1,
            vec![Operand::Num(0), Operand::Num(0), Operand::Num(1), Operand::Num(0)],
        );
        assert_eq!(insn.stack_effect().unwrap(), (0, 2));
    }

    #[test]
    fn test_effect_rejects_wrong_operand() {
        let insn = Insn::new(Opcode::NewArray, 1, vec![Operand::Value(Value::Nil)]);
        assert!(matches!(
            insn.stack_effect(),
            Err(InternalError::OperandTypeMismatch { index: 0, .. })
        ));
    }
}
