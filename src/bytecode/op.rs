use serde::{Deserialize, Serialize};

// =============================================================================
// OPERAND SCHEMA
// =============================================================================

/// Kind of a single operand slot, as declared by the opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandType {
    /// Jump target, serialized as a relative offset.
    Offset,
    /// Immediate integer.
    Num,
    /// Literal value, serialized as a literal-pool index.
    Value,
    /// Identifier, serialized as an identifier-pool index.
    Id,
    /// Inline-cache slot index.
    InlineCache,
    /// Call-site descriptor, serialized as a call-info slot.
    CallInfo,
    /// Literal-to-label map used by `opt_case_dispatch`.
    Dispatch,
    /// Global variable binding.
    Global,
    /// Child instruction sequence.
    Iseq,
}

impl OperandType {
    pub fn name(self) -> &'static str {
        match self {
            OperandType::Offset => "offset",
            OperandType::Num => "num",
            OperandType::Value => "value",
            OperandType::Id => "id",
            OperandType::InlineCache => "ic",
            OperandType::CallInfo => "callinfo",
            OperandType::Dispatch => "cdhash",
            OperandType::Global => "gentry",
            OperandType::Iseq => "iseq",
        }
    }
}

// =============================================================================
// OPCODES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Nop,

    // variables
    GetLocal,
    SetLocal,
    GetLocalWc0,
    GetLocalWc1,
    SetLocalWc0,
    SetLocalWc1,
    GetInstanceVariable,
    SetInstanceVariable,
    GetClassVariable,
    SetClassVariable,
    GetConstant,
    SetConstant,
    GetGlobal,
    SetGlobal,

    // literals
    PutNil,
    PutSelf,
    PutObject,
    PutObjectInt0,
    PutObjectInt1,
    PutSpecialObject,
    PutIseq,
    PutString,
    ConcatStrings,
    ToString,

    // collections
    NewArray,
    DupArray,
    ExpandArray,
    ConcatArray,
    SplatArray,
    NewHash,
    NewRange,

    // stack
    Pop,
    Dup,
    DupN,
    Swap,
    Reverse,
    TopN,
    SetN,
    AdjustStack,

    // matching / misc
    CheckMatch,
    CheckKeyword,
    Trace,

    // definitions
    DefineClass,
    DefineMethod,

    // calls
    Send,
    OptSendWithoutBlock,
    InvokeSuper,
    InvokeBlock,
    Leave,
    Throw,

    // ==========================================================================
    // Control flow
    // ==========================================================================
    /// Unconditional jump to a label.
    Jump,
    /// Pop; jump if truthy.
    BranchIf,
    /// Pop; jump if falsy.
    BranchUnless,

    /// Push the cached constant and jump if the cache is warm, else push nil.
    GetInlineCache,
    SetInlineCache,

    /// Pop the subject; jump through the literal map or to the else label.
    /// Falls through when the subject's `===` may be redefined.
    OptCaseDispatch,

    // ==========================================================================
    // Specialized calls
    // ==========================================================================
    OptPlus,
    OptMinus,
    OptMult,
    OptDiv,
    OptMod,
    OptEq,
    OptNeq,
    OptLt,
    OptLe,
    OptGt,
    OptGe,
    OptLtLt,
    OptAref,
    OptAset,
    OptLength,
    OptSize,
    OptEmptyP,
    OptSucc,
    OptNot,
    OptNewArrayMax,
    OptNewArrayMin,

    // ==========================================================================
    // Unified instructions: operands are the concatenation of the parts
    // ==========================================================================
    PutObjectPutObject,
    PutObjectPutString,
    PutStringPutString,
    PutStringPutObject,
    PutObjectSetLocal,
    PutStringSetLocal,
    DupSetLocal,
    GetLocalGetLocal,
    GetLocalPutObject,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "nop",
            GetLocal => "getlocal",
            SetLocal => "setlocal",
            GetLocalWc0 => "getlocal_WC_0",
            GetLocalWc1 => "getlocal_WC_1",
            SetLocalWc0 => "setlocal_WC_0",
            SetLocalWc1 => "setlocal_WC_1",
            GetInstanceVariable => "getinstancevariable",
            SetInstanceVariable => "setinstancevariable",
            GetClassVariable => "getclassvariable",
            SetClassVariable => "setclassvariable",
            GetConstant => "getconstant",
            SetConstant => "setconstant",
            GetGlobal => "getglobal",
            SetGlobal => "setglobal",
            PutNil => "putnil",
            PutSelf => "putself",
            PutObject => "putobject",
            PutObjectInt0 => "putobject_INT2FIX_0_",
            PutObjectInt1 => "putobject_INT2FIX_1_",
            PutSpecialObject => "putspecialobject",
            PutIseq => "putiseq",
            PutString => "putstring",
            ConcatStrings => "concatstrings",
            ToString => "tostring",
            NewArray => "newarray",
            DupArray => "duparray",
            ExpandArray => "expandarray",
            ConcatArray => "concatarray",
            SplatArray => "splatarray",
            NewHash => "newhash",
            NewRange => "newrange",
            Pop => "pop",
            Dup => "dup",
            DupN => "dupn",
            Swap => "swap",
            Reverse => "reverse",
            TopN => "topn",
            SetN => "setn",
            AdjustStack => "adjuststack",
            CheckMatch => "checkmatch",
            CheckKeyword => "checkkeyword",
            Trace => "trace",
            DefineClass => "defineclass",
            DefineMethod => "definemethod",
            Send => "send",
            OptSendWithoutBlock => "opt_send_without_block",
            InvokeSuper => "invokesuper",
            InvokeBlock => "invokeblock",
            Leave => "leave",
            Throw => "throw",
            Jump => "jump",
            BranchIf => "branchif",
            BranchUnless => "branchunless",
            GetInlineCache => "getinlinecache",
            SetInlineCache => "setinlinecache",
            OptCaseDispatch => "opt_case_dispatch",
            OptPlus => "opt_plus",
            OptMinus => "opt_minus",
            OptMult => "opt_mult",
            OptDiv => "opt_div",
            OptMod => "opt_mod",
            OptEq => "opt_eq",
            OptNeq => "opt_neq",
            OptLt => "opt_lt",
            OptLe => "opt_le",
            OptGt => "opt_gt",
            OptGe => "opt_ge",
            OptLtLt => "opt_ltlt",
            OptAref => "opt_aref",
            OptAset => "opt_aset",
            OptLength => "opt_length",
            OptSize => "opt_size",
            OptEmptyP => "opt_empty_p",
            OptSucc => "opt_succ",
            OptNot => "opt_not",
            OptNewArrayMax => "opt_newarray_max",
            OptNewArrayMin => "opt_newarray_min",
            PutObjectPutObject => "UNIFIED_putobject_putobject",
            PutObjectPutString => "UNIFIED_putobject_putstring",
            PutStringPutString => "UNIFIED_putstring_putstring",
            PutStringPutObject => "UNIFIED_putstring_putobject",
            PutObjectSetLocal => "UNIFIED_putobject_setlocal",
            PutStringSetLocal => "UNIFIED_putstring_setlocal",
            DupSetLocal => "UNIFIED_dup_setlocal",
            GetLocalGetLocal => "UNIFIED_getlocal_getlocal",
            GetLocalPutObject => "UNIFIED_getlocal_putobject",
        }
    }

    /// Declared operand schema. Unified instructions use the concatenation
    /// of their parts' schemas.
    pub fn operand_types(self) -> Vec<OperandType> {
        match self.parts() {
            Some(parts) => parts.iter().flat_map(|p| p.base_operand_types()).copied().collect(),
            None => self.base_operand_types().to_vec(),
        }
    }

    /// Number of operand slots.
    pub fn arity(self) -> usize {
        match self.parts() {
            Some(parts) => parts.iter().map(|p| p.base_operand_types().len()).sum(),
            None => self.base_operand_types().len(),
        }
    }

    /// Code words taken by one instruction: the opcode plus its operands.
    pub fn len(self) -> usize {
        1 + self.arity()
    }

    fn base_operand_types(self) -> &'static [OperandType] {
        use OperandType as T;
        use Opcode::*;
        match self {
            GetLocal | SetLocal => &[T::Num, T::Num],
            GetLocalWc0 | GetLocalWc1 | SetLocalWc0 | SetLocalWc1 => &[T::Num],
            GetInstanceVariable | SetInstanceVariable => &[T::Id, T::InlineCache],
            GetClassVariable | SetClassVariable => &[T::Id],
            GetConstant | SetConstant => &[T::Id],
            GetGlobal | SetGlobal => &[T::Global],

            PutObject | PutString | DupArray | SplatArray => &[T::Value],
            PutSpecialObject => &[T::Num],
            PutIseq => &[T::Iseq],
            ConcatStrings | NewArray | NewHash | NewRange => &[T::Num],
            ExpandArray => &[T::Num, T::Num],

            DupN | Reverse | TopN | SetN | AdjustStack => &[T::Num],
            CheckMatch | Trace | Throw => &[T::Num],
            CheckKeyword => &[T::Num, T::Num],

            DefineClass => &[T::Id, T::Iseq, T::Num],
            DefineMethod => &[T::Id, T::Iseq],

            Send | OptSendWithoutBlock | InvokeSuper | InvokeBlock => &[T::CallInfo],
            OptPlus | OptMinus | OptMult | OptDiv | OptMod | OptEq | OptLt | OptLe | OptGt
            | OptGe | OptLtLt | OptAref | OptAset | OptLength | OptSize | OptEmptyP | OptSucc
            | OptNot => &[T::CallInfo],
            OptNeq => &[T::CallInfo, T::CallInfo],
            OptNewArrayMax | OptNewArrayMin => &[T::Num],

            Jump | BranchIf | BranchUnless => &[T::Offset],
            GetInlineCache => &[T::Offset, T::InlineCache],
            SetInlineCache => &[T::InlineCache],
            OptCaseDispatch => &[T::Dispatch, T::Offset],

            Nop | PutNil | PutSelf | PutObjectInt0 | PutObjectInt1 | ToString | ConcatArray
            | Pop | Dup | Swap | Leave => &[],

            PutObjectPutObject | PutObjectPutString | PutStringPutString | PutStringPutObject
            | PutObjectSetLocal | PutStringSetLocal | DupSetLocal | GetLocalGetLocal
            | GetLocalPutObject => &[],
        }
    }

    /// Component instructions of a unified instruction.
    pub fn parts(self) -> Option<&'static [Opcode]> {
        use Opcode::*;
        Some(match self {
            PutObjectPutObject => &[PutObject, PutObject],
            PutObjectPutString => &[PutObject, PutString],
            PutStringPutString => &[PutString, PutString],
            PutStringPutObject => &[PutString, PutObject],
            PutObjectSetLocal => &[PutObject, SetLocal],
            PutStringSetLocal => &[PutString, SetLocal],
            DupSetLocal => &[Dup, SetLocal],
            GetLocalGetLocal => &[GetLocal, GetLocal],
            GetLocalPutObject => &[GetLocal, PutObject],
            _ => return None,
        })
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Leave | Opcode::Throw)
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::BranchIf | Opcode::BranchUnless
        )
    }

    /// Instructions whose only effect is pushing a constant.
    pub fn is_pure_push(self) -> bool {
        matches!(
            self,
            Opcode::PutObject | Opcode::PutNil | Opcode::PutSelf | Opcode::PutString
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// IMMEDIATE OPERAND CONSTANTS
// =============================================================================

/// Events carried by `trace`.
pub mod event {
    pub const LINE: i64 = 0x0001;
    pub const CLASS: i64 = 0x0002;
    pub const END: i64 = 0x0004;
    pub const CALL: i64 = 0x0008;
    pub const RETURN: i64 = 0x0010;
    pub const B_CALL: i64 = 0x0100;
    pub const B_RETURN: i64 = 0x0200;

    pub fn name(event: i64) -> &'static str {
        match event {
            LINE => "line",
            CLASS => "class",
            END => "end",
            CALL => "call",
            RETURN => "return",
            B_CALL => "b_call",
            B_RETURN => "b_return",
            _ => "unknown",
        }
    }
}

/// Tags carried by `throw`.
pub mod throw_tag {
    pub const RETURN: i64 = 0x1;
    pub const BREAK: i64 = 0x2;
    pub const NEXT: i64 = 0x3;
    pub const RETRY: i64 = 0x4;
    pub const REDO: i64 = 0x5;

    /// The catching frame is the thrower's own frame or a loop in an
    /// enclosing one; no block frames are unwound.
    pub const NO_ESCAPE: i64 = 0x8000;
    pub const LEVEL_SHIFT: u32 = 16;
}

/// `checkmatch` flags.
pub mod checkmatch {
    pub const WHEN: i64 = 1;
    pub const CASE: i64 = 2;
    pub const RESCUE: i64 = 3;
    pub const ARRAY: i64 = 0x04;
}

/// `putspecialobject` operands.
pub mod special_object {
    pub const VMCORE: i64 = 1;
    pub const CBASE: i64 = 2;
    pub const CONST_BASE: i64 = 3;
}

/// `defineclass` flags.
pub mod define_class {
    pub const CLASS: i64 = 0;
    pub const MODULE: i64 = 2;
    pub const HAS_SUPERCLASS: i64 = 0x10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_counts_opcode_word() {
        assert_eq!(Opcode::Leave.len(), 1);
        assert_eq!(Opcode::Jump.len(), 2);
        assert_eq!(Opcode::GetLocal.len(), 3);
        assert_eq!(Opcode::OptCaseDispatch.len(), 3);
    }

    #[test]
    fn test_unified_schema_is_concatenation() {
        assert_eq!(
            Opcode::PutObjectSetLocal.operand_types(),
            vec![OperandType::Value, OperandType::Num, OperandType::Num]
        );
        assert_eq!(Opcode::DupSetLocal.arity(), 2);
        assert_eq!(Opcode::GetLocalGetLocal.len(), 5);
    }

    #[test]
    fn test_opt_neq_carries_two_call_infos() {
        assert_eq!(
            Opcode::OptNeq.operand_types(),
            vec![OperandType::CallInfo, OperandType::CallInfo]
        );
    }

    #[test]
    fn test_terminators() {
        assert!(Opcode::Jump.is_terminator());
        assert!(Opcode::Leave.is_terminator());
        assert!(Opcode::Throw.is_terminator());
        assert!(!Opcode::BranchIf.is_terminator());
    }

    #[test]
    fn test_names() {
        assert_eq!(Opcode::OptCaseDispatch.to_string(), "opt_case_dispatch");
        assert_eq!(Opcode::GetLocalWc0.name(), "getlocal_WC_0");
        assert_eq!(event::name(event::B_CALL), "b_call");
    }
}
