use serde::{Deserialize, Serialize};

use crate::bytecode::op::Opcode;
use crate::bytecode::params::ParamLayout;
use crate::lang::value::Value;

/// Kind of scope an instruction sequence was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IseqKind {
    Top,
    Main,
    Method,
    Class,
    Block,
    Rescue,
    Ensure,
    Eval,
}

impl IseqKind {
    pub fn name(self) -> &'static str {
        match self {
            IseqKind::Top => "top",
            IseqKind::Main => "main",
            IseqKind::Method => "method",
            IseqKind::Class => "class",
            IseqKind::Block => "block",
            IseqKind::Rescue => "rescue",
            IseqKind::Ensure => "ensure",
            IseqKind::Eval => "eval",
        }
    }

    /// Scopes whose locals are resolved through the enclosing scope.
    pub fn is_dynamic(self) -> bool {
        matches!(self, IseqKind::Block | IseqKind::Rescue | IseqKind::Ensure)
    }
}

// =============================================================================
// CALL SITES
// =============================================================================

/// Call flags carried by a [`CallSite`].
pub mod call_flag {
    pub const ARGS_SPLAT: u32 = 0x01;
    pub const ARGS_BLOCKARG: u32 = 0x02;
    pub const FCALL: u32 = 0x04;
    pub const VCALL: u32 = 0x08;
    pub const ARGS_SIMPLE: u32 = 0x10;
    pub const BLOCKISEQ: u32 = 0x20;
    pub const KWARG: u32 = 0x40;
    pub const TAILCALL: u32 = 0x80;
    pub const SUPER: u32 = 0x100;
    pub const ZSUPER: u32 = 0x200;
    /// The last argument is a hash of keywords to splat into the callee.
    pub const KW_SPLAT: u32 = 0x400;

    const NAMES: [(u32, &str); 11] = [
        (ARGS_SPLAT, "ARGS_SPLAT"),
        (ARGS_BLOCKARG, "ARGS_BLOCKARG"),
        (FCALL, "FCALL"),
        (VCALL, "VCALL"),
        (ARGS_SIMPLE, "ARGS_SIMPLE"),
        (BLOCKISEQ, "BLOCKISEQ"),
        (KWARG, "KWARG"),
        (TAILCALL, "TAILCALL"),
        (SUPER, "SUPER"),
        (ZSUPER, "ZSUPER"),
        (KW_SPLAT, "KW_SPLAT"),
    ];

    /// `FCALL|ARGS_SIMPLE` style rendering.
    pub fn describe(flags: u32) -> String {
        NAMES
            .iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Call-site descriptor.
///
/// `argc` counts keyword values but not the receiver or a block argument.
/// `block` indexes the owning sequence's children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub mid: String,
    pub argc: u32,
    pub flags: u32,
    #[serde(default)]
    pub kw_arg: Vec<String>,
    #[serde(default)]
    pub block: Option<u32>,
}

impl CallSite {
    pub fn new(mid: impl Into<String>, argc: u32, flags: u32) -> Self {
        CallSite {
            mid: mid.into(),
            argc,
            flags,
            kw_arg: Vec::new(),
            block: None,
        }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Stack slots consumed beyond the receiver and arguments.
    pub fn block_arg_slots(&self) -> usize {
        usize::from(self.has(call_flag::ARGS_BLOCKARG))
    }
}

// =============================================================================
// SERIALIZED FORM
// =============================================================================

/// One word of the flat instruction array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Word {
    Op(Opcode),
    /// Relative jump: `target - (pc + len)`.
    Offset(i32),
    Num(i64),
    /// Index into `literals`.
    Literal(u32),
    /// Index into `identifiers`.
    Id(u32),
    InlineCache(u32),
    /// Index into `call_infos`.
    CallInfo(u32),
    /// Index into `dispatch_maps`.
    Dispatch(u32),
    /// Index into `globals`.
    Global(u32),
    /// Index into `children`.
    Iseq(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub line: u32,
    pub position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CatchKind {
    Rescue = 1,
    Ensure = 2,
    Retry = 3,
    Break = 4,
    Redo = 5,
    Next = 6,
}

impl CatchKind {
    pub fn name(self) -> &'static str {
        match self {
            CatchKind::Rescue => "rescue",
            CatchKind::Ensure => "ensure",
            CatchKind::Retry => "retry",
            CatchKind::Break => "break",
            CatchKind::Redo => "redo",
            CatchKind::Next => "next",
        }
    }

    /// Continuations that receive the escaping value on the stack.
    pub fn pushes_value(self) -> bool {
        matches!(self, CatchKind::Rescue | CatchKind::Break | CatchKind::Next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchEntry {
    pub kind: CatchKind,
    pub start: u32,
    pub end: u32,
    pub cont: u32,
    pub sp: u32,
    pub child: Option<u32>,
}

/// `opt_case_dispatch` table: literal index to relative offset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchMap {
    pub entries: Vec<(u32, i32)>,
}

/// Register-cache state for the top of the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheState {
    /// Nothing cached.
    #[default]
    XX,
    /// Top in register A.
    AX,
    /// Top in register B.
    BX,
    /// A below, B on top.
    AB,
    /// B below, A on top.
    BA,
}

impl CacheState {
    pub fn name(self) -> &'static str {
        match self {
            CacheState::XX => "XX",
            CacheState::AX => "AX",
            CacheState::BX => "BX",
            CacheState::AB => "AB",
            CacheState::BA => "BA",
        }
    }

    /// Values held in registers.
    pub fn depth(self) -> usize {
        match self {
            CacheState::XX => 0,
            CacheState::AX | CacheState::BX => 1,
            CacheState::AB | CacheState::BA => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub position: u32,
    pub entry: CacheState,
    pub exit: CacheState,
}

// =============================================================================
// INSTRUCTION SEQUENCE
// =============================================================================

/// Finalized output of compiling one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionSequence {
    pub name: String,
    pub kind: IseqKind,
    pub path: String,
    pub first_line: u32,

    pub local_table: Vec<String>,
    pub params: ParamLayout,

    /// Serialized words. Written only by assembly and the stack cache pass.
    pub(crate) code: Vec<Word>,

    pub literals: Vec<Value>,
    pub identifiers: Vec<String>,
    pub globals: Vec<String>,
    pub call_infos: Vec<CallSite>,
    pub dispatch_maps: Vec<DispatchMap>,
    pub inline_cache_size: u32,

    pub line_table: Vec<LineEntry>,
    pub catch_table: Vec<CatchEntry>,
    pub stack_max: u32,

    pub children: Vec<InstructionSequence>,

    #[serde(default)]
    pub stack_cache: Vec<CacheEntry>,

    /// Verbatim copy of `code` taken at finalization.
    original_code: Vec<Word>,
}

impl InstructionSequence {
    /// Builds an empty sequence; finalization fills in the rest.
    pub(crate) fn empty(name: String, kind: IseqKind, path: String, first_line: u32) -> Self {
        InstructionSequence {
            name,
            kind,
            path,
            first_line,
            local_table: Vec::new(),
            params: ParamLayout::default(),
            code: Vec::new(),
            literals: Vec::new(),
            identifiers: Vec::new(),
            globals: Vec::new(),
            call_infos: Vec::new(),
            dispatch_maps: Vec::new(),
            inline_cache_size: 0,
            line_table: Vec::new(),
            catch_table: Vec::new(),
            stack_max: 0,
            children: Vec::new(),
            stack_cache: Vec::new(),
            original_code: Vec::new(),
        }
    }

    pub(crate) fn freeze_code(&mut self) {
        self.original_code = self.code.clone();
    }

    /// The serialized words.
    pub fn code(&self) -> &[Word] {
        &self.code
    }

    /// The serialized words exactly as finalization produced them.
    pub fn original_code(&self) -> &[Word] {
        &self.original_code
    }

    /// Instruction start positions, in order.
    pub fn instruction_boundaries(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for (pc, word) in self.code.iter().enumerate() {
            if matches!(word, Word::Op(_)) {
                out.push(pc);
            }
        }
        out
    }

    /// Opcodes in emission order.
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.code
            .iter()
            .filter_map(|w| match w {
                Word::Op(op) => Some(*op),
                _ => None,
            })
            .collect()
    }

    pub fn literal(&self, idx: u32) -> Option<&Value> {
        self.literals.get(idx as usize)
    }

    pub fn identifier(&self, idx: u32) -> Option<&str> {
        self.identifiers.get(idx as usize).map(String::as_str)
    }

    /// Encode with postcard.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
