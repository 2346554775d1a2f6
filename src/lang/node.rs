use super::value::Value;
use serde::{Deserialize, Serialize};

/// Abstract Syntax Tree node.
///
/// Produced by an external parser and handed to the compiler read-only.
/// Every node carries the source line it starts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub line: u32,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(line: u32, kind: NodeKind) -> Self {
        Self { line, kind }
    }

    /// Short name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    // ───────────────────────────── Literals ─────────────────────────────
    Nil,
    True,
    False,
    SelfRef,

    /// Integer, float, symbol or range literal.
    Lit(Value),

    /// String literal. Pushed with `putstring` unless frozen string
    /// literals are enabled.
    Str(String),

    /// Interpolated string: `"a#{b}c"`. `Str` parts are taken verbatim,
    /// every other part is converted with `tostring`.
    DStr(Vec<Node>),

    Array(Vec<Node>),
    Hash(Vec<(Node, Node)>),

    /// Range whose bounds are not both integer literals.
    Range {
        low: Box<Node>,
        high: Box<Node>,
        exclusive: bool,
    },

    /// `*expr` in argument, array or `when` position.
    Splat(Box<Node>),

    // ───────────────────────────── Variables ────────────────────────────
    LocalVar(String),
    LocalAsgn {
        name: String,
        value: Box<Node>,
    },
    IVar(String),
    IAsgn {
        name: String,
        value: Box<Node>,
    },
    GVar(String),
    GAsgn {
        name: String,
        value: Box<Node>,
    },
    CVar(String),
    CVAsgn {
        name: String,
        value: Box<Node>,
    },

    /// Lexically scoped constant: `Foo`.
    Const(String),

    /// `scope::Name`.
    ScopedConst {
        scope: Box<Node>,
        name: String,
    },

    /// `::Name`.
    TopConst(String),

    ConstDecl {
        name: String,
        value: Box<Node>,
    },

    // ──────────────────────────── Assignment ────────────────────────────
    /// `a, b, *c, d = value`
    MAsgn(MultiAssign),

    /// `target ||= value`, `target &&= value`, `target += value`
    OpAsgn {
        target: Box<AssignTarget>,
        op: OpAsgnOp,
        value: Box<Node>,
    },

    /// `recv.name = v` / `recv[i] = v`. The assigned value is the last
    /// element of `args`, and `name` already ends in `=`.
    AttrAsgn {
        recv: Box<Node>,
        name: String,
        args: CallArgs,
    },

    // ─────────────────────────── Control flow ───────────────────────────
    /// Statement sequence. Its value is the value of the last statement.
    Block(Vec<Node>),

    If {
        cond: Box<Node>,
        then: Option<Box<Node>>,
        else_: Option<Box<Node>>,
    },

    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),

    /// `case subject; when ...; else ...; end`. Without a subject each
    /// `when` value is evaluated as a condition.
    Case {
        subject: Option<Box<Node>>,
        whens: Vec<When>,
        else_: Option<Box<Node>>,
    },

    /// `do_while` marks `begin ... end while cond`, where the body runs
    /// before the first test.
    While {
        cond: Box<Node>,
        body: Option<Box<Node>>,
        do_while: bool,
    },
    Until {
        cond: Box<Node>,
        body: Option<Box<Node>>,
        do_while: bool,
    },

    Break(Option<Box<Node>>),
    Next(Option<Box<Node>>),
    Redo,
    Retry,
    Return(Option<Box<Node>>),

    Begin(Option<Box<Node>>),

    Rescue {
        body: Option<Box<Node>>,
        clauses: Vec<RescueClause>,
        else_: Option<Box<Node>>,
    },

    Ensure {
        body: Option<Box<Node>>,
        ensure: Option<Box<Node>>,
    },

    // ────────────────────────────── Calls ───────────────────────────────
    /// Method call. A missing receiver is an implicit `self` call.
    Call {
        recv: Option<Box<Node>>,
        name: String,
        args: CallArgs,
        block: Option<Box<Scope>>,
    },

    Yield(CallArgs),

    /// `super(args)`; `None` is the bare `super` that forwards the
    /// current arguments.
    Super(Option<CallArgs>),

    // ─────────────────────────── Definitions ────────────────────────────
    Def {
        name: String,
        scope: Box<Scope>,
    },
    Class {
        name: String,
        superclass: Option<Box<Node>>,
        scope: Box<Scope>,
    },
    Module {
        name: String,
        scope: Box<Scope>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Nil => "nil",
            NodeKind::True => "true",
            NodeKind::False => "false",
            NodeKind::SelfRef => "self",
            NodeKind::Lit(_) => "literal",
            NodeKind::Str(_) => "string",
            NodeKind::DStr(_) => "interpolated string",
            NodeKind::Array(_) => "array",
            NodeKind::Hash(_) => "hash",
            NodeKind::Range { .. } => "range",
            NodeKind::Splat(_) => "splat",
            NodeKind::LocalVar(_) => "local variable",
            NodeKind::LocalAsgn { .. } => "local assignment",
            NodeKind::IVar(_) => "instance variable",
            NodeKind::IAsgn { .. } => "instance variable assignment",
            NodeKind::GVar(_) => "global variable",
            NodeKind::GAsgn { .. } => "global variable assignment",
            NodeKind::CVar(_) => "class variable",
            NodeKind::CVAsgn { .. } => "class variable assignment",
            NodeKind::Const(_) => "constant",
            NodeKind::ScopedConst { .. } => "scoped constant",
            NodeKind::TopConst(_) => "top-level constant",
            NodeKind::ConstDecl { .. } => "constant declaration",
            NodeKind::MAsgn(_) => "multiple assignment",
            NodeKind::OpAsgn { .. } => "operator assignment",
            NodeKind::AttrAsgn { .. } => "attribute assignment",
            NodeKind::Block(_) => "block",
            NodeKind::If { .. } => "if",
            NodeKind::And(..) => "and",
            NodeKind::Or(..) => "or",
            NodeKind::Not(_) => "not",
            NodeKind::Case { .. } => "case",
            NodeKind::While { .. } => "while",
            NodeKind::Until { .. } => "until",
            NodeKind::Break(_) => "break",
            NodeKind::Next(_) => "next",
            NodeKind::Redo => "redo",
            NodeKind::Retry => "retry",
            NodeKind::Return(_) => "return",
            NodeKind::Begin(_) => "begin",
            NodeKind::Rescue { .. } => "rescue",
            NodeKind::Ensure { .. } => "ensure",
            NodeKind::Call { .. } => "call",
            NodeKind::Yield(_) => "yield",
            NodeKind::Super(_) => "super",
            NodeKind::Def { .. } => "def",
            NodeKind::Class { .. } => "class",
            NodeKind::Module { .. } => "module",
        }
    }
}

/// One `when` clause. Values may contain `Splat` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct When {
    pub line: u32,
    pub values: Vec<Node>,
    pub body: Option<Node>,
}

/// One `rescue` clause. No exception classes means `StandardError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescueClause {
    pub line: u32,
    pub exceptions: Vec<Node>,
    pub var: Option<AssignTarget>,
    pub body: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallArgs {
    /// Positional arguments; `Splat` nodes may appear anywhere.
    #[serde(default)]
    pub args: Vec<Node>,

    /// `name: value` pairs.
    #[serde(default)]
    pub keywords: Vec<(String, Node)>,

    /// `&blk`
    #[serde(default)]
    pub block_pass: Option<Box<Node>>,
}

impl CallArgs {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.keywords.is_empty() && self.block_pass.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpAsgnKind {
    Or,
    And,
}

/// Operator carried by `OpAsgn`: `||=`, `&&=` or a binary method name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpAsgnOp {
    Short(OpAsgnKind),
    Binary(String),
}

/// Left-hand side of an assignment whose value is already on the stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignTarget {
    Local(String),
    IVar(String),
    GVar(String),
    CVar(String),
    Const(String),
    Attr {
        recv: Box<Node>,
        name: String,
        args: Vec<Node>,
    },
    Nested(MultiAssign),
}

impl AssignTarget {
    /// Simple variables can be stored to without evaluating anything else.
    pub fn simple_name(&self) -> Option<(&'static str, &str)> {
        match self {
            AssignTarget::Local(n) => Some(("local", n)),
            AssignTarget::IVar(n) => Some(("ivar", n)),
            AssignTarget::GVar(n) => Some(("gvar", n)),
            AssignTarget::CVar(n) => Some(("cvar", n)),
            _ => None,
        }
    }
}

/// `targets, *splat, post = value`. `value` is absent for nested targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiAssign {
    pub targets: Vec<AssignTarget>,
    #[serde(default)]
    pub splat: Option<SplatTarget>,
    #[serde(default)]
    pub post: Vec<AssignTarget>,
    #[serde(default)]
    pub value: Option<Box<Node>>,
}

/// `*name` or an anonymous `*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplatTarget {
    Anonymous,
    Target(Box<AssignTarget>),
}

/// Body of a method, class, block or the whole program.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Scope {
    /// Local variable names in slot order, parameters first.
    #[serde(default)]
    pub locals: Vec<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub body: Option<Box<Node>>,
    #[serde(default)]
    pub line: u32,
    /// Last line of the scope, used for exit trace events.
    #[serde(default)]
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub lead: Vec<String>,
    #[serde(default)]
    pub opt: Vec<(String, Node)>,
    #[serde(default)]
    pub rest: Option<String>,
    #[serde(default)]
    pub post: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<KeywordParam>,
    #[serde(default)]
    pub kwrest: Option<String>,
    #[serde(default)]
    pub block: Option<String>,
    /// `|a,|` in a block parameter list.
    #[serde(default)]
    pub trailing_comma: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordParam {
    pub name: String,
    /// `None` marks a required keyword.
    pub default: Option<Node>,
}
