//! Lexical context threaded through the lowering.
//!
//! [`Context`] is a small `Copy` value passed down by the recursion. The
//! ensure chain it points at is made of frames that live on the Rust stack
//! of the enclosing `compile_*` calls, so a frame can never outlive the
//! construct that pushed it.

use crate::bytecode::ir::LabelId;
use crate::bytecode::iseq::IseqKind;
use crate::lang::node::Node;

/// Jump targets of the innermost loop or block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopLabels {
    /// `next` target: the condition of a `while`, the body start of a block.
    pub start: LabelId,
    /// `break` target of a `while`, `next` target of a block.
    pub end: LabelId,
    /// Body start of a `while`. `None` inside a block body.
    pub redo: Option<LabelId>,
}

impl LoopLabels {
    pub fn is_while(&self) -> bool {
        self.redo.is_some()
    }
}

/// One entry of the ensure chain.
///
/// A frame with a body protects a region whose ranges are kept in the
/// scope builder under `range`. A frame with neither is pushed by loops so
/// that `break`/`next`/`redo` stop inlining ensure bodies at the loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EnsureFrame<'f> {
    pub body: Option<&'f Node>,
    pub range: Option<usize>,
    /// Number of frames below this one.
    pub depth: usize,
    pub prev: Option<&'f EnsureFrame<'f>>,
}

impl<'f> EnsureFrame<'f> {
    pub fn new(body: &'f Node, range: usize, prev: Option<&'f EnsureFrame<'f>>) -> Self {
        EnsureFrame {
            body: Some(body),
            range: Some(range),
            depth: prev.map_or(0, |p| p.depth + 1),
            prev,
        }
    }

    pub fn loop_marker(prev: Option<&'f EnsureFrame<'f>>) -> Self {
        EnsureFrame {
            body: None,
            range: None,
            depth: prev.map_or(0, |p| p.depth + 1),
            prev,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Context<'f> {
    pub loop_: Option<LoopLabels>,
    pub ensure: Option<&'f EnsureFrame<'f>>,
    /// Frames with a depth below this were pushed outside the innermost
    /// rescue-protected body around the current node.
    pub rescue_floor: usize,
}

impl<'f> Context<'f> {
    pub fn in_while(&self) -> bool {
        self.loop_.is_some_and(|l| l.is_while())
    }

    pub fn with_loop(self, labels: LoopLabels) -> Self {
        Context {
            loop_: Some(labels),
            ..self
        }
    }

    pub fn with_ensure(self, frame: &'f EnsureFrame<'f>) -> Self {
        Context {
            ensure: Some(frame),
            ..self
        }
    }

    /// Enter the protected body of a `rescue`.
    pub fn with_rescue(self) -> Self {
        Context {
            rescue_floor: self.ensure.map_or(0, |f| f.depth + 1),
            ..self
        }
    }
}

// =============================================================================
// ENCLOSING SCOPES
// =============================================================================

/// Parameter slots of a method, forwarded by a bare `super`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SuperParams {
    /// Leading and optional parameters, in order.
    pub lead: Vec<usize>,
    pub rest: Option<usize>,
    pub post: Vec<usize>,
    pub keywords: Vec<(String, usize)>,
    pub kwrest: Option<usize>,
    pub block: Option<usize>,
}

/// What a child scope knows about the scope it was compiled inside.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScopeInfo<'a> {
    pub kind: IseqKind,
    pub locals: &'a [String],
    /// The child was created inside a `while`/`until` body.
    pub in_while: bool,
    /// Parameters of the method this scope belongs to.
    pub super_params: Option<&'a SuperParams>,
    pub parent: Option<&'a ScopeInfo<'a>>,
}

impl<'a> ScopeInfo<'a> {
    pub fn ancestors(this: Option<&'a ScopeInfo<'a>>) -> Ancestors<'a> {
        Ancestors { next: this }
    }
}

pub(crate) struct Ancestors<'a> {
    next: Option<&'a ScopeInfo<'a>>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a ScopeInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur.parent;
        Some(cur)
    }
}

/// Resolve `name` to `(slot, level)`.
///
/// Only block, rescue and ensure scopes see the locals of the scope around
/// them; the walk stops at the first scope of any other kind.
pub(crate) fn resolve_local(
    kind: IseqKind,
    locals: &[String],
    parent: Option<&ScopeInfo<'_>>,
    name: &str,
) -> Option<(usize, usize)> {
    if let Some(idx) = locals.iter().position(|l| l == name) {
        return Some((idx, 0));
    }
    if !kind.is_dynamic() {
        return None;
    }
    for (depth, scope) in ScopeInfo::ancestors(parent).enumerate() {
        if let Some(idx) = scope.locals.iter().position(|l| l == name) {
            return Some((idx, depth + 1));
        }
        if !scope.kind.is_dynamic() {
            break;
        }
    }
    None
}

/// Where a `break`, `next` or `redo` that cannot jump locally lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Escape {
    /// A loop in this or an enclosing frame; no block frame is unwound.
    Loop,
    /// A block `level` frames out.
    Block(i64),
    Eval,
}

/// Walk outward from the current scope looking for an escape target.
///
/// The direct parent is level 1. Only rescue and ensure bodies are walked
/// through; method, class and top-level scopes end the walk.
pub(crate) fn find_escape(kind: IseqKind, parent: Option<&ScopeInfo<'_>>) -> Option<Escape> {
    match kind {
        IseqKind::Eval => return Some(Escape::Eval),
        IseqKind::Block | IseqKind::Rescue | IseqKind::Ensure => {}
        IseqKind::Top | IseqKind::Main | IseqKind::Method | IseqKind::Class => return None,
    }

    for (depth, scope) in ScopeInfo::ancestors(parent).enumerate() {
        if scope.in_while {
            return Some(Escape::Loop);
        }
        match scope.kind {
            IseqKind::Block => return Some(Escape::Block(depth as i64 + 1)),
            IseqKind::Eval => return Some(Escape::Eval),
            IseqKind::Rescue | IseqKind::Ensure => continue,
            IseqKind::Top | IseqKind::Main | IseqKind::Method | IseqKind::Class => return None,
        }
    }
    None
}

/// Kind of the nearest enclosing scope that is not a block, rescue or
/// ensure body. `None` when every scope up to the root is dynamic.
pub(crate) fn method_level_kind(kind: IseqKind, parent: Option<&ScopeInfo<'_>>) -> Option<IseqKind> {
    if !kind.is_dynamic() {
        return Some(kind);
    }
    ScopeInfo::ancestors(parent)
        .map(|s| s.kind)
        .find(|k| !k.is_dynamic())
}

/// Number of frames between the current scope and its method-level
/// scope: 0 for a method itself, 1 for a block directly inside it.
pub(crate) fn method_level_depth(kind: IseqKind, parent: Option<&ScopeInfo<'_>>) -> Option<usize> {
    if !kind.is_dynamic() {
        return Some(0);
    }
    ScopeInfo::ancestors(parent)
        .position(|s| !s.kind.is_dynamic())
        .map(|depth| depth + 1)
}

/// Kind of the nearest enclosing scope that is not a rescue or ensure body.
pub(crate) fn non_handler_kind(kind: IseqKind, parent: Option<&ScopeInfo<'_>>) -> Option<IseqKind> {
    let handler = |k: IseqKind| matches!(k, IseqKind::Rescue | IseqKind::Ensure);
    if !handler(kind) {
        return Some(kind);
    }
    ScopeInfo::ancestors(parent)
        .map(|s| s.kind)
        .find(|k| !handler(*k))
}
