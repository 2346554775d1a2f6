use thiserror::Error;

use crate::bytecode::op::{Opcode, OperandType};

// =============================================================================
// INTERNAL ERRORS (compiler defects)
// =============================================================================

/// Violation of the compiler's own invariants.
///
/// These are never caused by user input and abort the whole compilation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InternalError {
    #[error("label L{0} is referenced but never bound")]
    UnboundLabel(u32),

    #[error("`{opcode}` takes {expected} operands, found {found}")]
    OperandCountMismatch {
        opcode: Opcode,
        expected: usize,
        found: usize,
    },

    #[error("`{opcode}` operand {index}: expected {}, found {found}", .expected.name())]
    OperandTypeMismatch {
        opcode: Opcode,
        index: usize,
        expected: OperandType,
        found: &'static str,
    },

    #[error("cannot compile '{node}' node {context}")]
    UnknownNode {
        node: &'static str,
        context: &'static str,
    },

    #[error("case expression has no when clauses")]
    EmptyCaseClauses,

    #[error("stack cache state at L{label} disagrees: {expected} vs {found}")]
    StackCacheMismatch {
        label: u32,
        expected: &'static str,
        found: &'static str,
    },

    #[error("stack depth at L{label} disagrees: {expected} vs {found}")]
    StackDepthMismatch {
        label: u32,
        expected: usize,
        found: usize,
    },

    #[error("stack underflow at `{opcode}` (position {position})")]
    StackUnderflow { opcode: Opcode, position: usize },

    #[error("adjust to L{label} would pop {count} values")]
    AdjustUnderflow { label: u32, count: i64 },

    #[error("inline cache index {index} out of range (size {size})")]
    InlineCacheOverflow { index: u32, size: u32 },

    #[error("local variable '{0}' is not in any enclosing local table")]
    UnknownLocal(String),
}

impl InternalError {
    pub fn unknown_node(node: &'static str, context: &'static str) -> Self {
        InternalError::UnknownNode { node, context }
    }
}

// =============================================================================
// COMPILE ERRORS (user-facing)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileErrorKind {
    #[error("Invalid break")]
    InvalidBreak,
    #[error("Invalid next")]
    InvalidNext,
    #[error("Invalid redo")]
    InvalidRedo,
    #[error("Invalid retry")]
    InvalidRetry,
    #[error("Invalid return in class/module body")]
    InvalidReturn,
    #[error("Invalid yield")]
    InvalidYield,
    #[error("Can't escape from eval with {0}")]
    EscapeFromEval(&'static str),
    #[error("malformed multiple assignment target")]
    MalformedMultipleAssignment,
}

/// Well-formed construct that is invalid where it appears.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}:{line}: {kind}{}", render_hint(.hint))]
pub struct CompileError {
    pub path: String,
    pub line: u32,
    pub kind: CompileErrorKind,
    pub hint: Option<String>,
}

fn render_hint(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, path: &str, line: u32) -> Self {
        CompileError {
            path: path.to_string(),
            line,
            kind,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// `break` with no enclosing loop or block
    pub fn invalid_break(path: &str, line: u32) -> Self {
        Self::new(CompileErrorKind::InvalidBreak, path, line)
            .with_hint("break must appear inside a loop or a block")
    }

    pub fn invalid_next(path: &str, line: u32) -> Self {
        Self::new(CompileErrorKind::InvalidNext, path, line)
            .with_hint("next must appear inside a loop or a block")
    }

    pub fn invalid_redo(path: &str, line: u32) -> Self {
        Self::new(CompileErrorKind::InvalidRedo, path, line)
            .with_hint("redo must appear inside a loop or a block")
    }

    pub fn invalid_retry(path: &str, line: u32) -> Self {
        Self::new(CompileErrorKind::InvalidRetry, path, line)
            .with_hint("retry is only allowed inside a rescue clause")
    }

    pub fn invalid_return(path: &str, line: u32) -> Self {
        Self::new(CompileErrorKind::InvalidReturn, path, line)
    }

    pub fn invalid_yield(path: &str, line: u32) -> Self {
        Self::new(CompileErrorKind::InvalidYield, path, line)
            .with_hint("yield needs an enclosing method that can receive a block")
    }

    pub fn escape_from_eval(what: &'static str, path: &str, line: u32) -> Self {
        Self::new(CompileErrorKind::EscapeFromEval(what), path, line)
    }

    pub fn malformed_masgn(path: &str, line: u32) -> Self {
        Self::new(CompileErrorKind::MalformedMultipleAssignment, path, line)
            .with_hint("only one splat target is allowed per target list")
    }
}

// =============================================================================
// UNIFIED ERROR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("internal compiler error: {0}")]
    Internal(#[from] InternalError),
}

impl Error {
    /// True for compiler defects, false for errors in the compiled program.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display_includes_location_and_hint() {
        let err = CompileError::invalid_break("main.rb", 3);

        let msg = err.to_string();
        assert!(msg.starts_with("main.rb:3: Invalid break"));
        assert!(msg.contains("hint"));
    }

    #[test]
    fn test_compile_error_without_hint() {
        let err = CompileError::invalid_return("lib/a.rb", 10);
        assert_eq!(err.to_string(), "lib/a.rb:10: Invalid return in class/module body");
    }

    #[test]
    fn test_escape_from_eval_names_construct() {
        let err = CompileError::escape_from_eval("break", "(eval)", 1);
        assert!(err.to_string().contains("Can't escape from eval with break"));
    }

    #[test]
    fn test_internal_error_display() {
        let err = InternalError::OperandTypeMismatch {
            opcode: Opcode::Jump,
            index: 0,
            expected: OperandType::Offset,
            found: "num",
        };
        assert_eq!(
            err.to_string(),
            "`jump` operand 0: expected offset, found num"
        );
    }

    #[test]
    fn test_tiers_are_distinguishable() {
        let user: Error = CompileError::invalid_next("a.rb", 1).into();
        let defect: Error = InternalError::EmptyCaseClauses.into();

        assert!(!user.is_internal());
        assert!(defect.is_internal());
        assert!(defect.to_string().starts_with("internal compiler error"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err: Error = InternalError::UnboundLabel(4).into();
        let _: &dyn std::error::Error = &err;
    }
}
