use serde::{Deserialize, Serialize};

/// Switches consulted by the lowering and the optimization passes.
///
/// Missing fields in a JSON options file take their default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    pub peephole_optimization: bool,
    pub tailcall_optimization: bool,
    pub specialized_instruction: bool,
    pub operands_unification: bool,
    pub instructions_unification: bool,
    pub stack_caching: bool,
    pub inline_const_cache: bool,
    /// Emit `trace` instructions for line and scope events.
    pub trace_instruction: bool,
    pub frozen_string_literal: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            peephole_optimization: true,
            tailcall_optimization: false,
            specialized_instruction: true,
            operands_unification: false,
            instructions_unification: false,
            stack_caching: false,
            inline_const_cache: true,
            trace_instruction: true,
            frozen_string_literal: false,
        }
    }
}

impl CompileOptions {
    /// Every optimization on, tracing off.
    pub fn all() -> Self {
        CompileOptions {
            peephole_optimization: true,
            tailcall_optimization: true,
            specialized_instruction: true,
            operands_unification: true,
            instructions_unification: true,
            stack_caching: true,
            inline_const_cache: true,
            trace_instruction: false,
            frozen_string_literal: false,
        }
    }

    /// Straight lowering with no optimization and no tracing.
    pub fn none() -> Self {
        CompileOptions {
            peephole_optimization: false,
            tailcall_optimization: false,
            specialized_instruction: false,
            operands_unification: false,
            instructions_unification: false,
            stack_caching: false,
            inline_const_cache: false,
            trace_instruction: false,
            frozen_string_literal: false,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = CompileOptions::default();
        assert!(opts.peephole_optimization);
        assert!(opts.specialized_instruction);
        assert!(opts.inline_const_cache);
        assert!(opts.trace_instruction);
        assert!(!opts.tailcall_optimization);
        assert!(!opts.stack_caching);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts = CompileOptions::from_json(r#"{"stack_caching": true}"#).unwrap();
        assert!(opts.stack_caching);
        assert!(opts.peephole_optimization);
    }

    #[test]
    fn test_none_disables_everything() {
        let opts = CompileOptions::none();
        assert!(!opts.peephole_optimization);
        assert!(!opts.specialized_instruction);
        assert!(!opts.inline_const_cache);
        assert!(!opts.trace_instruction);
        assert_ne!(opts, CompileOptions::all());
    }
}
