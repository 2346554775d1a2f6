use rustc_hash::FxHashSet;

/// Answers whether a built-in operator has been redefined by the program.
///
/// Specialized instructions are only substituted for operators the oracle
/// reports as untouched. The runtime hosting the compiler supplies the
/// implementation; there is no implicit default.
pub trait RedefinitionOracle {
    fn is_redefined(&self, method: &str) -> bool;
}

/// Fixed answer set, for tools and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticOracle {
    redefined: FxHashSet<String>,
}

impl StaticOracle {
    /// No operator has been redefined.
    pub fn pristine() -> Self {
        Self::default()
    }

    pub fn with_redefined<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StaticOracle {
            redefined: methods.into_iter().map(Into::into).collect(),
        }
    }
}

impl RedefinitionOracle for StaticOracle {
    fn is_redefined(&self, method: &str) -> bool {
        self.redefined.contains(method)
    }
}
