use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the mutation-testing engine.
///
/// Per-mutant execution faults are deliberately absent: a mutant whose test
/// process crashes or times out is classified killed, never escalated.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Target type name did not resolve in the assembly under test.
    #[error("type `{0}` was not found in the assembly under test")]
    TypeNotFound(String),

    /// Target method name did not resolve on the target type.
    #[error("method `{method}` was not found on type `{type_name}`")]
    MethodNotFound { type_name: String, method: String },

    /// Target method name matched more than one overload.
    #[error(
        "method `{method}` on `{type_name}` is overloaded; \
         specify parameter types to disambiguate (candidates: {candidates:?})"
    )]
    AmbiguousMethod {
        type_name: String,
        method: String,
        candidates: Vec<String>,
    },

    /// Both the heuristic and the forced discovery passes came up empty.
    #[error("no matching tests were found to run")]
    NoMatchingTests,

    /// The external test-runner executable could not be located.
    #[error("test runner `{program}` could not be located; searched: {searched:?}")]
    RunnerNotFound {
        program: String,
        searched: Vec<PathBuf>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
