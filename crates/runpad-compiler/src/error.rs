//! Error types for the runpad compiler.

use thiserror::Error;

/// Failures inside the compiler itself, as opposed to problems in the
/// compiled source (those are [`Diagnostic`](crate::Diagnostic)s).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompileError {
    /// The checker could not analyse the source.
    #[error("type checker fault: {0}")]
    CheckerFault(String),

    /// A stripping pattern failed to compile.
    #[error("{0}")]
    Pattern(#[from] regex::Error),

    /// The language name is not one the compiler understands.
    #[error("unknown source language '{0}' (expected 'javascript' or 'typescript')")]
    UnknownLanguage(String),
}
