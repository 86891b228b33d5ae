#![warn(missing_docs)]

//! # runpad-compiler
//!
//! Turns submitted source into code the runpad sandbox can execute.
//!
//! JavaScript passes through unchanged. TypeScript is checked and lowered by
//! the oxc-based [`checker`]; when the checker is disabled or faults, the
//! [`fallback`] stripper erases type syntax textually without validation.

pub mod checker;
pub mod error;
pub mod fallback;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use checker::{CheckOutput, Checker, OxcChecker};
pub use error::CompileError;

/// The language a snippet is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLanguage {
    /// Executed as-is.
    #[default]
    JavaScript,
    /// Checked and lowered to JavaScript first.
    TypeScript,
}

impl SourceLanguage {
    /// Whether source in this language needs a compile step.
    pub fn needs_compilation(self) -> bool {
        matches!(self, Self::TypeScript)
    }

    /// Infer the language from a file extension (`ts`, `mts`, `cts` are
    /// TypeScript; anything else is JavaScript).
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "ts" | "mts" | "cts" => Self::TypeScript,
            _ => Self::JavaScript,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
        }
    }
}

impl fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceLanguage {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(Self::JavaScript),
            "typescript" | "ts" => Ok(Self::TypeScript),
            _ => Err(CompileError::UnknownLanguage(s.to_string())),
        }
    }
}

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks execution.
    Error,
    /// Informational only.
    Warning,
}

/// A problem found in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// How serious it is.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
}

impl Diagnostic {
    /// Whether this diagnostic blocks execution.
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.message)
    }
}

/// Result of compiling one snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// The snippet can run.
    Compiled {
        /// Executable JavaScript.
        code: String,
        /// Non-blocking diagnostics.
        warnings: Vec<Diagnostic>,
    },
    /// The snippet must not run. One display line per diagnostic, in
    /// detection order.
    Failed {
        /// Error lines, each prefixed `Error: ` or `Failed to compile TypeScript: `.
        errors: Vec<String>,
    },
}

impl CompileOutcome {
    /// Whether compilation succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Compiled { .. })
    }
}

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Use the full checker. When `false`, TypeScript always goes through the
    /// fallback stripper.
    pub checker_enabled: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            checker_enabled: true,
        }
    }
}

/// Compiles snippets for the sandbox.
pub struct Compiler {
    checker: Option<&'static dyn Checker>,
}

impl Compiler {
    /// Create a compiler using the process-wide checker (if enabled).
    pub fn new(options: CompilerOptions) -> Self {
        let checker = options.checker_enabled.then(checker::shared);
        Self { checker }
    }

    /// Create a compiler with an explicit checker.
    pub fn with_checker(checker: &'static dyn Checker) -> Self {
        Self {
            checker: Some(checker),
        }
    }

    /// Compile `source` written in `language`.
    pub fn compile(&self, source: &str, language: SourceLanguage) -> CompileOutcome {
        match language {
            SourceLanguage::JavaScript => CompileOutcome::Compiled {
                code: source.to_string(),
                warnings: Vec::new(),
            },
            SourceLanguage::TypeScript => self.compile_typescript(source),
        }
    }

    fn compile_typescript(&self, source: &str) -> CompileOutcome {
        if let Some(checker) = self.checker {
            match catch_unwind(AssertUnwindSafe(|| checker.check(source))) {
                Ok(Ok(CheckOutput::Lowered { code, warnings })) => {
                    for warning in &warnings {
                        tracing::debug!(message = %warning.message, "compiler warning");
                    }
                    return CompileOutcome::Compiled { code, warnings };
                }
                Ok(Ok(CheckOutput::Rejected(diagnostics))) => {
                    tracing::debug!(count = diagnostics.len(), "compile rejected");
                    return CompileOutcome::Failed {
                        errors: diagnostics.iter().map(ToString::to_string).collect(),
                    };
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "type checker unavailable, stripping types");
                }
                Err(_) => {
                    tracing::warn!("type checker panicked, stripping types");
                }
            }
        }

        match fallback::strip_types(source) {
            Ok(code) => CompileOutcome::Compiled {
                code,
                warnings: Vec::new(),
            },
            Err(e) => CompileOutcome::Failed {
                errors: vec![format!("Failed to compile TypeScript: {e}")],
            },
        }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilerOptions::default())
    }
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("checker_enabled", &self.checker.is_some())
            .finish()
    }
}
