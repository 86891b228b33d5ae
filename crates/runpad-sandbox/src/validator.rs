//! Pre-execution checks on executable code.
//!
//! The sandbox runs whatever it is given; the only static check is a size
//! limit so a pasted megabyte of minified code never reaches an isolate.

use crate::error::SandboxError;

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Validates code before it is bound to an execution context.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    Ok(())
}
