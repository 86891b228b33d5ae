//! Pattern-based type stripping, used when the checker is unavailable.
//!
//! This is a purely textual transform. It performs no validation and can
//! mangle valid code that uses `name: value` outside type positions, such as
//! object literals and ternaries.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::CompileError;

/// Substitutions applied in order.
const RULES: &[(&str, &str)] = &[
    // Variable annotations: `let x: number = 1` -> `let x = 1`
    (r":\s*\w+(\[\])?(\s*[=;,\)])", "${2}"),
    // Parameter annotations: `(a: string)` -> `(a)`
    (r"(\w+)\s*:\s*\w+(\[\])?", "${1}"),
    // Interface declarations
    (r"interface\s+\w+\s*\{[^}]*\}", ""),
    // Type aliases
    (r"type\s+\w+\s*=\s*[^;]+;", ""),
    // Generic parameter lists
    (r"<\w+>", ""),
    // `as` assertions
    (r"\s+as\s+\w+", ""),
    // Blank lines left behind
    (r"\n\s*\n", "\n"),
];

static PATTERNS: LazyLock<Result<Vec<(Regex, &'static str)>, regex::Error>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|(pattern, replacement)| Regex::new(pattern).map(|re| (re, *replacement)))
        .collect()
});

/// Strip type syntax from `source`.
pub fn strip_types(source: &str) -> Result<String, CompileError> {
    let patterns = PATTERNS
        .as_ref()
        .map_err(|e| CompileError::Pattern(e.clone()))?;

    let mut code = source.to_string();
    for (re, replacement) in patterns {
        code = re.replace_all(&code, *replacement).into_owned();
    }
    Ok(code)
}
