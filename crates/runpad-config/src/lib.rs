#![warn(missing_docs)]

//! # runpad-config
//!
//! Configuration loading for runpad.
//!
//! A TOML file, optionally with `${VAR}` / `${VAR:-default}` references to
//! the environment, layered over built-in defaults.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 5000
//! max_code_size_kb = 64
//! max_output_events = 10000
//! max_heap_mb = 64
//! execution_mode = "in_process"
//!
//! [compiler]
//! checker = "enabled"
//! default_language = "typescript"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "RUNPAD_CONFIG";

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "runpad.toml";

/// Why a config could not be loaded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read runpad config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML is malformed or has unknown keys.
    #[error("malformed runpad config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or not one of the accepted names.
    #[error("invalid runpad config: {0}")]
    Invalid(String),
}

/// Top-level runpad configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunpadConfig {
    /// `[sandbox]` table.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Compiler settings.
    #[serde(default)]
    pub compiler: CompilerOverrides,
}

/// `[sandbox]` keys. Unset keys keep the sandbox defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Wall-clock deadline per run, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Maximum snippet size in kilobytes.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Maximum console events delivered per run.
    #[serde(default)]
    pub max_output_events: Option<usize>,

    /// V8 heap limit per run, in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// `in_process` (default) or `child_process`.
    #[serde(default)]
    pub execution_mode: Option<String>,
}

/// Compiler configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerOverrides {
    /// "enabled" (default) or "disabled". Disabled forces pattern stripping.
    #[serde(default)]
    pub checker: Option<String>,

    /// Language assumed when none is given: "javascript" (default) or "typescript".
    #[serde(default)]
    pub default_language: Option<String>,
}

impl CompilerOverrides {
    /// Whether the full checker should be used.
    pub fn checker_enabled(&self) -> bool {
        self.checker.as_deref() != Some("disabled")
    }
}

impl RunpadConfig {
    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: RunpadConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Like [`from_toml`](Self::from_toml), after substituting environment references.
    pub fn from_toml_with_env(text: &str) -> Result<Self, ConfigError> {
        Self::from_toml(&expand_env_vars(text))
    }

    /// Like [`from_file`](Self::from_file), after substituting environment references.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_with_env(&std::fs::read_to_string(path)?)
    }

    /// Locate the config file: `RUNPAD_CONFIG` if set, else `runpad.toml`
    /// in `cwd` if it exists.
    pub fn locate(cwd: &Path) -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        let local = cwd.join(DEFAULT_CONFIG_FILE);
        local.exists().then_some(local)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        positive("sandbox.timeout_ms", self.sandbox.timeout_ms)?;
        positive("sandbox.max_code_size_kb", self.sandbox.max_code_size_kb.map(|kb| kb as u64))?;
        positive("sandbox.max_heap_mb", self.sandbox.max_heap_mb.map(|mb| mb as u64))?;
        one_of(
            "sandbox.execution_mode",
            self.sandbox.execution_mode.as_deref(),
            &["in_process", "child_process"],
        )?;
        one_of(
            "compiler.checker",
            self.compiler.checker.as_deref(),
            &["enabled", "disabled"],
        )?;
        one_of(
            "compiler.default_language",
            self.compiler.default_language.as_deref(),
            &["javascript", "typescript"],
        )
    }
}

fn positive(key: &str, value: Option<u64>) -> Result<(), ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid(format!("{key} must be greater than 0"))),
        _ => Ok(()),
    }
}

fn one_of(key: &str, value: Option<&str>, allowed: &[&str]) -> Result<(), ConfigError> {
    match value {
        Some(v) if !allowed.contains(&v) => Err(ConfigError::Invalid(format!(
            "{key} = '{v}' is not one of: {}",
            allowed.join(", ")
        ))),
        _ => Ok(()),
    }
}

/// Replace `${NAME}` and `${NAME:-fallback}` with environment values.
///
/// An unset variable without a fallback is left as written, so the parse or
/// validation error names it.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let reference = &after[..end];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        match (std::env::var(name), fallback) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn empty_config_uses_defaults() {
        let config = RunpadConfig::from_toml("").unwrap();
        assert!(config.sandbox.timeout_ms.is_none());
        assert!(config.sandbox.execution_mode.is_none());
        assert!(config.compiler.checker_enabled());
        assert!(config.compiler.default_language.is_none());
    }

    #[test]
    fn parses_full_example() {
        let toml = r#"
            [sandbox]
            timeout_ms = 2500
            max_code_size_kb = 32
            max_output_events = 500
            max_heap_mb = 128
            execution_mode = "child_process"

            [compiler]
            checker = "disabled"
            default_language = "typescript"
        "#;

        let config = RunpadConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(2500));
        assert_eq!(config.sandbox.max_code_size_kb, Some(32));
        assert_eq!(config.sandbox.max_output_events, Some(500));
        assert_eq!(config.sandbox.max_heap_mb, Some(128));
        assert_eq!(config.sandbox.execution_mode.as_deref(), Some("child_process"));
        assert!(!config.compiler.checker_enabled());
        assert_eq!(config.compiler.default_language.as_deref(), Some("typescript"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = RunpadConfig::from_toml("[sandbox]\ntimeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("timeout_ms"), "{err}");
    }

    #[test]
    fn rejects_zero_heap_limit() {
        let err = RunpadConfig::from_toml("[sandbox]\nmax_heap_mb = 0").unwrap_err();
        assert!(err.to_string().contains("max_heap_mb"), "{err}");
    }

    #[test]
    fn rejects_unknown_execution_mode() {
        let err = RunpadConfig::from_toml("[sandbox]\nexecution_mode = \"wasm\"").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("wasm"), "error should mention the mode: {msg}");
        assert!(msg.contains("in_process"), "error should list supported modes: {msg}");
    }

    #[test]
    fn rejects_unknown_checker_and_language() {
        assert!(RunpadConfig::from_toml("[compiler]\nchecker = \"maybe\"").is_err());
        assert!(RunpadConfig::from_toml("[compiler]\ndefault_language = \"python\"").is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = RunpadConfig::from_toml("[sandbox]\ntimeout_secs = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[test]
    #[serial]
    fn expands_environment_variables() {
        std::env::set_var("RUNPAD_TEST_MODE", "child_process");
        let config =
            RunpadConfig::from_toml_with_env("[sandbox]\nexecution_mode = \"${RUNPAD_TEST_MODE}\"")
                .unwrap();
        std::env::remove_var("RUNPAD_TEST_MODE");
        assert_eq!(config.sandbox.execution_mode.as_deref(), Some("child_process"));
    }

    #[test]
    fn unset_references_stay_or_use_their_fallback() {
        assert_eq!(
            expand_env_vars("a ${RUNPAD_SURELY_UNSET_VAR} b"),
            "a ${RUNPAD_SURELY_UNSET_VAR} b"
        );
        assert_eq!(
            expand_env_vars("timeout_ms = ${RUNPAD_SURELY_UNSET_VAR:-250}"),
            "timeout_ms = 250"
        );
        assert_eq!(expand_env_vars("dangling ${OPEN"), "dangling ${OPEN");
        assert_eq!(expand_env_vars("no refs $HOME"), "no refs $HOME");
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[sandbox]\ntimeout_ms = 750\n").unwrap();

        let config = RunpadConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(750));
    }

    #[test]
    #[serial]
    fn locate_prefers_env_var_then_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var(CONFIG_ENV_VAR);
        assert_eq!(RunpadConfig::locate(dir.path()), None);

        let local = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&local, "").unwrap();
        assert_eq!(RunpadConfig::locate(dir.path()), Some(local));

        std::env::set_var(CONFIG_ENV_VAR, "/etc/runpad/custom.toml");
        let located = RunpadConfig::locate(dir.path());
        std::env::remove_var(CONFIG_ENV_VAR);
        assert_eq!(located, Some(PathBuf::from("/etc/runpad/custom.toml")));
    }
}
