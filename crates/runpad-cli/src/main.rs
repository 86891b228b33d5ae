#![warn(missing_docs)]

//! runpad
//!
//! Run a JavaScript or TypeScript snippet in a sandbox and stream its output.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use runpad_compiler::SourceLanguage;
use runpad_config::RunpadConfig;
use runpad_coordinator::{CoordinatorConfig, RunCoordinator};
use runpad_sandbox::{EventKind, OutputEvent};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage: runpad [--lang javascript|typescript] [FILE]

Runs FILE (or stdin when FILE is omitted or '-') and prints each output
event as `[kind] content`. Exits non-zero if any error was reported.

options:
  -l, --lang <LANG>   source language (default: from the file extension,
                      then compiler.default_language, then javascript)
  -h, --help          print this help
  -V, --version       print the version";

/// What the command line asked for.
#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Version,
    Help,
    Run {
        file: Option<PathBuf>,
        language: Option<SourceLanguage>,
    },
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut file = None;
    let mut language = None;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Invocation::Version),
            "--help" | "-h" => return Ok(Invocation::Help),
            "--lang" | "-l" => {
                let value = iter.next().context("--lang requires a value")?;
                language = Some(value.parse::<SourceLanguage>()?);
            }
            "-" => file = None,
            other if other.starts_with('-') => anyhow::bail!("unknown option '{other}'"),
            path => {
                if file.is_some() {
                    anyhow::bail!("only one FILE may be given");
                }
                file = Some(PathBuf::from(path));
            }
        }
    }

    Ok(Invocation::Run { file, language })
}

/// Pick the language: explicit flag, then file extension, then the configured default.
fn resolve_language(
    explicit: Option<SourceLanguage>,
    file: Option<&PathBuf>,
    default: SourceLanguage,
) -> SourceLanguage {
    explicit
        .or_else(|| {
            file.and_then(|p| p.extension())
                .and_then(|ext| ext.to_str())
                .filter(|ext| matches!(*ext, "js" | "mjs" | "cjs" | "ts" | "mts" | "cts"))
                .map(SourceLanguage::from_extension)
        })
        .unwrap_or(default)
}

fn render(event: &OutputEvent) -> Option<String> {
    match event.kind {
        EventKind::Done => None,
        kind => Some(format!("[{}] {}", kind.as_str(), event.content_str())),
    }
}

fn load_config() -> Result<RunpadConfig> {
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    match RunpadConfig::locate(&cwd) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            RunpadConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(RunpadConfig::default())
        }
    }
}

async fn read_source(file: Option<&PathBuf>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut source = String::new();
            tokio::io::stdin()
                .read_to_string(&mut source)
                .await
                .context("failed to read stdin")?;
            Ok(source)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (file, language) = match parse_args(&args)? {
        Invocation::Version => {
            println!("runpad {}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        Invocation::Help => {
            println!("{USAGE}");
            return Ok(ExitCode::SUCCESS);
        }
        Invocation::Run { file, language } => (file, language),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = CoordinatorConfig::from_config(&load_config()?)?;
    let language = resolve_language(language, file.as_ref(), config.default_language);
    let source = read_source(file.as_ref()).await?;

    let coordinator = RunCoordinator::new(config);
    let mut stream = coordinator.run_once(&source, language)?;

    let mut failed = false;
    while let Some(event) = stream.next().await {
        failed |= event.kind == EventKind::Error;
        if let Some(line) = render(&event) {
            println!("{line}");
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use runpad_sandbox::CorrelationId;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_file_and_language() {
        let parsed = parse_args(&args(&["--lang", "ts", "snippet.js"])).unwrap();
        assert_eq!(
            parsed,
            Invocation::Run {
                file: Some(PathBuf::from("snippet.js")),
                language: Some(SourceLanguage::TypeScript),
            }
        );
    }

    #[test]
    fn no_arguments_reads_stdin() {
        assert_eq!(
            parse_args(&[]).unwrap(),
            Invocation::Run {
                file: None,
                language: None
            }
        );
        assert_eq!(
            parse_args(&args(&["-"])).unwrap(),
            Invocation::Run {
                file: None,
                language: None
            }
        );
    }

    #[test]
    fn version_and_help_win() {
        assert_eq!(parse_args(&args(&["x.js", "-V"])).unwrap(), Invocation::Version);
        assert_eq!(parse_args(&args(&["--help"])).unwrap(), Invocation::Help);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&["--lang"])).is_err());
        assert!(parse_args(&args(&["--lang", "python"])).is_err());
        assert!(parse_args(&args(&["--fast"])).is_err());
        assert!(parse_args(&args(&["a.js", "b.js"])).is_err());
    }

    #[test]
    fn language_resolution_order() {
        let ts_file = PathBuf::from("demo.ts");
        let js_file = PathBuf::from("demo.js");
        let default = SourceLanguage::JavaScript;

        assert_eq!(
            resolve_language(Some(SourceLanguage::JavaScript), Some(&ts_file), default),
            SourceLanguage::JavaScript
        );
        assert_eq!(
            resolve_language(None, Some(&ts_file), default),
            SourceLanguage::TypeScript
        );
        assert_eq!(
            resolve_language(None, Some(&js_file), SourceLanguage::TypeScript),
            SourceLanguage::JavaScript
        );
        assert_eq!(
            resolve_language(None, Some(&PathBuf::from("notes.txt")), SourceLanguage::TypeScript),
            SourceLanguage::TypeScript
        );
        assert_eq!(
            resolve_language(None, None, SourceLanguage::TypeScript),
            SourceLanguage::TypeScript
        );
    }

    #[test]
    fn renders_events_and_hides_done() {
        let id = CorrelationId::from("c1");
        assert_eq!(
            render(&OutputEvent::log(id.clone(), "hello")).as_deref(),
            Some("[log] hello")
        );
        assert_eq!(
            render(&OutputEvent::error(id.clone(), "TypeError: x")).as_deref(),
            Some("[error] TypeError: x")
        );
        assert_eq!(render(&OutputEvent::done(id)), None);
    }

    #[test]
    fn cargo_pkg_version_is_set() {
        assert!(!env!("CARGO_PKG_VERSION").is_empty());
    }
}
