//! Full-stack tests for the run coordinator.
//!
//! These exercise the complete pipeline:
//! RunCoordinator -> Compiler -> Supervisor -> Sandbox -> V8 -> console ops

use std::time::Duration;

use runpad_compiler::SourceLanguage;
use runpad_coordinator::{CoordinatorConfig, RunCoordinator, RunError};
use runpad_sandbox::{EventKind, OutputEvent, SandboxConfig};
use serial_test::serial;

fn coordinator() -> RunCoordinator {
    RunCoordinator::new(CoordinatorConfig::default())
}

fn rendered(events: &[OutputEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| match &e.content {
            Some(content) => format!("{}:{}", e.kind.as_str(), content),
            None => e.kind.as_str().to_string(),
        })
        .collect()
}

#[tokio::test]
#[serial]
async fn javascript_scenario_streams_logs_result_and_done() {
    let coordinator = coordinator();
    let stream = coordinator
        .run_once(
            r#"console.log("a"); console.log(1+1); 42"#,
            SourceLanguage::JavaScript,
        )
        .unwrap();

    let events = stream.collect().await;
    assert_eq!(rendered(&events), vec!["log:a", "log:2", "result:42", "done"]);
    assert!(!coordinator.is_running());
}

#[tokio::test]
#[serial]
async fn every_event_carries_the_stream_correlation_id() {
    let coordinator = coordinator();
    let stream = coordinator
        .run_once("console.log('x'); console.error('y')", SourceLanguage::JavaScript)
        .unwrap();
    let id = stream.correlation_id().clone();

    let events = stream.collect().await;
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.correlation_id == id));
}

#[tokio::test]
#[serial]
async fn typescript_runs_after_compilation() {
    let coordinator = coordinator();
    let stream = coordinator
        .run_once(
            "const greet = (name: string): string => `hi ${name}`;\nconsole.log(greet('ts'));",
            SourceLanguage::TypeScript,
        )
        .unwrap();

    let events = stream.collect().await;
    assert_eq!(rendered(&events), vec!["log:hi ts", "done"]);
}

#[tokio::test]
#[serial]
async fn type_error_yields_only_error_events_without_done() {
    let coordinator = coordinator();
    let stream = coordinator
        .run_once(
            "console.log('side effect'); let s: string = 42;",
            SourceLanguage::TypeScript,
        )
        .unwrap();

    let events = stream.collect().await;
    assert_eq!(
        rendered(&events),
        vec!["error:Error: Type 'number' is not assignable to type 'string'."]
    );
    assert!(events.iter().all(|e| e.kind == EventKind::Error));
    assert!(!coordinator.is_running());
}

#[tokio::test]
#[serial]
async fn second_run_is_refused_while_busy() {
    let coordinator = coordinator();
    let mut first = coordinator
        .run_once("let n = 0; for (let i = 0; i < 5e7; i++) n++; n", SourceLanguage::JavaScript)
        .unwrap();
    assert!(coordinator.is_running());

    let second = coordinator.run_once("1", SourceLanguage::JavaScript);
    assert!(matches!(second, Err(RunError::Busy)));

    let mut last = None;
    while let Some(event) = first.next().await {
        last = Some(event);
    }
    assert!(last.is_some_and(|e| e.is_done()));

    let third = coordinator.run_once("3", SourceLanguage::JavaScript).unwrap();
    assert_eq!(rendered(&third.collect().await), vec!["result:3", "done"]);
}

#[tokio::test]
#[serial]
async fn running_is_cleared_before_done_is_delivered() {
    let coordinator = coordinator();
    let mut running = coordinator.running();
    assert!(!*running.borrow_and_update());

    let mut stream = coordinator
        .run_once("console.log('tick')", SourceLanguage::JavaScript)
        .unwrap();
    assert!(*running.borrow_and_update());

    while let Some(event) = stream.next().await {
        if event.is_done() {
            assert!(!coordinator.is_running(), "running must be false once done arrives");
        }
    }
}

#[tokio::test]
#[serial]
async fn timed_out_run_does_not_poison_the_next() {
    let coordinator = RunCoordinator::new(CoordinatorConfig {
        sandbox: SandboxConfig {
            timeout: Duration::from_millis(300),
            ..Default::default()
        },
        ..Default::default()
    });

    let stuck = coordinator
        .run_once("globalThis.leak = 1; console.log('before'); while (true) {}", SourceLanguage::JavaScript)
        .unwrap();
    assert_eq!(
        rendered(&stuck.collect().await),
        vec![
            "log:before",
            "error:Execution timed out (300ms limit)",
            "done"
        ]
    );

    let next = coordinator
        .run_once("typeof leak === 'undefined' ? 'fresh' : 'stale'", SourceLanguage::JavaScript)
        .unwrap();
    assert_eq!(rendered(&next.collect().await), vec!["result:fresh", "done"]);
}

#[tokio::test]
#[serial]
async fn thrown_errors_are_reported_then_done() {
    let coordinator = coordinator();
    let stream = coordinator
        .run_once("throw new TypeError('nope')", SourceLanguage::JavaScript)
        .unwrap();
    assert_eq!(
        rendered(&stream.collect().await),
        vec!["error:TypeError: nope", "done"]
    );
}

#[tokio::test]
#[serial]
async fn oversized_code_is_rejected_with_done() {
    let coordinator = RunCoordinator::new(CoordinatorConfig {
        sandbox: SandboxConfig {
            max_code_size: 16,
            ..Default::default()
        },
        ..Default::default()
    });

    let stream = coordinator
        .run_once("console.log('this is far too long')", SourceLanguage::JavaScript)
        .unwrap();
    let events = stream.collect().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Error);
    assert!(events[1].is_done());
}
