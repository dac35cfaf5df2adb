//! Run protocol tests against a scripted frame.
//!
//! The scripted launcher posts a fixed sequence of frame events onto the bus,
//! so latch races, token filtering and deadline handling can be driven
//! deterministically without a V8 isolate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use scrivener_sandbox::audit::{AuditEntry, AuditLogger, AuditOutcome};
use scrivener_sandbox::frame::{CodePayload, FrameBoot};
use scrivener_sandbox::runner::{MINIMAL_PROGRAM, MISSING_MOUNT};
use scrivener_sandbox::{
    DiagnosticsSink, DocumentOpener, FrameControl, FrameEvent, FrameLauncher, HostEvent,
    LaunchedFrame, MessageBus, Mount, OpenDocumentRequest, RunOutcome, RunRequest, RunnerConfig,
    SandboxError, SandboxRunner,
};
use serde_json::{json, Value};
use serial_test::serial;
use tokio::sync::{oneshot, Notify};

const CODE: &str = "function render(mount) { mount.textContent = 'x'; }";

#[derive(Debug, Clone)]
enum Step {
    Emit(FrameEvent),
    Stray(Value),
    Wait(Duration),
    Exit,
}

#[derive(Default)]
struct ScriptedControl {
    delivered: Mutex<Vec<HostEvent>>,
    terminated: AtomicBool,
    stop: Notify,
}

impl ScriptedControl {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl FrameControl for ScriptedControl {
    fn deliver(&self, event: HostEvent) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.delivered.lock().unwrap().push(event);
        true
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

#[derive(Default)]
struct ScriptedLauncher {
    steps: Vec<Step>,
    controls: Mutex<Vec<Arc<ScriptedControl>>>,
    boots: Mutex<Vec<FrameBoot>>,
}

impl ScriptedLauncher {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps,
            ..Default::default()
        })
    }

    fn control(&self) -> Arc<ScriptedControl> {
        self.controls.lock().unwrap().last().cloned().expect("no frame launched")
    }

    fn launches(&self) -> usize {
        self.controls.lock().unwrap().len()
    }
}

#[async_trait]
impl FrameLauncher for ScriptedLauncher {
    async fn launch(&self, boot: FrameBoot, bus: &MessageBus) -> Result<LaunchedFrame, SandboxError> {
        let control = Arc::new(ScriptedControl::default());
        self.controls.lock().unwrap().push(control.clone());
        self.boots.lock().unwrap().push(boot.clone());

        let (exit_tx, exit_rx) = oneshot::channel();
        let steps = self.steps.clone();
        let bus = bus.clone();
        let token = boot.token.clone();
        let ctl = control.clone();
        tokio::spawn(async move {
            let mut exit_tx = Some(exit_tx);
            for step in steps {
                if ctl.is_terminated() {
                    break;
                }
                match step {
                    Step::Emit(event) => bus.post(event.to_message(&token)),
                    Step::Stray(message) => bus.post(message),
                    Step::Wait(d) => {
                        tokio::select! {
                            _ = tokio::time::sleep(d) => {}
                            _ = ctl.stop.notified() => break,
                        }
                    }
                    Step::Exit => {
                        if let Some(tx) = exit_tx.take() {
                            let _ = tx.send(());
                        }
                        return;
                    }
                }
            }
            if !ctl.is_terminated() {
                ctl.stop.notified().await;
            }
            if let Some(tx) = exit_tx.take() {
                let _ = tx.send(());
            }
        });

        Ok(LaunchedFrame {
            control,
            exited: exit_rx,
        })
    }
}

#[derive(Default)]
struct Breadcrumbs(Mutex<Vec<(String, Option<String>)>>);

impl Breadcrumbs {
    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    fn details(&self, event: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == event)
            .filter_map(|(_, d)| d.clone())
            .collect()
    }
}

impl DiagnosticsSink for Breadcrumbs {
    fn breadcrumb(&self, _run_id: &str, event: &str, detail: Option<&str>) {
        self.0
            .lock()
            .unwrap()
            .push((event.to_string(), detail.map(str::to_string)));
    }
}

#[derive(Default)]
struct RecordingOpener(Mutex<Vec<OpenDocumentRequest>>);

impl DocumentOpener for RecordingOpener {
    fn open_document(&self, request: OpenDocumentRequest) {
        self.0.lock().unwrap().push(request);
    }
}

#[derive(Default)]
struct CapturingAuditLogger(tokio::sync::Mutex<Vec<AuditEntry>>);

#[async_trait]
impl AuditLogger for CapturingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        self.0.lock().await.push(entry.clone());
    }
}

fn lifecycle_ok() -> Vec<Step> {
    vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Emit(FrameEvent::RenderDone),
    ]
}

fn runner(launcher: Arc<ScriptedLauncher>) -> SandboxRunner {
    SandboxRunner::new(RunnerConfig::default()).with_launcher(launcher)
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn missing_mount_never_launches() {
    let launcher = ScriptedLauncher::new(lifecycle_ok());
    let runner = runner(launcher.clone());
    let outcome = runner.run(RunRequest::new(CODE)).await.unwrap();
    assert_eq!(outcome, RunOutcome::failure(MISSING_MOUNT));
    assert_eq!(launcher.launches(), 0);
    assert_eq!(runner.bus().listener_count(), 0);
}

#[tokio::test]
async fn success_keeps_frame_mounted_and_live() {
    let launcher = ScriptedLauncher::new(lifecycle_ok());
    let runner = runner(launcher.clone());
    let mount = Mount::new();

    let outcome = runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();

    assert_eq!(outcome, RunOutcome::success());
    assert_eq!(mount.len(), 1);
    assert!(mount.last_frame().unwrap().is_live());
    assert!(!launcher.control().is_terminated());
    assert_eq!(runner.bus().listener_count(), 1);
}

#[tokio::test]
async fn ping_follows_mount() {
    let launcher = ScriptedLauncher::new(lifecycle_ok());
    let runner = runner(launcher.clone());
    let mount = Mount::new();
    runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    assert_eq!(
        launcher.control().delivered.lock().unwrap().first(),
        Some(&HostEvent::Ping)
    );
}

#[tokio::test]
async fn error_before_done_keeps_first_failure() {
    let launcher = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Emit(FrameEvent::error("uncaught: boom")),
        Step::Emit(FrameEvent::RenderDone),
    ]);
    let runner = runner(launcher.clone());
    let mount = Mount::new();

    let outcome = runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();

    assert_eq!(outcome, RunOutcome::failure("uncaught: boom"));
    assert!(mount.is_empty(), "failed frame must be removed");
    assert!(launcher.control().is_terminated());
    assert_eq!(runner.bus().listener_count(), 0);
}

#[tokio::test]
async fn done_before_error_keeps_success() {
    let diagnostics = Arc::new(Breadcrumbs::default());
    let launcher = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Emit(FrameEvent::RenderDone),
        Step::Wait(Duration::from_millis(20)),
        Step::Emit(FrameEvent::error("unhandledrejection: late")),
    ]);
    let runner = runner(launcher.clone()).with_diagnostics(diagnostics.clone());
    let mount = Mount::new();

    let outcome = runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    assert_eq!(outcome, RunOutcome::success());

    assert!(
        eventually(|| diagnostics.events().contains(&"ignored:render-error".to_string())).await,
        "late error should be recorded, got {:?}",
        diagnostics.events()
    );
    assert_eq!(mount.len(), 1);
    assert!(mount.last_frame().unwrap().is_live());
}

#[tokio::test]
async fn concurrent_runs_on_one_bus_resolve_independently() {
    let bus = MessageBus::new();
    let failing = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Wait(Duration::from_millis(30)),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Wait(Duration::from_millis(30)),
        Step::Emit(FrameEvent::error("eval user code: Error: nope")),
    ]);
    let succeeding = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Wait(Duration::from_millis(10)),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Wait(Duration::from_millis(80)),
        Step::Emit(FrameEvent::RenderDone),
    ]);
    let a = runner(failing).with_bus(bus.clone());
    let b = runner(succeeding).with_bus(bus.clone());
    let (mount_a, mount_b) = (Mount::new(), Mount::new());

    let (outcome_a, outcome_b) = tokio::join!(
        a.run(RunRequest::new(CODE).mount(&mount_a)),
        b.run(RunRequest::new(CODE).mount(&mount_b)),
    );

    assert_eq!(outcome_a.unwrap(), RunOutcome::failure("eval user code: Error: nope"));
    assert_eq!(outcome_b.unwrap(), RunOutcome::success());
    assert!(mount_a.is_empty());
    assert_eq!(mount_b.len(), 1);
    assert_eq!(bus.listener_count(), 1);
}

#[tokio::test]
async fn stray_messages_never_resolve_a_run() {
    let launcher = ScriptedLauncher::new(vec![
        Step::Stray(json!({"type": "render-error", "message": "no token"})),
        Step::Stray(json!({"__sandbox": "sbx-forged", "type": "render-done"})),
        Step::Stray(json!({"__sandbox": null, "type": "render-error", "message": "null token"})),
        Step::Stray(json!("not even an object")),
        Step::Emit(FrameEvent::BootStarted),
        Step::Stray(json!({"__sandbox": "sbx-forged", "type": "render-error", "message": "x"})),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Emit(FrameEvent::RenderDone),
    ]);
    let runner = runner(launcher);
    let mount = Mount::new();
    let outcome = runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    assert_eq!(outcome, RunOutcome::success());
}

#[tokio::test]
#[serial]
async fn only_stray_messages_time_out() {
    let launcher = ScriptedLauncher::new(vec![Step::Stray(
        json!({"__sandbox": "sbx-forged", "type": "render-done"}),
    )]);
    let runner = runner(launcher);
    let mount = Mount::new();
    let outcome = runner
        .run(RunRequest::new(CODE).mount(&mount).timeout(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::failure("Render timeout (last event: none)"));
}

#[tokio::test]
#[serial]
async fn timeout_fires_near_deadline_and_tears_down() {
    let audit = Arc::new(CapturingAuditLogger::default());
    let launcher = ScriptedLauncher::new(vec![Step::Emit(FrameEvent::BootStarted)]);
    let runner = runner(launcher.clone()).with_audit_logger(audit.clone());
    let mount = Mount::new();

    let start = Instant::now();
    let outcome = runner
        .run(RunRequest::new(CODE).mount(&mount).timeout(Duration::from_millis(300)))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, RunOutcome::failure("Render timeout (last event: boot-started)"));
    assert!(elapsed >= Duration::from_millis(290), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_500), "fired late: {elapsed:?}");
    assert!(mount.is_empty());
    assert!(launcher.control().is_terminated());
    assert_eq!(runner.bus().listener_count(), 0);

    let entries = audit.0.lock().await;
    assert_eq!(entries.len(), 1);
    assert!(matches!(entries[0].outcome, AuditOutcome::Timeout));
    assert_eq!(entries[0].last_event, "boot-started");
}

#[tokio::test]
#[serial]
async fn short_timeouts_are_floored() {
    let launcher = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Wait(Duration::from_millis(120)),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Emit(FrameEvent::RenderDone),
    ]);
    let runner = runner(launcher);
    let mount = Mount::new();
    let outcome = runner
        .run(RunRequest::new(CODE).mount(&mount).timeout(Duration::from_millis(10)))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::success());
}

#[tokio::test]
#[serial]
async fn render_started_rearms_deadline() {
    let launcher = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Wait(Duration::from_millis(900)),
        Step::Emit(FrameEvent::RenderDone),
    ]);
    let runner = runner(launcher);
    let mount = Mount::new();
    let outcome = runner
        .run(RunRequest::new(CODE).mount(&mount).timeout(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::success());
}

#[tokio::test]
#[serial]
async fn rearmed_deadline_still_expires() {
    let launcher = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Wait(Duration::from_secs(5)),
        Step::Emit(FrameEvent::RenderDone),
    ]);
    let config = RunnerConfig {
        render_grace: Duration::from_millis(200),
        ..RunnerConfig::default()
    };
    let runner = SandboxRunner::new(config).with_launcher(launcher.clone());
    let mount = Mount::new();
    let outcome = runner
        .run(RunRequest::new(CODE).mount(&mount).timeout(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::failure("Render timeout (last event: render-started)"));
    assert!(launcher.control().is_terminated());
}

#[tokio::test]
async fn context_exit_fails_pending_run() {
    let launcher = ScriptedLauncher::new(vec![Step::Emit(FrameEvent::BootStarted), Step::Exit]);
    let runner = runner(launcher);
    let mount = Mount::new();
    let outcome = runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::failure("Sandbox context exited (last event: boot-started)")
    );
    assert!(mount.is_empty());
    assert_eq!(runner.bus().listener_count(), 0);
}

#[tokio::test]
async fn error_posted_before_exit_wins_over_exit() {
    let launcher = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Emit(FrameEvent::error("preparse: Unexpected token")),
        Step::Exit,
    ]);
    let runner = runner(launcher);
    let mount = Mount::new();
    let outcome = runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    assert_eq!(outcome, RunOutcome::failure("preparse: Unexpected token"));
}

#[tokio::test]
async fn releasing_a_successful_frame_removes_its_listener() {
    let launcher = ScriptedLauncher::new(lifecycle_ok());
    let runner = runner(launcher.clone());
    let mount = Mount::new();
    runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    assert_eq!(runner.bus().listener_count(), 1);

    let frame = Arc::downgrade(&mount.last_frame().unwrap());
    mount.clear();
    assert!(frame.upgrade().is_none());
    assert!(launcher.control().is_terminated());
    assert!(eventually(|| runner.bus().listener_count() == 0).await);
}

#[tokio::test]
async fn open_document_intents_reach_the_opener() {
    let opener = Arc::new(RecordingOpener::default());
    let diagnostics = Arc::new(Breadcrumbs::default());
    let mut steps = lifecycle_ok();
    steps.extend([
        Step::Wait(Duration::from_millis(20)),
        Step::Emit(FrameEvent::AgentOpenDocument {
            doc_id: "   ".into(),
            excerpt_text: None,
        }),
        Step::Emit(FrameEvent::AgentOpenDocument {
            doc_id: "doc-7\u{0007}".into(),
            excerpt_text: None,
        }),
        Step::Emit(FrameEvent::AgentOpenDocument {
            doc_id: "doc-7".into(),
            excerpt_text: Some("Na 131\u{0000} mmol/L\nrepeat".into()),
        }),
    ]);
    let launcher = ScriptedLauncher::new(steps);
    let runner = runner(launcher)
        .with_document_opener(opener.clone())
        .with_diagnostics(diagnostics.clone());
    let mount = Mount::new();

    let outcome = runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    assert_eq!(outcome, RunOutcome::success());

    assert!(eventually(|| opener.0.lock().unwrap().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let requests = opener.0.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].doc_id, "doc-7");
    assert_eq!(requests[0].excerpt_text.as_deref(), Some("Na 131 mmol/L\nrepeat"));
    let rejected = diagnostics
        .events()
        .iter()
        .filter(|e| *e == "rejected:agent-open-document")
        .count();
    assert_eq!(rejected, 2);
}

#[tokio::test]
async fn console_output_goes_to_diagnostics() {
    let diagnostics = Arc::new(Breadcrumbs::default());
    let launcher = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Emit(FrameEvent::ConsoleLog {
            level: "warn".into(),
            message: "careful".into(),
        }),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Emit(FrameEvent::RenderDone),
    ]);
    let runner = runner(launcher).with_diagnostics(diagnostics.clone());
    let mount = Mount::new();
    runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();

    assert_eq!(diagnostics.details("console-log"), vec!["[warn] careful".to_string()]);
    let events = diagnostics.events();
    assert!(events.contains(&"boot-started".to_string()));
    assert!(events.contains(&"render-started".to_string()));
}

#[tokio::test]
async fn document_snapshot_lands_on_the_frame() {
    let launcher = ScriptedLauncher::new(vec![
        Step::Emit(FrameEvent::BootStarted),
        Step::Emit(FrameEvent::RenderStarted),
        Step::Emit(FrameEvent::Document {
            html: "<p>Sandbox OK</p>".into(),
        }),
        Step::Emit(FrameEvent::RenderDone),
    ]);
    let runner = runner(launcher);
    let mount = Mount::new();
    runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    assert_eq!(mount.last_frame().unwrap().document_html(), "<p>Sandbox OK</p>");
}

#[tokio::test]
async fn minimal_replaces_code_with_diagnostic_program() {
    let launcher = ScriptedLauncher::new(lifecycle_ok());
    let runner = runner(launcher.clone());
    let mount = Mount::new();
    runner
        .run(RunRequest::new("ignored").mount(&mount).minimal(true))
        .await
        .unwrap();
    let boots = launcher.boots.lock().unwrap();
    assert_eq!(boots[0].payload, CodePayload::encode(MINIMAL_PROGRAM));
    assert!(!boots[0].relaxed);
}

#[tokio::test]
async fn force_eval_sends_raw_payload() {
    let launcher = ScriptedLauncher::new(lifecycle_ok());
    let runner = runner(launcher.clone());
    let mount = Mount::new();
    runner
        .run(RunRequest::new(CODE).mount(&mount).force_eval(true))
        .await
        .unwrap();
    let boots = launcher.boots.lock().unwrap();
    assert_eq!(boots[0].payload, CodePayload::Raw(CODE.into()));
    assert!(mount.last_frame().unwrap().injected_scripts().is_empty());
}

#[tokio::test]
async fn debug_relaxes_and_records_injected_scripts() {
    let launcher = ScriptedLauncher::new(lifecycle_ok());
    let config = RunnerConfig {
        debug: true,
        ..RunnerConfig::default()
    };
    let runner = SandboxRunner::new(config).with_launcher(launcher.clone());
    let mount = Mount::new();
    runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();

    let boots = launcher.boots.lock().unwrap();
    assert_eq!(boots[0].payload, CodePayload::Raw(CODE.into()));
    assert!(boots[0].relaxed);
    let scripts = mount.last_frame().unwrap().injected_scripts();
    assert_eq!(scripts.len(), 2);
    assert_eq!(scripts[1], CODE);
}

#[tokio::test]
async fn every_run_gets_a_fresh_token() {
    let launcher = ScriptedLauncher::new(lifecycle_ok());
    let runner = runner(launcher.clone());
    let mount = Mount::new();
    for _ in 0..3 {
        runner.run(RunRequest::new(CODE).mount(&mount)).await.unwrap();
    }
    let boots = launcher.boots.lock().unwrap();
    let tokens: std::collections::HashSet<_> = boots.iter().map(|b| b.token.as_str().to_string()).collect();
    assert_eq!(tokens.len(), 3);
    assert!(tokens.iter().all(|t| t.starts_with("sbx-")));
    assert_eq!(mount.len(), 3);
}
