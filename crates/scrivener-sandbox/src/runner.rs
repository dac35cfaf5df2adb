//! The sandbox runner: launches one isolated frame per request and resolves
//! the run from the frame's tagged messages.
//!
//! Each run gets a fresh [`ExecutionToken`], its own bus listener and a fresh
//! isolate. A spawned task `select!`s over the listener, the deadline and the
//! frame's exit signal, feeding a [`RunStateMachine`]. The first terminal
//! input fixes the [`RunOutcome`]; later ones become `ignored:<type>`
//! breadcrumbs.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use scrivener_config::ScrivenerConfig;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::bus::{ListenerId, MessageBus};
use crate::diagnostics::{DiagnosticsSink, TracingDiagnostics};
use crate::error::SandboxError;
use crate::frame::{bootstrap_source, CodePayload, FrameBoot};
use crate::host::WorkerLauncher;
use crate::launcher::{FrameLauncher, InProcessLauncher};
use crate::lifecycle::{
    DeadlinePolicy, RunOutcome, RunStateMachine, Transition, DEFAULT_TIMEOUT, MIN_TIMEOUT,
    RENDER_GRACE,
};
use crate::mount::{Frame, Mount, WeakMount};
use crate::protocol::{ExecutionToken, FrameEvent, HostEvent, OpenDocumentRequest};
use crate::validator::DEFAULT_MAX_CODE_SIZE;

/// Error reported when a request carries no mount.
pub const MISSING_MOUNT: &str = "Missing mount container";

/// Program run instead of the request code when `minimal` is set.
pub const MINIMAL_PROGRAM: &str = r#"function render(mount) {
  mount.textContent = "Sandbox OK";
}
"#;

/// How the runner isolates frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// V8 isolate on a dedicated thread in this process (default).
    #[default]
    InProcess,
    /// A fresh `scrivener-worker` process per run.
    ChildProcess,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Timeout used when a request does not set one.
    pub default_timeout: Duration,
    /// Floor for any armed deadline.
    pub min_timeout: Duration,
    /// Extra time granted once `render-started` arrives.
    pub render_grace: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Size ceiling used by the static gate, in characters.
    pub max_code_size: usize,
    /// Isolation backend.
    pub execution_mode: ExecutionMode,
    /// Relax isolation and force raw injection. Never enable in production.
    pub debug: bool,
    /// Maximum IPC message size in bytes (child-process mode).
    pub max_ipc_message_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            min_timeout: MIN_TIMEOUT,
            render_grace: RENDER_GRACE,
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            execution_mode: ExecutionMode::default(),
            debug: false,
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

impl RunnerConfig {
    /// Apply file configuration over the defaults.
    pub fn from_config(config: &ScrivenerConfig) -> Result<Self, SandboxError> {
        let overrides = &config.sandbox;
        let mut out = Self::default();

        if let Some(ms) = overrides.timeout_ms {
            out.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.min_timeout_ms {
            out.min_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.render_grace_ms {
            out.render_grace = Duration::from_millis(ms);
        }
        if let Some(mb) = overrides.max_heap_mb {
            out.max_heap_size = mb * 1024 * 1024;
        }
        if let Some(size) = overrides.max_code_size {
            out.max_code_size = size;
        }
        if let Some(mb) = overrides.max_ipc_message_size_mb {
            out.max_ipc_message_size = mb * 1024 * 1024;
        }
        if let Some(mode) = &overrides.execution_mode {
            out.execution_mode = match mode.as_str() {
                "in_process" => ExecutionMode::InProcess,
                "child_process" => ExecutionMode::ChildProcess,
                other => {
                    return Err(SandboxError::Config(format!(
                        "unsupported execution mode '{other}'"
                    )))
                }
            };
        }
        out.debug = config.debug.enabled;
        Ok(out)
    }

    fn policy(&self, timeout: Option<Duration>) -> DeadlinePolicy {
        DeadlinePolicy {
            timeout: timeout.unwrap_or(self.default_timeout),
            min_timeout: self.min_timeout,
            render_grace: self.render_grace,
        }
    }
}

/// One render request.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Render code defining `function render(mount, datasets, helpers)`.
    pub code: String,
    /// Data handed to `render`.
    pub datasets: Value,
    /// Container the frame is appended to.
    pub mount: Option<Mount>,
    /// Initial deadline. Defaults to [`RunnerConfig::default_timeout`].
    pub timeout: Option<Duration>,
    /// Render a fixed `Sandbox OK` program instead of `code`.
    pub minimal: bool,
    /// Inject `code` raw, skipping decode and preparse.
    pub force_eval: bool,
}

impl RunRequest {
    /// A request for `code` with empty datasets.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            datasets: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    /// Attach a mount.
    pub fn mount(mut self, mount: &Mount) -> Self {
        self.mount = Some(mount.clone());
        self
    }

    /// Set datasets from a JSON value.
    pub fn datasets(mut self, datasets: Value) -> Self {
        self.datasets = datasets;
        self
    }

    /// Set datasets from any serializable value.
    pub fn with_datasets<T: Serialize>(mut self, datasets: &T) -> Result<Self, SandboxError> {
        self.datasets = serde_json::to_value(datasets)?;
        Ok(self)
    }

    /// Override the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Toggle the minimal diagnostic program.
    pub fn minimal(mut self, minimal: bool) -> Self {
        self.minimal = minimal;
        self
    }

    /// Toggle raw injection.
    pub fn force_eval(mut self, force_eval: bool) -> Self {
        self.force_eval = force_eval;
        self
    }
}

/// Receives open-document intents raised by clicks inside rendered output.
///
/// Requests are shape-checked but still tainted.
pub trait DocumentOpener: Send + Sync {
    /// Open the referenced document.
    fn open_document(&self, request: OpenDocumentRequest);
}

/// Runs untrusted render code in isolated frames.
pub struct SandboxRunner {
    config: RunnerConfig,
    bus: MessageBus,
    launcher: Arc<dyn FrameLauncher>,
    opener: Option<Arc<dyn DocumentOpener>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

impl SandboxRunner {
    /// Create a runner using the backend named by `config.execution_mode`.
    pub fn new(config: RunnerConfig) -> Self {
        let launcher: Arc<dyn FrameLauncher> = match config.execution_mode {
            ExecutionMode::InProcess => Arc::new(InProcessLauncher),
            ExecutionMode::ChildProcess => Arc::new(WorkerLauncher::new(config.max_ipc_message_size)),
        };
        Self {
            config,
            bus: MessageBus::new(),
            launcher,
            opener: None,
            diagnostics: Arc::new(TracingDiagnostics),
            audit_logger: Arc::new(NoopAuditLogger),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Forward open-document intents to `opener`.
    pub fn with_document_opener(mut self, opener: Arc<dyn DocumentOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Replace the diagnostics sink.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Replace the audit logger.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// Replace the isolation backend.
    pub fn with_launcher(mut self, launcher: Arc<dyn FrameLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Share an existing bus with other runners.
    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = bus;
        self
    }

    /// Record run metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn record_rejected(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_rejected();
        }
    }

    /// The host bus frames post to.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one request to its outcome.
    ///
    /// Every expected failure (bad code, timeout, crashed frame) is an
    /// `Ok` outcome with `ok == false`. `Err` means the host could not start
    /// the isolation backend or lost the run task.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, SandboxError> {
        let started = Instant::now();
        let debug = self.config.debug;
        let raw = request.force_eval || debug;
        let code = if request.minimal {
            MINIMAL_PROGRAM.to_string()
        } else {
            request.code
        };
        let audit = AuditEntryBuilder::new(&code).flags(request.minimal, raw);
        let run_id = audit.run_id().to_string();

        let Some(mount) = request.mount else {
            tracing::warn!(run_id = %run_id, "run: {}", MISSING_MOUNT);
            let outcome = RunOutcome::failure(MISSING_MOUNT);
            self.audit_logger.log(&audit.finish(&outcome, "none")).await;
            return Ok(outcome);
        };

        if debug {
            tracing::warn!(run_id = %run_id, "run: sandbox debug mode is enabled, isolation is relaxed");
        }

        let policy = self.config.policy(request.timeout);
        let token = ExecutionToken::generate();
        let boot = FrameBoot {
            token: token.clone(),
            payload: if raw {
                CodePayload::Raw(code.clone())
            } else {
                CodePayload::encode(&code)
            },
            datasets_json: serde_json::to_string(&request.datasets)?,
            max_heap_size: self.config.max_heap_size,
            relaxed: debug,
        };

        tracing::info!(
            run_id = %run_id,
            code_len = code.len(),
            minimal = request.minimal,
            force_eval = raw,
            mode = ?self.config.execution_mode,
            "run: starting"
        );

        // registered before launch so boot-started cannot be missed
        let (listener_id, messages) = self.bus.add_listener();
        let launched = match self.launcher.launch(boot, &self.bus).await {
            Ok(launched) => launched,
            Err(e) => {
                self.bus.remove_listener(listener_id);
                tracing::warn!(run_id = %run_id, error = %e, "run: failed to launch frame");
                return Err(e);
            }
        };

        let frame = Arc::new(Frame::new(launched.control));
        mount.append(frame.clone());
        if debug {
            frame.record_injected(bootstrap_source(true));
            frame.record_injected(code);
        }
        frame.deliver(HostEvent::Ping);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task = RunTask {
            run_id: run_id.clone(),
            token,
            bus: self.bus.clone(),
            listener_id,
            frame_id: frame.id(),
            frame: Arc::downgrade(&frame),
            mount: mount.downgrade(),
            opener: self.opener.clone(),
            diagnostics: self.diagnostics.clone(),
        };
        drop(frame);
        tokio::spawn(task.drive(policy, messages, launched.exited, outcome_tx));

        let (outcome, last_event) = outcome_rx.await.map_err(|_| {
            SandboxError::Execution(anyhow::anyhow!("run task ended without an outcome"))
        })?;

        self.audit_logger.log(&audit.finish(&outcome, last_event)).await;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_run(&outcome, started.elapsed().as_secs_f64());
        }

        match &outcome.error {
            None => tracing::info!(
                run_id = %run_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "run: complete"
            ),
            Some(error) => tracing::warn!(
                run_id = %run_id,
                last_event = last_event,
                error = %error,
                "run: failed"
            ),
        }

        Ok(outcome)
    }
}

/// Everything the spawned run task owns.
struct RunTask {
    run_id: String,
    token: ExecutionToken,
    bus: MessageBus,
    listener_id: ListenerId,
    frame_id: u64,
    // the caller's mount holds the strong references
    frame: Weak<Frame>,
    mount: WeakMount,
    opener: Option<Arc<dyn DocumentOpener>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

type OutcomeSender = oneshot::Sender<(RunOutcome, &'static str)>;

impl RunTask {
    async fn drive(
        self,
        policy: DeadlinePolicy,
        mut messages: mpsc::UnboundedReceiver<Value>,
        mut exited: oneshot::Receiver<()>,
        outcome_tx: OutcomeSender,
    ) {
        let mut machine = RunStateMachine::new(policy);
        let deadline = tokio::time::sleep(machine.mounted());
        tokio::pin!(deadline);
        let mut outcome_tx = Some(outcome_tx);

        loop {
            let settled = machine.latch().is_settled();
            // biased: messages already posted beat the exit signal and the deadline
            let transition = tokio::select! {
                biased;
                message = messages.recv() => match message {
                    Some(message) => match FrameEvent::parse_for(&self.token, &message) {
                        Some(event) => self.on_event(&mut machine, event),
                        None => continue,
                    },
                    None if settled => {
                        self.finish_after_success();
                        return;
                    }
                    None => machine.on_exit(),
                },
                _ = &mut exited => {
                    if settled {
                        self.finish_after_success();
                        return;
                    }
                    machine.on_exit()
                }
                _ = &mut deadline, if !settled => machine.on_timeout(),
            };

            match transition {
                Transition::None => {}
                Transition::Progressed { rearm } => {
                    if let Some(after) = rearm {
                        deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + after);
                    }
                }
                Transition::Late(kind) => {
                    self.diagnostics
                        .breadcrumb(&self.run_id, &format!("ignored:{kind}"), None);
                }
                Transition::Settled(outcome) => {
                    let ok = outcome.ok;
                    // a failed frame is gone before the caller sees the outcome
                    if !ok {
                        self.tear_down();
                    }
                    if let Some(tx) = outcome_tx.take() {
                        if tx.send((outcome, machine.last_event())).is_err() {
                            tracing::debug!(run_id = %self.run_id, "run caller went away");
                        }
                    }
                    if !ok {
                        return;
                    }
                }
            }
        }
    }

    fn on_event(&self, machine: &mut RunStateMachine, event: FrameEvent) -> Transition {
        match event {
            FrameEvent::Document { html } => {
                if let Some(frame) = self.frame.upgrade() {
                    frame.set_document(html);
                }
                Transition::None
            }
            FrameEvent::ConsoleLog { level, message } => {
                self.diagnostics.breadcrumb(
                    &self.run_id,
                    "console-log",
                    Some(&format!("[{level}] {message}")),
                );
                Transition::None
            }
            FrameEvent::AgentOpenDocument {
                doc_id,
                excerpt_text,
            } => {
                self.open_document(&doc_id, excerpt_text.as_deref());
                Transition::None
            }
            lifecycle => {
                let transition = machine.on_event(&lifecycle);
                if let (Transition::Progressed { .. }, FrameEvent::BootStarted | FrameEvent::RenderStarted) =
                    (&transition, &lifecycle)
                {
                    self.diagnostics.breadcrumb(&self.run_id, lifecycle.kind(), None);
                }
                if let FrameEvent::RenderError { message } = &lifecycle {
                    tracing::debug!(run_id = %self.run_id, error = %message, "frame reported render-error");
                }
                transition
            }
        }
    }

    fn open_document(&self, doc_id: &str, excerpt_text: Option<&str>) {
        let Some(request) = OpenDocumentRequest::from_intent(doc_id, excerpt_text) else {
            self.diagnostics
                .breadcrumb(&self.run_id, "rejected:agent-open-document", None);
            return;
        };
        match &self.opener {
            Some(opener) => opener.open_document(request),
            None => tracing::debug!(run_id = %self.run_id, "open-document intent with no opener"),
        }
    }

    /// Failure or timeout: detach the frame, stop it and drop the listener.
    fn tear_down(&self) {
        if let Some(frame) = self.frame.upgrade() {
            frame.terminate();
        }
        self.mount.remove(self.frame_id);
        self.bus.remove_listener(self.listener_id);
    }

    /// The context of a successful frame exited.
    fn finish_after_success(&self) {
        self.bus.remove_listener(self.listener_id);
        if let Some(frame) = self.frame.upgrade() {
            frame.mark_exited();
        }
        tracing::debug!(run_id = %self.run_id, "frame context exited");
    }
}
