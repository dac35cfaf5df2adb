//! Per-run lifecycle state machine and first-write-wins outcome latch.
//!
//! ```text
//!  Created --mount--> Booting --boot-started--> Booted
//!  Booted --render-started--> Rendering            (deadline rearmed)
//!  Rendering --render-done--> Succeeded            (frame retained)
//!  Booting|Booted|Rendering --render-error|timeout|exit--> Failed
//! ```
//!
//! The machine owns no timers. It tells the runner when to rearm and what the
//! single outcome is; the runner owns the clock and the frame.

use std::time::Duration;

use serde::Serialize;

use crate::protocol::FrameEvent;

/// Floor applied to every armed deadline.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Extra time granted once rendering starts.
pub const RENDER_GRACE: Duration = Duration::from_millis(4_000);

/// Default initial render timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2_000);

/// The single result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    /// Whether render completed.
    pub ok: bool,
    /// Failure description when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    /// A successful outcome.
    pub fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    /// A failed outcome.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Phase of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Request accepted, nothing mounted yet.
    Created,
    /// Frame mounted, waiting for `boot-started`.
    Booting,
    /// Bootstrap running.
    Booted,
    /// `render` invoked.
    Rendering,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
}

impl RunPhase {
    /// Whether this phase is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// First-write-wins outcome holder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutcomeLatch {
    /// No terminal signal yet.
    #[default]
    Pending,
    /// Settled successfully.
    Succeeded,
    /// Settled with an error.
    Failed(String),
}

impl OutcomeLatch {
    /// Settle as success. Returns `false` if already settled.
    pub fn succeed(&mut self) -> bool {
        self.settle(Self::Succeeded)
    }

    /// Settle as failure. Returns `false` if already settled.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        self.settle(Self::Failed(error.into()))
    }

    fn settle(&mut self, next: Self) -> bool {
        if self.is_settled() {
            return false;
        }
        *self = next;
        true
    }

    /// Whether a terminal signal has been recorded.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The settled outcome, if any.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            Self::Pending => None,
            Self::Succeeded => Some(RunOutcome::success()),
            Self::Failed(error) => Some(RunOutcome::failure(error.clone())),
        }
    }
}

/// Deadline parameters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlinePolicy {
    /// Requested timeout.
    pub timeout: Duration,
    /// Floor for any armed deadline.
    pub min_timeout: Duration,
    /// Grace added once rendering starts.
    pub render_grace: Duration,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            min_timeout: MIN_TIMEOUT,
            render_grace: RENDER_GRACE,
        }
    }
}

impl DeadlinePolicy {
    /// Deadline armed at mount time.
    pub fn initial(&self) -> Duration {
        self.timeout.max(self.min_timeout)
    }

    /// Deadline armed when `render-started` arrives.
    pub fn rendering(&self) -> Duration {
        (self.timeout + self.render_grace).max(self.min_timeout)
    }
}

/// What the runner should do after feeding the machine an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do.
    None,
    /// Lifecycle progressed. Rearm the deadline if `rearm` is set.
    Progressed {
        /// New deadline measured from now.
        rearm: Option<Duration>,
    },
    /// This input produced the run's outcome.
    Settled(RunOutcome),
    /// A terminal input arrived after the outcome was fixed.
    Late(&'static str),
}

/// Lifecycle tracker for one run.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    phase: RunPhase,
    latch: OutcomeLatch,
    last_event: Option<&'static str>,
    policy: DeadlinePolicy,
}

impl RunStateMachine {
    /// Start a machine in [`RunPhase::Created`].
    pub fn new(policy: DeadlinePolicy) -> Self {
        Self {
            phase: RunPhase::Created,
            latch: OutcomeLatch::Pending,
            last_event: None,
            policy,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// The latch.
    pub fn latch(&self) -> &OutcomeLatch {
        &self.latch
    }

    /// Last lifecycle event seen, or `"none"`.
    pub fn last_event(&self) -> &'static str {
        self.last_event.unwrap_or("none")
    }

    /// Record that the frame has been mounted. Returns the initial deadline.
    pub fn mounted(&mut self) -> Duration {
        if self.phase == RunPhase::Created {
            self.phase = RunPhase::Booting;
        }
        self.policy.initial()
    }

    /// Feed a frame event.
    pub fn on_event(&mut self, event: &FrameEvent) -> Transition {
        match event {
            FrameEvent::BootStarted => {
                if self.latch.is_settled() {
                    return Transition::None;
                }
                self.last_event = Some("boot-started");
                if matches!(self.phase, RunPhase::Created | RunPhase::Booting) {
                    self.phase = RunPhase::Booted;
                }
                Transition::Progressed { rearm: None }
            }
            FrameEvent::RenderStarted => {
                if self.latch.is_settled() {
                    return Transition::None;
                }
                self.last_event = Some("render-started");
                self.phase = RunPhase::Rendering;
                Transition::Progressed {
                    rearm: Some(self.policy.rendering()),
                }
            }
            FrameEvent::RenderDone => {
                if self.latch.succeed() {
                    self.phase = RunPhase::Succeeded;
                    Transition::Settled(RunOutcome::success())
                } else {
                    Transition::Late("render-done")
                }
            }
            FrameEvent::RenderError { message } => self.fail_with(message.clone(), "render-error"),
            FrameEvent::ConsoleLog { .. }
            | FrameEvent::AgentOpenDocument { .. }
            | FrameEvent::Document { .. } => Transition::None,
        }
    }

    /// The armed deadline elapsed.
    pub fn on_timeout(&mut self) -> Transition {
        let message = format!("Render timeout (last event: {})", self.last_event());
        self.fail_with(message, "timeout")
    }

    /// The frame's context exited.
    pub fn on_exit(&mut self) -> Transition {
        let message = format!("Sandbox context exited (last event: {})", self.last_event());
        self.fail_with(message, "exit")
    }

    fn fail_with(&mut self, message: String, kind: &'static str) -> Transition {
        if self.latch.fail(message.clone()) {
            self.phase = RunPhase::Failed;
            Transition::Settled(RunOutcome::failure(message))
        } else {
            Transition::Late(kind)
        }
    }
}
