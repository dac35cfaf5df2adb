#![warn(missing_docs)]

//! # scrivener-sandbox
//!
//! Sandboxed render pipeline for agent-generated visualization code.
//!
//! Untrusted code defining `function render(mount, datasets, helpers)` passes
//! two stages:
//!
//! 1. [`validate`]: a pure regex deny-list and shape check.
//! 2. [`SandboxRunner::run`]: execution in a fresh V8 isolate with no fs, net
//!    or env access, driven entirely by token-tagged messages and bounded by a
//!    two-phase deadline.
//!
//! [`RenderPipeline`] composes both.
//!
//! ## Security model
//!
//! - **Fresh isolate per run**: no pooling, no state shared between runs
//! - **No ambient capabilities**: `Deno`, `__bootstrap`, `eval` and the
//!   `Function` constructors are removed or locked before render code runs, so
//!   the frame's post/receive ops are reachable only from the bootstrap closure
//! - **Per-run token**: a random `sbx-` token tags every message; anything
//!   else on the bus is ignored
//! - **First write wins**: each run resolves exactly once
//! - **Optional process isolation**: [`ExecutionMode::ChildProcess`] runs each
//!   frame in a `scrivener-worker` process with a cleared environment

pub mod audit;
pub mod bus;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod host;
pub mod ipc;
pub mod launcher;
pub mod lifecycle;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod mount;
pub mod ops;
pub mod pipeline;
pub mod protocol;
pub mod runner;
pub mod validator;

pub use bus::MessageBus;
pub use diagnostics::{DiagnosticsSink, NoopDiagnostics, TracingDiagnostics};
pub use error::SandboxError;
pub use launcher::{FrameControl, FrameLauncher, InProcessLauncher, LaunchedFrame};
pub use lifecycle::{OutcomeLatch, RunOutcome, RunPhase};
pub use mount::{Frame, Mount};
pub use pipeline::{PipelineResult, RenderPipeline};
pub use protocol::{ExecutionToken, FrameEvent, HostEvent, OpenDocumentRequest};
pub use runner::{DocumentOpener, ExecutionMode, RunRequest, RunnerConfig, SandboxRunner};
pub use validator::{validate, PatternValidator, StaticCheck, ValidationReport};
