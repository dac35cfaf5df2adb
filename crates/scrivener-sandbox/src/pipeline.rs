//! Two-stage render pipeline: static gate, then isolated execution.

use std::sync::Arc;

use crate::error::SandboxError;
use crate::lifecycle::RunOutcome;
use crate::runner::{RunRequest, SandboxRunner};
use crate::validator::{PatternValidator, StaticCheck, ValidationReport};

/// Result of submitting code to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    /// The static gate refused the code. Nothing was executed.
    Rejected(ValidationReport),
    /// The code ran to an outcome.
    Completed(RunOutcome),
}

impl PipelineResult {
    /// Whether the code passed the gate and rendered.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(outcome) if outcome.ok)
    }
}

/// Static gate in front of a [`SandboxRunner`].
pub struct RenderPipeline {
    gate: Arc<dyn StaticCheck>,
    runner: SandboxRunner,
}

impl RenderPipeline {
    /// Gate `runner` with a [`PatternValidator`] sized from its config.
    pub fn new(runner: SandboxRunner) -> Self {
        let gate = Arc::new(PatternValidator::new(runner.config().max_code_size));
        Self { gate, runner }
    }

    /// Replace the static gate.
    pub fn with_gate(mut self, gate: Arc<dyn StaticCheck>) -> Self {
        self.gate = gate;
        self
    }

    /// The wrapped runner.
    pub fn runner(&self) -> &SandboxRunner {
        &self.runner
    }

    /// Validate, then run. `minimal` requests skip the gate because they never
    /// execute the submitted code.
    pub async fn submit(&self, request: RunRequest) -> Result<PipelineResult, SandboxError> {
        if !request.minimal {
            let report = self.gate.check(&request.code);
            if !report.ok {
                tracing::info!(errors = report.errors.len(), "submit: rejected by static gate");
                self.runner.record_rejected();
                return Ok(PipelineResult::Rejected(report));
            }
        }
        let outcome = self.runner.run(request).await?;
        Ok(PipelineResult::Completed(outcome))
    }
}
