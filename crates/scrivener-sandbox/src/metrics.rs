//! Prometheus metrics for sandbox runs.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::lifecycle::RunOutcome;

/// Label set for run metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunLabels {
    /// `success`, `error`, `timeout` or `rejected`.
    pub outcome: String,
}

/// Prometheus metrics for the render sandbox.
pub struct SandboxMetrics {
    /// Total runs by outcome.
    pub runs_total: Family<RunLabels, Counter>,
    /// Run duration in seconds, by outcome.
    pub run_duration_seconds: Family<RunLabels, Histogram>,
}

impl SandboxMetrics {
    /// Create a new `SandboxMetrics` and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let runs_total = Family::default();
        registry.register("scrivener_sandbox_runs_total", "Total sandbox render runs", runs_total.clone());

        let run_duration_seconds = Family::<RunLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0].into_iter())
        });
        registry.register(
            "scrivener_sandbox_run_duration_seconds",
            "Sandbox render run duration",
            run_duration_seconds.clone(),
        );

        Self {
            runs_total,
            run_duration_seconds,
        }
    }

    /// Record a settled run.
    pub fn record_run(&self, outcome: &RunOutcome, duration_secs: f64) {
        let labels = RunLabels {
            outcome: outcome_label(outcome).to_string(),
        };
        self.runs_total.get_or_create(&labels).inc();
        self.run_duration_seconds.get_or_create(&labels).observe(duration_secs);
    }

    /// Record a submission rejected by the static gate.
    pub fn record_rejected(&self) {
        let labels = RunLabels {
            outcome: "rejected".into(),
        };
        self.runs_total.get_or_create(&labels).inc();
    }
}

fn outcome_label(outcome: &RunOutcome) -> &'static str {
    match (&outcome.error, outcome.ok) {
        (_, true) => "success",
        (Some(e), false) if e.starts_with("Render timeout") => "timeout",
        _ => "error",
    }
}
