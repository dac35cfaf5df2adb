//! Diagnostics breadcrumbs for frame activity.
//!
//! The runner reports console output, ignored late terminals and other
//! non-outcome activity here. Nothing written to a sink affects a run.

/// Receives breadcrumbs about a run.
pub trait DiagnosticsSink: Send + Sync {
    /// Record one breadcrumb. `event` is a short kind such as `console-log`
    /// or `ignored:render-error`.
    fn breadcrumb(&self, run_id: &str, event: &str, detail: Option<&str>);
}

/// Writes breadcrumbs as `tracing` events under `scrivener::sandbox::frame`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn breadcrumb(&self, run_id: &str, event: &str, detail: Option<&str>) {
        tracing::debug!(
            target: "scrivener::sandbox::frame",
            run_id = %run_id,
            event = %event,
            detail = detail.unwrap_or(""),
            "frame breadcrumb"
        );
    }
}

/// Discards every breadcrumb.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDiagnostics;

impl DiagnosticsSink for NoopDiagnostics {
    fn breadcrumb(&self, _run_id: &str, _event: &str, _detail: Option<&str>) {}
}
