//! Audit logging for sandbox runs.
//!
//! Every settled run emits an [`AuditEntry`] containing:
//! - Run ID (UUID)
//! - SHA-256 hash of the render code (never raw code in logs)
//! - A preview of the first 500 bytes of code
//! - Injection flags, duration, last lifecycle event and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::lifecycle::RunOutcome;

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single run.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique run identifier.
    pub run_id: String,
    /// When the run started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted code.
    pub code_hash: String,
    /// First N bytes of the code (for human review).
    pub code_preview: String,
    /// The fixed diagnostic program ran instead of the submitted code.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub minimal: bool,
    /// Code was injected raw.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_eval: bool,
    /// Run duration in milliseconds.
    pub duration_ms: u64,
    /// Last lifecycle event observed before the outcome.
    pub last_event: String,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The outcome of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// Render completed.
    Success,
    /// The frame reported an error or exited.
    Error {
        /// The error message.
        message: String,
    },
    /// The deadline elapsed.
    Timeout,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Create a code preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary to avoid panics on multibyte characters.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        code.to_string()
    } else {
        let mut end = CODE_PREVIEW_MAX;
        while !code.is_char_boundary(end) {
            end -= 1;
        }
        let mut preview = code[..end].to_string();
        preview.push_str("...");
        preview
    }
}

/// Builder for constructing audit entries during a run.
pub struct AuditEntryBuilder {
    run_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    minimal: bool,
    force_eval: bool,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for a run of `code`.
    pub fn new(code: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: code_preview(code),
            minimal: false,
            force_eval: false,
            start: Instant::now(),
        }
    }

    /// Record injection flags.
    pub fn flags(mut self, minimal: bool, force_eval: bool) -> Self {
        self.minimal = minimal;
        self.force_eval = force_eval;
        self
    }

    /// Run identifier, shared with diagnostics breadcrumbs.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Finalize the entry with the run's outcome.
    pub fn finish(&self, outcome: &RunOutcome, last_event: &str) -> AuditEntry {
        let outcome = match (outcome.ok, &outcome.error) {
            (true, _) => AuditOutcome::Success,
            (false, Some(message)) if message.starts_with("Render timeout") => AuditOutcome::Timeout,
            (false, message) => AuditOutcome::Error {
                message: message.clone().unwrap_or_default(),
            },
        };

        AuditEntry {
            run_id: self.run_id.clone(),
            timestamp: self.timestamp,
            code_hash: self.code_hash.clone(),
            code_preview: self.code_preview.clone(),
            minimal: self.minimal,
            force_eval: self.force_eval,
            duration_ms: self.start.elapsed().as_millis() as u64,
            last_event: last_event.to_string(),
            outcome,
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via the [`tracing`] framework.
///
/// Audit entries are logged at `INFO` level with `audit = true` for easy
/// filtering. Use `RUST_LOG=scrivener=info` to capture all audit events.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::Timeout => "timeout",
        };
        tracing::info!(
            audit = true,
            run_id = %entry.run_id,
            code_hash = %entry.code_hash,
            minimal = entry.minimal,
            force_eval = entry.force_eval,
            duration_ms = entry.duration_ms,
            last_event = %entry.last_event,
            outcome = outcome,
            "audit"
        );
    }
}
