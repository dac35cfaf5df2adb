//! Message protocol between the host and a sandboxed frame.
//!
//! Every message is a JSON object tagged with the run's [`ExecutionToken`]
//! under `__sandbox` and a kebab-case `type`:
//!
//! ```json
//! { "__sandbox": "sbx-…", "type": "render-error", "message": "preparse: …" }
//! ```
//!
//! Frames post [`FrameEvent`]s onto the host [`MessageBus`](crate::bus::MessageBus);
//! the host delivers [`HostEvent`]s to one frame. A message whose token does
//! not match the listening run is dropped by [`FrameEvent::parse_for`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// JSON key carrying the execution token.
pub const TOKEN_KEY: &str = "__sandbox";

/// Longest accepted document identifier in an open-document intent.
const MAX_DOC_ID_CHARS: usize = 256;

/// Longest excerpt forwarded to the document opener.
const MAX_EXCERPT_CHARS: usize = 2_000;

/// Unguessable per-run identifier.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionToken(String);

impl ExecutionToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(format!("sbx-{}", Uuid::new_v4().simple()))
    }

    /// Wrap an existing token string.
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check a raw message's `__sandbox` field against this token.
    pub fn matches(&self, message: &Value) -> bool {
        message.get(TOKEN_KEY).and_then(Value::as_str) == Some(self.0.as_str())
    }
}

// Tokens never appear in logs.
impl std::fmt::Debug for ExecutionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExecutionToken(..)")
    }
}

/// Messages posted by a frame to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FrameEvent {
    /// The frame bootstrap began executing.
    BootStarted,
    /// `render` is about to be invoked.
    RenderStarted,
    /// `render` returned without throwing.
    RenderDone,
    /// Any stage failed. The message carries a stage tag.
    RenderError {
        /// Human-readable error, e.g. `preparse: Unexpected token`.
        message: String,
    },
    /// Console output from inside the frame.
    ConsoleLog {
        /// `log`, `info`, `warn`, `error` or `debug`.
        #[serde(default = "default_console_level")]
        level: String,
        /// Rendered console arguments.
        message: String,
    },
    /// The user clicked a citation link inside the rendered output.
    AgentOpenDocument {
        /// Opaque document identifier.
        #[serde(rename = "docId")]
        doc_id: String,
        /// Optional excerpt attached to the citation.
        #[serde(rename = "excerptText", default, skip_serializing_if = "Option::is_none")]
        excerpt_text: Option<String>,
    },
    /// Serialized HTML of the rendered mount.
    Document {
        /// Mount inner HTML.
        html: String,
    },
}

fn default_console_level() -> String {
    "log".to_string()
}

impl FrameEvent {
    /// Parse a raw bus message, returning `None` for any message that does not
    /// carry exactly `token` or is not a well-formed frame event.
    pub fn parse_for(token: &ExecutionToken, message: &Value) -> Option<Self> {
        if !token.matches(message) {
            return None;
        }
        match serde_json::from_value(message.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed frame message");
                None
            }
        }
    }

    /// Serialize this event as a bus message tagged with `token`.
    pub fn to_message(&self, token: &ExecutionToken) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()));
        if let Value::Object(map) = &mut value {
            map.insert(TOKEN_KEY.to_string(), Value::String(token.as_str().to_string()));
        }
        value
    }

    /// Wire name of this event (`render-done`, …).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BootStarted => "boot-started",
            Self::RenderStarted => "render-started",
            Self::RenderDone => "render-done",
            Self::RenderError { .. } => "render-error",
            Self::ConsoleLog { .. } => "console-log",
            Self::AgentOpenDocument { .. } => "agent-open-document",
            Self::Document { .. } => "document",
        }
    }

    /// Build a `render-error` event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::RenderError {
            message: message.into(),
        }
    }
}

/// Messages the host delivers into a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostEvent {
    /// Liveness probe sent right after mount. No reply is expected.
    Ping,
    /// Dispatch a synthetic click on the first element matching `selector`.
    Click {
        /// Simple CSS selector (`tag`, `#id`, `.class`, `[attr]`, `[attr=value]`).
        selector: String,
    },
}

/// An open-document intent after shape checks.
///
/// The payload originates inside untrusted rendered output. Only its shape is
/// enforced here; receivers must still treat both fields as tainted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenDocumentRequest {
    /// Opaque document identifier.
    pub doc_id: String,
    /// Optional excerpt text.
    pub excerpt_text: Option<String>,
}

impl OpenDocumentRequest {
    /// Shape-check a raw intent. The identifier is passed through verbatim;
    /// `None` when it is blank, too long, or carries control characters.
    pub fn from_intent(doc_id: &str, excerpt_text: Option<&str>) -> Option<Self> {
        if doc_id.trim().is_empty()
            || doc_id.chars().count() > MAX_DOC_ID_CHARS
            || doc_id.chars().any(char::is_control)
        {
            return None;
        }
        let excerpt_text = excerpt_text
            .map(|text| {
                text.chars()
                    .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
                    .take(MAX_EXCERPT_CHARS)
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty());
        Some(Self {
            doc_id: doc_id.to_string(),
            excerpt_text,
        })
    }
}
