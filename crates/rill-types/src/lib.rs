//! Shared contract types for the rill streaming pipeline.
//!
//! Everything here is serializable so embedders can log or replay pipeline
//! traffic; no I/O lives in this crate.

use std::fmt;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// The two independently-rendered text streams of one assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Primary answer text.
    Answer,
    /// Reasoning/thinking trace, rendered to its own UI region.
    Reasoning,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Answer, Channel::Reasoning];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Answer => "answer",
            Channel::Reasoning => "reasoning",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier for one request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for one diagram render job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of the diagram layout engine.
///
/// The engine is an external collaborator; rill only carries its markup
/// through the queue and cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedGraphic {
    /// Rendered markup (typically SVG) ready for the embedding surface.
    pub markup: String,
}

/// Lifecycle of a diagram render job as reported to the UI.
///
/// `Queued -> Rendering -> {Rendered | ForcedSource | Failed}`, with
/// `Queued -> ForcedSource` reachable directly when the deadline passes
/// before rendering ever starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DiagramState {
    Queued,
    Rendering,
    Rendered { graphic: RenderedGraphic },
    /// Deadline passed with the source still structurally incomplete; the
    /// literal source text is shown instead of engine output.
    ForcedSource { source: String },
    /// The engine rejected a complete-looking source. The UI shows the
    /// source with an error affordance, never the raw engine error.
    Failed { source: String, message: String },
}

impl DiagramState {
    /// True once a job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DiagramState::Queued | DiagramState::Rendering)
    }
}

/// Error categories for pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure or aborted read.
    Transport,
    /// One malformed stream event (recoverable; skipped).
    Parse,
    /// A diagram exceeded its absolute wait budget.
    StructuralTimeout,
    /// The layout engine rejected a complete-looking source.
    Layout,
    /// User-initiated stop; not a failure.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::StructuralTimeout => write!(f, "structural_timeout"),
            ErrorKind::Layout => write!(f, "layout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured pipeline error with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineError {
    /// Error category.
    pub kind: ErrorKind,
    /// One-line summary suitable for display.
    pub message: String,
    /// Optional additional details (e.g. raw error body).
    pub details: Option<String>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Creates a transport error from an HTTP status and response body.
    ///
    /// Pulls a cleaner message out of a JSON error body when one is present.
    pub fn http_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}");
        if body.is_empty() {
            return Self::new(ErrorKind::Transport, message);
        }
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(body)
            && let Some(msg) = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
        {
            return Self {
                kind: ErrorKind::Transport,
                message: format!("HTTP {status}: {msg}"),
                details: Some(body.to_string()),
            };
        }
        Self {
            kind: ErrorKind::Transport,
            message,
            details: Some(body.to_string()),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "stopped by user")
    }

    /// True when the error is a user-initiated stop rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PipelineError {}

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Heuristic token usage for the UI meter.
///
/// Mirrors the shape upstream APIs report; prompt tokens are not estimated
/// by the pipeline and stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn completion(count: u32) -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: count,
            total_tokens: count,
        }
    }
}

/// A chat message in the outgoing request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Outgoing completion request. `stream` is always true; the pipeline has no
/// non-streaming path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl RequestPayload {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            stream: true,
        }
    }
}

/// Boxed byte stream delivered by a transport, in arrival order.
pub type ByteStream = BoxStream<'static, PipelineResult<bytes::Bytes>>;
