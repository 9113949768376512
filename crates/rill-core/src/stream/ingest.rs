//! Event-level ingestion: framed SSE payloads to per-channel text deltas.
//!
//! Each upstream event may carry two independent deltas, answer text and
//! reasoning text, which downstream consumers route to separate channels.
//! One malformed event is not a stream failure: it is logged and skipped.

use serde::Deserialize;

use super::sse::SseEvent;

/// Incremental text extracted from one upstream event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaUpdate {
    pub reasoning: Option<String>,
    pub content: Option<String>,
}

impl DeltaUpdate {
    pub fn is_empty(&self) -> bool {
        self.reasoning.is_none() && self.content.is_none()
    }
}

/// Result of applying one framed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New text for one or both channels.
    Delta(DeltaUpdate),
    /// The upstream end marker arrived; the session completed.
    Finished,
    /// Nothing usable in this event (keepalive, empty delta, or a
    /// malformed payload that was skipped).
    Skipped,
}

/// Parses framed events into channel deltas and tracks stream health.
#[derive(Debug, Default)]
pub struct StreamIngestor {
    parse_errors: u32,
    finished: bool,
}

impl StreamIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of malformed events skipped so far.
    pub fn parse_errors(&self) -> u32 {
        self.parse_errors
    }

    /// True once the end marker has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Applies one framed event.
    pub fn apply(&mut self, event: &SseEvent) -> IngestOutcome {
        match event {
            SseEvent::Done => {
                self.finished = true;
                IngestOutcome::Finished
            }
            SseEvent::Data(payload) => match serde_json::from_str::<EventPayload>(payload) {
                Ok(parsed) => {
                    let update = parsed.into_delta();
                    if update.is_empty() {
                        IngestOutcome::Skipped
                    } else {
                        IngestOutcome::Delta(update)
                    }
                }
                Err(e) => {
                    self.parse_errors += 1;
                    tracing::warn!(error = %e, "skipping malformed stream event");
                    IngestOutcome::Skipped
                }
            },
        }
    }
}

// === Upstream payload structures ===

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(default)]
    choices: Vec<EventChoice>,
}

impl EventPayload {
    fn into_delta(mut self) -> DeltaUpdate {
        if self.choices.is_empty() {
            return DeltaUpdate::default();
        }
        let delta = self.choices.remove(0).delta;
        DeltaUpdate {
            reasoning: delta.reasoning_content.filter(|s| !s.is_empty()),
            content: delta.content.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventChoice {
    #[serde(default)]
    delta: EventDelta,
}

#[derive(Debug, Default, Deserialize)]
struct EventDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}
