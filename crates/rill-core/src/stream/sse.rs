//! SSE framing over a raw byte stream.
//!
//! Splits arriving bytes into discrete events on the blank-line boundary,
//! handling both LF and CRLF endings. Bytes are decoded to text only once a
//! complete event is framed, so multi-byte UTF-8 sequences split across
//! network chunks are held over intact rather than corrupted.

use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::Stream;
use rill_types::{PipelineError, PipelineResult};

/// One framed upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line, JSON text still unparsed.
    Data(String),
    /// The literal `[DONE]` marker: successful end of session.
    Done,
}

/// End-of-stream marker used by the upstream framing.
const DONE_MARKER: &str = "[DONE]";

/// SSE parser that converts a byte stream into [`SseEvent`]s.
pub struct SseParser<S> {
    inner: S,
    buffer: Vec<u8>,
    pending: VecDeque<SseEvent>,
}

impl<S> SseParser<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }
    }
}

impl<S> Stream for SseParser<S>
where
    S: Stream<Item = PipelineResult<bytes::Bytes>> + Unpin,
{
    type Item = PipelineResult<SseEvent>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            if let Some(result) = self.try_frame_event() {
                match result {
                    Ok(()) => continue,
                    Err(e) => return Poll::Ready(Some(Err(e))),
                }
            }

            let inner = Pin::new(&mut self.inner);
            match inner.poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    // Stream ended: frame whatever remains so trailing
                    // characters are never lost.
                    let is_empty = self.buffer.iter().all(u8::is_ascii_whitespace);
                    if is_empty {
                        return Poll::Ready(None);
                    }
                    let residual = std::mem::take(&mut self.buffer);
                    if let Err(e) = self.parse_event_block(&residual) {
                        return Poll::Ready(Some(Err(e)));
                    }
                    if let Some(event) = self.pending.pop_front() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> SseParser<S> {
    /// Frames one complete event from the buffer into `pending`.
    /// Returns `None` if no complete event is available yet.
    fn try_frame_event(&mut self) -> Option<PipelineResult<()>> {
        let (event_end, delim_len) = find_double_newline(&self.buffer)?;

        let event_bytes: Vec<u8> = self.buffer.drain(..event_end).collect();
        self.buffer.drain(..delim_len);

        Some(self.parse_event_block(&event_bytes))
    }

    /// Decodes a complete event block and queues its `data:` payloads.
    fn parse_event_block(&mut self, event_bytes: &[u8]) -> PipelineResult<()> {
        let event_text = std::str::from_utf8(event_bytes)
            .map_err(|e| PipelineError::parse(format!("Invalid UTF-8 in event: {e}")))?;

        for line in event_text.lines() {
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            if payload.trim() == DONE_MARKER {
                self.pending.push_back(SseEvent::Done);
            } else if !payload.is_empty() {
                self.pending.push_back(SseEvent::Data(payload.to_string()));
            }
        }
        Ok(())
    }
}

/// Finds the position of a double newline in the buffer.
/// Handles both LF (\n\n) and CRLF (\r\n\r\n) line endings.
/// Returns the position and the length of the delimiter (2 or 4 bytes).
fn find_double_newline(buffer: &[u8]) -> Option<(usize, usize)> {
    let crlf_pos = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    let lf_pos = buffer.windows(2).position(|w| w == b"\n\n");

    match (crlf_pos, lf_pos) {
        (Some(c), Some(l)) => {
            if l <= c {
                Some((l, 2))
            } else {
                Some((c, 4))
            }
        }
        (Some(c), None) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}
