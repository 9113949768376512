//! End-to-end pipeline scenarios against mock transport, engine and sink.
//!
//! These run on tokio's paused clock: scripted chunk gaps, drain ticks,
//! retry backoffs and render deadlines all advance deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use rill_core::config::Config;
use rill_core::core::pipeline::{Pipeline, UiSink};
use rill_core::render::diagram::DiagramEngine;
use rill_core::stream::StreamOpener;
use rill_types::{
    ByteStream, Channel, ChatMessage, DiagramState, JobId, PipelineError, PipelineResult,
    RenderedGraphic, RequestPayload, TokenUsage,
};

// === Mock collaborators ===

/// One scripted connection: either a sequence of (delay, chunk) pairs, or
/// an immediate open failure. Chunks are raw bytes so tests can split
/// inside UTF-8 sequences.
type OpenScript = Result<Vec<(u64, Vec<u8>)>, PipelineError>;

struct MockOpener {
    scripts: Mutex<VecDeque<OpenScript>>,
    opens: AtomicUsize,
}

impl MockOpener {
    fn new(scripts: Vec<OpenScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opens: AtomicUsize::new(0),
        })
    }

    fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl StreamOpener for MockOpener {
    fn open(&self, _payload: RequestPayload) -> BoxFuture<'static, PipelineResult<ByteStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PipelineError::transport("no scripted stream left")));
        async move {
            let chunks = script?;
            let stream: ByteStream = futures_util::stream::unfold(
                chunks.into_iter(),
                |mut it| async move {
                    let (delay, data) = it.next()?;
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    Some((Ok(bytes::Bytes::from(data)), it))
                },
            )
            .boxed();
            Ok(stream)
        }
        .boxed()
    }
}

struct MockEngine {
    calls: Mutex<Vec<String>>,
    delay_ms: u64,
    fail_with: Option<String>,
}

impl MockEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay_ms: 10,
            fail_with: None,
        })
    }

    fn slow(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay_ms,
            fail_with: None,
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay_ms: 10,
            fail_with: Some(message.to_string()),
        })
    }

    fn sources(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl DiagramEngine for MockEngine {
    fn layout(
        &self,
        source: String,
        _theme: String,
    ) -> BoxFuture<'static, PipelineResult<RenderedGraphic>> {
        self.calls.lock().unwrap().push(source.clone());
        let delay = self.delay_ms;
        let fail = self.fail_with.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            match fail {
                Some(message) => Err(PipelineError::new(rill_types::ErrorKind::Layout, message)),
                None => Ok(RenderedGraphic {
                    markup: format!("<svg><!-- {} --></svg>", source.len()),
                }),
            }
        }
        .boxed()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SinkEvent {
    Channel(Channel, String),
    Diagram(JobId, DiagramState),
    Usage(TokenUsage),
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    fn channel_updates(&self, channel: Channel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Channel(c, text) if c == channel => Some(text),
                _ => None,
            })
            .collect()
    }

    fn final_text(&self, channel: Channel) -> String {
        self.channel_updates(channel).pop().unwrap_or_default()
    }

    fn diagram_events(&self) -> Vec<(JobId, DiagramState)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Diagram(id, state) => Some((id, state)),
                _ => None,
            })
            .collect()
    }
}

impl UiSink for RecordingSink {
    fn on_channel_update(&self, channel: Channel, full_text: &str) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Channel(channel, full_text.to_string()));
    }

    fn on_diagram_state_change(&self, job: &JobId, state: &DiagramState) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Diagram(job.clone(), state.clone()));
    }

    fn on_token_usage(&self, usage: TokenUsage) {
        self.events.lock().unwrap().push(SinkEvent::Usage(usage));
    }
}

// === Fixture helpers ===

fn delta_event(content: &str) -> Vec<u8> {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"content": content}}]})
    )
    .into_bytes()
}

fn reasoning_event(reasoning: &str) -> Vec<u8> {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"reasoning_content": reasoning}}]})
    )
    .into_bytes()
}

fn done_event() -> Vec<u8> {
    b"data: [DONE]\n\n".to_vec()
}

fn payload() -> RequestPayload {
    RequestPayload::new("test-model", vec![ChatMessage::user("draw me a graph")])
}

fn pipeline(
    opener: Arc<MockOpener>,
    engine: Arc<MockEngine>,
    sink: Arc<RecordingSink>,
) -> Pipeline {
    Pipeline::new(Config::default(), opener, engine, sink)
}

fn assert_append_only(updates: &[String]) {
    for pair in updates.windows(2) {
        assert!(
            pair[1].starts_with(&pair[0]),
            "channel update {:?} is not an extension of {:?}",
            pair[1],
            pair[0]
        );
    }
}

// === Scenarios ===

/// Three chunks with 50ms gaps: plain text then a complete mermaid block.
/// The block renders (not forced), exactly one job exists, and the engine
/// sees the exact diagram source.
#[tokio::test(start_paused = true)]
async fn scenario_hello_then_complete_diagram() {
    let body = "Hello ```mermaid\ngraph TD;A-->B\n```";
    let opener = MockOpener::new(vec![Ok(vec![
        (0, delta_event("He")),
        (50, delta_event("llo ")),
        (50, delta_event("```mermaid\ngraph TD;A-->B\n```")),
        (10, done_event()),
    ])]);
    let engine = MockEngine::new();
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, Arc::clone(&engine), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    assert_eq!(sink.final_text(Channel::Answer), body);
    assert_append_only(&sink.channel_updates(Channel::Answer));

    assert_eq!(engine.sources(), vec!["graph TD;A-->B".to_string()]);

    let diagram_events = sink.diagram_events();
    let ids: std::collections::HashSet<_> =
        diagram_events.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(ids.len(), 1, "exactly one diagram job");
    assert!(
        matches!(diagram_events.last(), Some((_, DiagramState::Rendered { .. }))),
        "job must resolve rendered, not forced: {diagram_events:?}"
    );
}

/// Arbitrary byte chunking must never lose trailing characters: after the
/// stream ends, committed length equals the full delta length.
#[tokio::test(start_paused = true)]
async fn scenario_no_data_loss_under_arbitrary_chunking() {
    let text = "Streaming naïve text with 漢字 and 👋 emoji across chunks.";
    let transcript = [delta_event(text), done_event()].concat();
    // Seven-byte chunks split inside multi-byte sequences on purpose.
    let chunks: Vec<(u64, Vec<u8>)> = transcript
        .chunks(7)
        .map(|c| (1, c.to_vec()))
        .collect();

    let opener = MockOpener::new(vec![Ok(chunks)]);
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, MockEngine::new(), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    assert_eq!(sink.final_text(Channel::Answer), text);
}

/// The same diagram source twice invokes the layout engine exactly once;
/// the second job resolves from the cache.
#[tokio::test(start_paused = true)]
async fn scenario_idempotent_render_cache() {
    let block = "```mermaid\ngraph TD;A-->B\n```\n";
    let opener = MockOpener::new(vec![Ok(vec![
        (0, delta_event(&format!("first\n{block}"))),
        (20, delta_event(&format!("second\n{block}"))),
        (10, done_event()),
    ])]);
    let engine = MockEngine::new();
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, Arc::clone(&engine), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    assert_eq!(engine.sources().len(), 1, "layout runs once per source");

    let rendered: Vec<_> = sink
        .diagram_events()
        .into_iter()
        .filter(|(_, s)| matches!(s, DiagramState::Rendered { .. }))
        .collect();
    assert_eq!(rendered.len(), 2, "both jobs still resolve rendered");
}

/// A job whose source never becomes structurally complete resolves
/// `ForcedSource` at its deadline and never reaches the engine.
#[tokio::test(start_paused = true)]
async fn scenario_incomplete_diagram_forces_source_at_deadline() {
    let opener = MockOpener::new(vec![Ok(vec![
        (0, delta_event("```mermaid\ngraph TD\n```\n")),
        (10, done_event()),
    ])]);
    let engine = MockEngine::new();
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, Arc::clone(&engine), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    assert!(engine.sources().is_empty(), "incomplete source never laid out");
    let events = sink.diagram_events();
    assert!(
        matches!(
            events.last(),
            Some((_, DiagramState::ForcedSource { source })) if source == "graph TD"
        ),
        "expected forced source resolution: {events:?}"
    );
}

/// A diagram block that opens but never closes before the stream ends is
/// displayed as literal source; no job is ever enqueued for it.
#[tokio::test(start_paused = true)]
async fn scenario_unclosed_diagram_block_gets_no_job() {
    let opener = MockOpener::new(vec![Ok(vec![
        (0, delta_event("Look:\n```mermaid\ngraph TD;A-->B\n")),
        (10, done_event()),
    ])]);
    let engine = MockEngine::new();
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, Arc::clone(&engine), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    assert!(sink.diagram_events().is_empty(), "no job for unclosed block");
    assert!(engine.sources().is_empty());
    assert!(
        sink.final_text(Channel::Answer)
            .contains("```mermaid\ngraph TD;A-->B"),
        "literal source stays visible"
    );
}

/// Stop shortly after a 500-character burst: only what the drain ticks
/// already released stays visible, plus the stop marker; the rest of the
/// burst is discarded and no callback fires after stop returns.
#[tokio::test(start_paused = true)]
async fn scenario_stop_discards_undrained_burst() {
    let burst: String = "x".repeat(500);
    let opener = MockOpener::new(vec![Ok(vec![
        (0, delta_event(&burst)),
        // Keeps the connection open so the stream does not end on its own.
        (60_000, done_event()),
    ])]);
    let engine = MockEngine::new();
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, engine, Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    tokio::time::sleep(Duration::from_millis(130)).await;
    pipe.stop(&mut handle).await;

    let stop_marker = Config::default().stop_marker().to_string();
    let final_text = sink.final_text(Channel::Answer);
    let shown = final_text
        .strip_suffix(stop_marker.as_str())
        .expect("stop marker appended");
    assert!(!shown.is_empty(), "some drained characters stay visible");
    assert!(
        shown.len() < 500,
        "undrained characters are discarded, got {} chars",
        shown.len()
    );

    // Nothing fires after stop, no matter how much time passes.
    let events_after_stop = sink.events().len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sink.events().len(), events_after_stop);
}

/// A layout call that resolves after stop is dropped: no diagram state
/// change reaches the sink.
#[tokio::test(start_paused = true)]
async fn scenario_late_layout_result_dropped_after_stop() {
    let opener = MockOpener::new(vec![Ok(vec![
        (0, delta_event("```mermaid\ngraph TD;A-->B\n```\n")),
        (60_000, done_event()),
    ])]);
    let engine = MockEngine::slow(5_000);
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, Arc::clone(&engine), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    // Enough ticks to commit the whole block, close the span and start the
    // render, but well before the 5s layout resolves.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.sources().len(), 1, "render should be in flight");

    pipe.stop(&mut handle).await;
    let events_after_stop = sink.events().len();

    // The slow layout resolves well after stop; its result must vanish.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sink.events().len(), events_after_stop);
    let events = sink.diagram_events();
    assert!(
        !events
            .iter()
            .any(|(_, s)| matches!(s, DiagramState::Rendered { .. })),
        "late render must not be applied: {events:?}"
    );
}

/// An engine failure on a complete-looking source degrades to a failed
/// state carrying the literal source, never a hung placeholder.
#[tokio::test(start_paused = true)]
async fn scenario_layout_failure_degrades_to_source_with_error() {
    let opener = MockOpener::new(vec![Ok(vec![
        (0, delta_event("```mermaid\ngraph TD;A-->B\n```\n")),
        (10, done_event()),
    ])]);
    let engine = MockEngine::failing("unsupported node shape");
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, engine, Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    let events = sink.diagram_events();
    assert!(
        matches!(
            events.last(),
            Some((_, DiagramState::Failed { source, message }))
                if source == "graph TD;A-->B" && message == "unsupported node shape"
        ),
        "expected failed resolution: {events:?}"
    );
}

/// Transport failures retry with backoff up to the bound, then surface a
/// terminal error appended to the transcript.
#[tokio::test(start_paused = true)]
async fn scenario_terminal_error_after_bounded_retries() {
    let opener = MockOpener::new(vec![
        Err(PipelineError::transport("connection refused")),
        Err(PipelineError::transport("connection refused")),
        Err(PipelineError::transport("connection refused")),
        Err(PipelineError::transport("connection refused")),
    ]);
    let sink = RecordingSink::new();
    let mut pipe = pipeline(Arc::clone(&opener), MockEngine::new(), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    assert_eq!(opener.open_count(), 4, "initial attempt plus three retries");
    let final_text = sink.final_text(Channel::Answer);
    assert!(
        final_text.contains("*error: connection refused*"),
        "terminal error must be visible in the transcript: {final_text:?}"
    );
}

/// Reasoning and answer deltas render to separate channels without
/// interleaving corruption.
#[tokio::test(start_paused = true)]
async fn scenario_reasoning_and_answer_channels_stay_separate() {
    let opener = MockOpener::new(vec![Ok(vec![
        (0, reasoning_event("Let me think. ")),
        (20, reasoning_event("Edges first.")),
        (20, delta_event("Here is the graph.")),
        (10, done_event()),
    ])]);
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, MockEngine::new(), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    assert_eq!(
        sink.final_text(Channel::Reasoning),
        "Let me think. Edges first."
    );
    assert_eq!(sink.final_text(Channel::Answer), "Here is the graph.");
    assert_append_only(&sink.channel_updates(Channel::Reasoning));
    assert_append_only(&sink.channel_updates(Channel::Answer));
}

/// The token meter only ever ticks upward while text streams in.
#[tokio::test(start_paused = true)]
async fn scenario_token_meter_monotonic() {
    let opener = MockOpener::new(vec![Ok(vec![
        (0, delta_event("The quick brown fox ")),
        (30, delta_event("jumps over the lazy dog. ")),
        (30, delta_event("Repeatedly, 42 times.")),
        (10, done_event()),
    ])]);
    let sink = RecordingSink::new();
    let mut pipe = pipeline(opener, MockEngine::new(), Arc::clone(&sink));

    let mut handle = pipe.begin_stream(payload());
    handle.wait().await;

    let counts: Vec<u32> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SinkEvent::Usage(u) => Some(u.completion_tokens),
            _ => None,
        })
        .collect();
    assert!(!counts.is_empty());
    for pair in counts.windows(2) {
        assert!(pair[1] >= pair[0], "token meter decreased: {counts:?}");
    }
    assert_eq!(
        *counts.last().unwrap(),
        Pipeline::estimate_tokens(&sink.final_text(Channel::Answer))
    );
}
