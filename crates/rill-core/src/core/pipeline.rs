//! The stream coordinator.
//!
//! One task per session drives everything: a network reader feeds parsed
//! deltas through a channel, a drain ticker paces the cadence buffer, the
//! structure tracker classifies each newly committed span, completed
//! diagram spans go to the render queue, and layout results come back on
//! their own channel. Cancellation interrupts any of those arms.
//!
//! No component here is process-global: engine, queue, cache, buffer and
//! session are constructed per pipeline and torn down with it, so several
//! sessions can coexist and tests run without shared state.

use std::sync::Arc;

use futures_util::StreamExt;
use rill_types::{
    Channel, DiagramState, ErrorKind, JobId, PipelineError, PipelineResult, RenderedGraphic,
    RequestPayload, TokenUsage,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::session::{SessionController, StreamSession};
use crate::config::Config;
use crate::render::cadence::CadenceBuffer;
use crate::render::diagram::{DiagramEngine, DiagramQueue, QueueAction};
use crate::render::structure::StructureTracker;
use crate::stream::StreamOpener;
use crate::stream::ingest::{DeltaUpdate, IngestOutcome, StreamIngestor};
use crate::stream::retry::{RetryPolicy, RetryState};
use crate::stream::sse::SseParser;
use crate::tokens;

/// Bound on the reader-to-coordinator channel. Deltas arrive far faster
/// than they are rendered during bursts; this bound applies backpressure
/// to the reader instead of growing without limit.
const UPSTREAM_CHANNEL_CAPACITY: usize = 1024;

/// UI commit sink. Implementations receive the authoritative full text per
/// channel (never a diff) so the UI cannot diverge from the pipeline.
pub trait UiSink: Send + Sync + 'static {
    fn on_channel_update(&self, channel: Channel, full_text: &str);
    fn on_diagram_state_change(&self, job: &JobId, state: &DiagramState);
    /// Heuristic token meter update. Optional; defaults to a no-op.
    fn on_token_usage(&self, usage: TokenUsage) {
        let _ = usage;
    }
}

/// Messages from the network reader to the coordinator.
#[derive(Debug)]
enum UpstreamMsg {
    Delta(DeltaUpdate),
    Completed,
    Terminal(PipelineError),
}

/// Handle to one in-flight stream.
pub struct SessionHandle {
    session: StreamSession,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Waits for the coordinator task to finish (natural end or stop).
    pub async fn wait(&mut self) {
        let _ = (&mut self.task).await;
    }
}

/// The streaming render pipeline.
pub struct Pipeline {
    config: Config,
    opener: Arc<dyn StreamOpener>,
    engine: Arc<dyn DiagramEngine>,
    sink: Arc<dyn UiSink>,
    controller: SessionController,
}

impl Pipeline {
    pub fn new(
        config: Config,
        opener: Arc<dyn StreamOpener>,
        engine: Arc<dyn DiagramEngine>,
        sink: Arc<dyn UiSink>,
    ) -> Self {
        Self {
            config,
            opener,
            engine,
            sink,
            controller: SessionController::new(),
        }
    }

    /// Starts streaming one request. A still-active prior session is
    /// implicitly cancelled.
    pub fn begin_stream(&mut self, payload: RequestPayload) -> SessionHandle {
        let session = self.controller.start();
        tracing::info!(session = %session.id(), model = %payload.model, "stream started");

        let (upstream_tx, upstream_rx) = mpsc::channel(UPSTREAM_CHANNEL_CAPACITY);
        let (layout_tx, layout_rx) = mpsc::channel(16);

        tokio::spawn(read_upstream(
            Arc::clone(&self.opener),
            payload,
            RetryPolicy::from_config(&self.config.retry),
            self.config.retry.inactivity_timeout(),
            session.cancellation_token(),
            upstream_tx,
        ));

        let coordinator = Coordinator {
            session: session.clone(),
            config: self.config.clone(),
            sink: Arc::clone(&self.sink),
            engine: Arc::clone(&self.engine),
            cadence: CadenceBuffer::new(self.config.cadence.clone()),
            tracker: StructureTracker::new(),
            diagrams: DiagramQueue::new(self.config.diagram.clone()),
            layout_tx,
            last_token_count: 0,
        };
        let task = tokio::spawn(run_stream(coordinator, upstream_rx, layout_rx));

        SessionHandle { session, task }
    }

    /// Stops a stream: aborts the network read, discards undisplayed
    /// characters, appends the stop marker, and waits until no further
    /// callbacks can fire.
    pub async fn stop(&mut self, handle: &mut SessionHandle) {
        tracing::info!(session = %handle.session.id(), "stream stopped by user");
        self.controller.stop(&handle.session);
        handle.wait().await;
    }

    pub fn is_cancelled(&self, handle: &SessionHandle) -> bool {
        self.controller.is_cancelled(&handle.session)
    }

    /// Heuristic token estimate for the UI meter.
    pub fn estimate_tokens(text: &str) -> u32 {
        tokens::estimate(text)
    }
}

struct Coordinator {
    session: StreamSession,
    config: Config,
    sink: Arc<dyn UiSink>,
    engine: Arc<dyn DiagramEngine>,
    cadence: CadenceBuffer,
    tracker: StructureTracker,
    diagrams: DiagramQueue,
    layout_tx: mpsc::Sender<(JobId, PipelineResult<RenderedGraphic>)>,
    last_token_count: u32,
}

impl Coordinator {
    /// Publishes committed text for the given channels, re-classifying the
    /// answer channel and enqueueing any diagram span that closed.
    fn commit_channels(&mut self, channels: &[Channel]) {
        for &channel in channels {
            if channel == Channel::Answer {
                let closed = self.tracker.observe(self.cadence.committed(Channel::Answer));
                for span in &closed {
                    if span.is_diagram() && span.delimited {
                        let id =
                            self.diagrams
                                .enqueue(&span.body, span.complete, Instant::now());
                        self.sink.on_diagram_state_change(&id, &DiagramState::Queued);
                    }
                }
            }

            self.sink
                .on_channel_update(channel, self.cadence.committed(channel));

            if channel == Channel::Answer {
                let count = tokens::estimate(self.cadence.committed(Channel::Answer));
                if count != self.last_token_count {
                    self.last_token_count = count;
                    self.sink.on_token_usage(TokenUsage::completion(count));
                }
            }
        }
    }

    /// Graceful end of stream: flush every queued character, then
    /// force-close whatever span is still open. A diagram span that never
    /// saw its closing fence stays literal source and gets no job.
    fn finish_stream(&mut self) {
        let updated = self.cadence.flush_all();
        self.commit_channels(&updated);

        let closed = self.tracker.finish(self.cadence.committed(Channel::Answer));
        for span in &closed {
            if span.is_diagram() && span.delimited {
                let id = self
                    .diagrams
                    .enqueue(&span.body, span.complete, Instant::now());
                self.sink.on_diagram_state_change(&id, &DiagramState::Queued);
            }
        }
    }

    /// Terminal transport failure: whatever was received stays visible,
    /// with a user-visible error appended to the transcript.
    fn fail_stream(&mut self, error: &PipelineError) {
        tracing::error!(session = %self.session.id(), error = %error, "stream failed");
        self.finish_stream();
        let marker = format!("\n\n*error: {}*", error.message);
        self.cadence.append_committed(Channel::Answer, &marker);
        self.sink
            .on_channel_update(Channel::Answer, self.cadence.committed(Channel::Answer));
    }

    /// Hard stop: discard undisplayed characters, abandon queued diagram
    /// jobs, and close the answer channel with the stop marker. This is
    /// the final commit for the session; nothing may fire after it.
    fn handle_stop(&mut self) {
        self.cadence.stop();
        let abandoned = self.diagrams.clear_queued();
        if !abandoned.is_empty() {
            tracing::debug!(count = abandoned.len(), "abandoned queued diagram jobs");
        }
        let marker = self.config.stop_marker().to_string();
        self.cadence.append_committed(Channel::Answer, &marker);
        self.sink
            .on_channel_update(Channel::Answer, self.cadence.committed(Channel::Answer));
    }

    /// Drives the diagram queue: starts renders, publishes resolutions.
    fn pump_diagrams(&mut self) {
        let now = Instant::now();
        while let Some(action) = self.diagrams.next_action(now) {
            match action {
                QueueAction::Start(req) => {
                    self.sink
                        .on_diagram_state_change(&req.id, &DiagramState::Rendering);
                    let tx = self.layout_tx.clone();
                    let id = req.id;
                    let fut = self.engine.layout(req.source, req.theme);
                    tokio::spawn(async move {
                        let result = fut.await;
                        let _ = tx.send((id, result)).await;
                    });
                }
                QueueAction::Resolved(res) => {
                    self.sink.on_diagram_state_change(&res.id, &res.state);
                }
            }
        }
    }
}

async fn run_stream(
    mut co: Coordinator,
    mut upstream_rx: mpsc::Receiver<UpstreamMsg>,
    mut layout_rx: mpsc::Receiver<(JobId, PipelineResult<RenderedGraphic>)>,
) {
    let session = co.session.clone();
    let mut ticker = tokio::time::interval(co.config.cadence.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut upstream_open = true;

    loop {
        tokio::select! {
            biased;
            () = session.cancelled() => {
                co.handle_stop();
                return;
            }
            _ = ticker.tick() => {
                let report = co.cadence.drain_tick();
                for channel in &report.stalled {
                    tracing::warn!(%channel, "cadence buffer stalled; emergency release");
                }
                co.commit_channels(&report.updated);
            }
            Some((id, result)) = layout_rx.recv() => {
                if let Some(res) = co.diagrams.on_render_result(&id, result) {
                    co.sink.on_diagram_state_change(&res.id, &res.state);
                }
            }
            maybe = upstream_rx.recv(), if upstream_open => {
                match maybe {
                    Some(UpstreamMsg::Delta(delta)) => {
                        if let Some(reasoning) = &delta.reasoning {
                            co.cadence.push(Channel::Reasoning, reasoning);
                        }
                        if let Some(content) = &delta.content {
                            co.cadence.push(Channel::Answer, content);
                        }
                    }
                    Some(UpstreamMsg::Completed) | None => {
                        upstream_open = false;
                        co.finish_stream();
                    }
                    Some(UpstreamMsg::Terminal(error)) => {
                        upstream_open = false;
                        co.fail_stream(&error);
                    }
                }
            }
        }

        co.pump_diagrams();

        if !upstream_open && co.cadence.is_drained() && !co.diagrams.has_pending_work() {
            tracing::debug!(session = %session.id(), "stream session complete");
            return;
        }
    }
}

/// Network half: opens the stream, frames and parses events, and feeds
/// deltas to the coordinator. Owns the reconnect policy; the inactivity
/// deadline is re-armed only by genuine progress (a delta), never by
/// keepalives or scheduling activity.
async fn read_upstream(
    opener: Arc<dyn StreamOpener>,
    payload: RequestPayload,
    policy: RetryPolicy,
    inactivity: std::time::Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<UpstreamMsg>,
) {
    let mut retry = RetryState::new();
    let mut ingestor = StreamIngestor::new();

    'connect: loop {
        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            result = opener.open(payload.clone()) => result,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                match retry.next_backoff(&policy) {
                    Some(backoff) => {
                        tracing::warn!(error = %e, attempt = retry.attempts(), "stream open failed; retrying");
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(backoff) => {}
                        }
                        continue 'connect;
                    }
                    None => {
                        let _ = tx.send(UpstreamMsg::Terminal(e)).await;
                        return;
                    }
                }
            }
        };

        let mut parser = SseParser::new(stream);
        let mut deadline = Instant::now() + inactivity;

        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep_until(deadline) => {
                    match retry.next_backoff(&policy) {
                        Some(backoff) => {
                            tracing::warn!(attempt = retry.attempts(), "stream inactive; reconnecting");
                            tokio::select! {
                                () = cancel.cancelled() => return,
                                () = tokio::time::sleep(backoff) => {}
                            }
                            continue 'connect;
                        }
                        None => {
                            let _ = tx
                                .send(UpstreamMsg::Terminal(PipelineError::transport(
                                    "no stream progress; retries exhausted",
                                )))
                                .await;
                            return;
                        }
                    }
                }
                item = parser.next() => item,
            };

            match item {
                Some(Ok(event)) => match ingestor.apply(&event) {
                    IngestOutcome::Delta(delta) => {
                        deadline = Instant::now() + inactivity;
                        if tx.send(UpstreamMsg::Delta(delta)).await.is_err() {
                            return;
                        }
                    }
                    IngestOutcome::Finished => {
                        let _ = tx.send(UpstreamMsg::Completed).await;
                        return;
                    }
                    IngestOutcome::Skipped => {}
                },
                Some(Err(e)) if e.kind == ErrorKind::Parse => {
                    // One undecodable event is skipped, like malformed JSON.
                    tracing::warn!(error = %e, "skipping unparseable stream event");
                }
                Some(Err(e)) if e.is_cancelled() => return,
                Some(Err(e)) => match retry.next_backoff(&policy) {
                    Some(backoff) => {
                        tracing::warn!(error = %e, attempt = retry.attempts(), "stream read failed; retrying");
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(backoff) => {}
                        }
                        continue 'connect;
                    }
                    None => {
                        let _ = tx.send(UpstreamMsg::Terminal(e)).await;
                        return;
                    }
                },
                None => {
                    let _ = tx.send(UpstreamMsg::Completed).await;
                    return;
                }
            }
        }
    }
}
