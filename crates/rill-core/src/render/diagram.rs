//! Diagram render queue and cache.
//!
//! Layout is expensive and throws on incomplete input, so completed (or
//! deadline-forced) diagram sources go through a queue that renders off
//! the critical path: one job at a time while text is still streaming,
//! the rest drained once the stream ends. A content-addressed LRU cache
//! sits in front of the engine; theme toggles re-submit every visible
//! diagram, and the cache turns those into free lookups.
//!
//! Every job carries an absolute deadline. Whatever happens to the stream
//! or the engine, no placeholder outlives `must_render_by`: a job that
//! cannot be rendered by then resolves to its literal source text.

use std::collections::{HashMap, VecDeque};

use futures_util::future::BoxFuture;
use rill_types::{DiagramState, JobId, PipelineResult, RenderedGraphic};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::structure::{best_effort_repair, is_structurally_complete};
use crate::config::DiagramConfig;

/// Layout capability: asynchronous, may fail on hostile input.
pub trait DiagramEngine: Send + Sync + 'static {
    fn layout(
        &self,
        source: String,
        theme: String,
    ) -> BoxFuture<'static, PipelineResult<RenderedGraphic>>;
}

/// A cached render outcome. Failures are cached too: re-submitting a source
/// the engine already rejected must not re-run layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedRender {
    Graphic(RenderedGraphic),
    Failed(String),
}

/// LRU-bounded cache of rendered diagrams keyed by normalized source and
/// theme. Inserts are keyed and idempotent; the last writer for a key may
/// overwrite with an equivalent result.
#[derive(Debug)]
pub struct RenderCache {
    capacity: usize,
    entries: HashMap<String, CachedRender>,
    order: VecDeque<String>,
}

impl RenderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    pub fn get(&mut self, key: &str) -> Option<CachedRender> {
        if self.entries.contains_key(key) {
            self.touch(key);
            self.entries.get(key).cloned()
        } else {
            None
        }
    }

    pub fn insert(&mut self, key: String, value: CachedRender) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.entries.remove(&old);
                }
            }
        } else {
            self.touch(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache key: sha256 over the normalized source and the theme.
pub fn cache_key(source: &str, theme: &str) -> String {
    let normalized = normalize_source(source);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(theme.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize_source(source: &str) -> String {
    source.replace("\r\n", "\n").trim().to_string()
}

/// One diagram render job.
#[derive(Debug)]
pub struct DiagramJob {
    pub id: JobId,
    pub source_text: String,
    /// Source after best-effort repair; rendered in forced mode.
    pub fixed_source_text: String,
    pub enqueued_at: Instant,
    /// Immutable once set; the only authority that can force the job out
    /// of `Queued` early.
    pub must_render_by: Instant,
    pub state: DiagramState,
    structurally_complete: bool,
    forced: bool,
}

/// Work the coordinator should perform next.
#[derive(Debug)]
pub enum QueueAction {
    /// Spawn the layout engine for this job.
    Start(RenderRequest),
    /// The job resolved without touching the engine (cache hit or forced
    /// source display).
    Resolved(JobResolution),
}

#[derive(Debug)]
pub struct RenderRequest {
    pub id: JobId,
    pub source: String,
    pub theme: String,
    pub forced: bool,
}

/// A terminal (or `Rendering`) state transition to report to the UI. The
/// busy indicator is cleared exactly once, on the first terminal
/// resolution; replays return nothing.
#[derive(Debug)]
pub struct JobResolution {
    pub id: JobId,
    pub state: DiagramState,
}

#[derive(Debug)]
pub struct DiagramQueue {
    config: DiagramConfig,
    jobs: Vec<DiagramJob>,
    /// Ids still waiting to start, in enqueue order.
    pending: VecDeque<JobId>,
    rendering: Option<JobId>,
    cache: RenderCache,
}

impl DiagramQueue {
    pub fn new(config: DiagramConfig) -> Self {
        let cache = RenderCache::new(config.cache_capacity);
        Self {
            config,
            jobs: Vec::new(),
            pending: VecDeque::new(),
            rendering: None,
            cache,
        }
    }

    pub fn job(&self, id: &JobId) -> Option<&DiagramJob> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    fn job_mut(&mut self, id: &JobId) -> Option<&mut DiagramJob> {
        self.jobs.iter_mut().find(|j| &j.id == id)
    }

    /// Earliest deadline among jobs still waiting to start.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter_map(|id| self.job(id))
            .map(|j| j.must_render_by)
            .min()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.pending.is_empty() || self.rendering.is_some()
    }

    /// Accepts a completed-or-forced diagram source. Called once per
    /// closed span.
    pub fn enqueue(&mut self, source_text: &str, complete: bool, now: Instant) -> JobId {
        let id = JobId(uuid::Uuid::new_v4().to_string());
        let source_text = source_text.trim_end();
        let job = DiagramJob {
            id: id.clone(),
            source_text: source_text.to_string(),
            fixed_source_text: best_effort_repair(source_text),
            enqueued_at: now,
            must_render_by: now + self.config.render_deadline(),
            state: DiagramState::Queued,
            structurally_complete: complete,
            forced: false,
        };
        tracing::debug!(job = %job.id, complete, "diagram job enqueued");
        self.jobs.push(job);
        self.pending.push_back(id.clone());
        id
    }

    /// Decides the next unit of work, if any. Deadline-expired jobs are
    /// promoted ahead of normally-scheduled ones.
    pub fn next_action(&mut self, now: Instant) -> Option<QueueAction> {
        // Deadline pass first: a job whose budget ran out is pulled to the
        // front regardless of queue order. Mid-render jobs are left alone.
        if let Some(pos) = self
            .pending
            .iter()
            .position(|id| self.job(id).is_some_and(|j| now >= j.must_render_by))
        {
            let id = self.pending.remove(pos).expect("position just found");
            return Some(self.force(&id));
        }

        if self.rendering.is_some() {
            return None;
        }

        // Normal pass: first job that is renderable right now. Sources
        // still failing the completeness heuristic keep waiting for their
        // deadline without blocking jobs behind them.
        let theme = self.config.theme.clone();
        let pos = self.pending.iter().position(|id| {
            self.job(id)
                .is_some_and(|j| j.structurally_complete)
        })?;
        let id = self.pending.remove(pos).expect("position just found");

        let (key, source) = {
            let job = self.job(&id).expect("pending job exists");
            (cache_key(&job.source_text, &theme), job.source_text.clone())
        };
        if let Some(cached) = self.cache.get(&key) {
            let state = match cached {
                CachedRender::Graphic(graphic) => DiagramState::Rendered { graphic },
                CachedRender::Failed(message) => DiagramState::Failed { source, message },
            };
            return self.resolve(&id, state).map(QueueAction::Resolved);
        }

        let source = {
            let job = self.job_mut(&id).expect("pending job exists");
            job.state = DiagramState::Rendering;
            job.source_text.clone()
        };
        self.rendering = Some(id.clone());
        Some(QueueAction::Start(RenderRequest {
            id,
            source,
            theme,
            forced: false,
        }))
    }

    /// Forced path for a job whose deadline passed while queued: repair is
    /// attempted, a now-complete source still gets a real render, anything
    /// else resolves to literal source display.
    fn force(&mut self, id: &JobId) -> QueueAction {
        let theme = self.config.theme.clone();
        let job = self.job_mut(id).expect("forced job exists");
        job.forced = true;

        if is_structurally_complete(&job.fixed_source_text) {
            let key = cache_key(&job.fixed_source_text, &theme);
            let source = job.fixed_source_text.clone();
            if let Some(cached) = self.cache.get(&key) {
                let state = match cached {
                    CachedRender::Graphic(graphic) => DiagramState::Rendered { graphic },
                    CachedRender::Failed(message) => DiagramState::Failed { source, message },
                };
                return QueueAction::Resolved(
                    self.resolve(id, state).expect("job not yet terminal"),
                );
            }
            let job = self.job_mut(id).expect("forced job exists");
            job.state = DiagramState::Rendering;
            self.rendering = Some(id.clone());
            return QueueAction::Start(RenderRequest {
                id: id.clone(),
                source,
                theme,
                forced: true,
            });
        }

        tracing::warn!(
            job = %id,
            kind = %rill_types::ErrorKind::StructuralTimeout,
            "diagram deadline passed with incomplete source"
        );
        let source = job.source_text.clone();
        QueueAction::Resolved(
            self.resolve(id, DiagramState::ForcedSource { source })
                .expect("job not yet terminal"),
        )
    }

    /// Applies an engine result. The outcome is cached under the source
    /// that was actually rendered.
    pub fn on_render_result(
        &mut self,
        id: &JobId,
        result: PipelineResult<RenderedGraphic>,
    ) -> Option<JobResolution> {
        if self.rendering.as_ref() == Some(id) {
            self.rendering = None;
        }
        let job = self.job(id)?;
        let rendered_source = if job.forced {
            job.fixed_source_text.clone()
        } else {
            job.source_text.clone()
        };
        let key = cache_key(&rendered_source, &self.config.theme);

        match result {
            Ok(graphic) => {
                self.cache
                    .insert(key, CachedRender::Graphic(graphic.clone()));
                self.resolve(id, DiagramState::Rendered { graphic })
            }
            Err(e) => {
                tracing::warn!(job = %id, error = %e, "diagram layout failed");
                self.cache.insert(key, CachedRender::Failed(e.message.clone()));
                self.resolve(
                    id,
                    DiagramState::Failed {
                        source: rendered_source,
                        message: e.message,
                    },
                )
            }
        }
    }

    /// Abandons queued-but-not-started jobs (hard cancellation). Mid-render
    /// jobs are left to resolve; the coordinator drops their results.
    pub fn clear_queued(&mut self) -> Vec<JobId> {
        self.pending.drain(..).collect()
    }

    /// Moves a job to a terminal state, exactly once.
    fn resolve(&mut self, id: &JobId, state: DiagramState) -> Option<JobResolution> {
        let job = self.job_mut(id)?;
        if job.state.is_terminal() {
            // Late or duplicate resolution: the indicator was already
            // cleared, nothing further may fire.
            return None;
        }
        job.state = state.clone();
        Some(JobResolution {
            id: id.clone(),
            state,
        })
    }
}
