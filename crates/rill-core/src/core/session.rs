//! Stream session lifecycle and cooperative cancellation.
//!
//! One session covers one request/response cycle. Cancellation is
//! cooperative: the token is signalled, in-flight async work stops at its
//! next yield point, and every component checks the token before
//! committing further UI updates rather than assuming the abort took
//! effect synchronously.

use chrono::{DateTime, Utc};
use rill_types::SessionId;
use tokio_util::sync::CancellationToken;

/// One active request/response cycle.
#[derive(Debug, Clone)]
pub struct StreamSession {
    id: SessionId,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl StreamSession {
    fn new() -> Self {
        Self {
            id: SessionId(uuid::Uuid::new_v4().to_string()),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signals cancellation; actual teardown happens at yield points.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the session is cancelled. Used in `select!` arms.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Owns the single in-flight session per chat turn.
#[derive(Debug, Default)]
pub struct SessionController {
    active: Option<StreamSession>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new session. A still-active prior session is implicitly
    /// cancelled, which guards against double-send.
    pub fn start(&mut self) -> StreamSession {
        if let Some(prev) = self.active.take() {
            if !prev.is_cancelled() {
                tracing::debug!(session = %prev.id(), "cancelling superseded session");
                prev.cancel();
            }
        }
        let session = StreamSession::new();
        self.active = Some(session.clone());
        session
    }

    /// Stops a session: flips the cancellation flag and releases the
    /// active slot if this session still holds it.
    pub fn stop(&mut self, session: &StreamSession) {
        session.cancel();
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.id() == session.id())
        {
            self.active = None;
        }
    }

    pub fn is_cancelled(&self, session: &StreamSession) -> bool {
        session.is_cancelled()
    }

    pub fn active(&self) -> Option<&StreamSession> {
        self.active.as_ref()
    }
}
