// Notification side channel: the trait the chat layer implements, the
// notices the core emits, and two sinks (tracing and in-memory).
//
// Notices are sent after the owning transaction commits. A failing sink is
// logged and never rolls back or fails the operation that produced it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::db::Database;
use crate::metrics;
use crate::models::{ConfirmSource, MatchRef, RatingChange, ThreadHandle};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("thread creation failed: {0}")]
    ThreadCreation(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// What the sink needs to open a match thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadRequest {
    #[serde(rename = "match")]
    pub match_ref: MatchRef,
    pub name: String,
    pub participants: Vec<i64>,
}

/// Structured events for the chat layer to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    MatchOpened {
        #[serde(rename = "match")]
        match_ref: MatchRef,
        label: String,
        player1_id: Option<i64>,
        player2_id: Option<i64>,
    },
    ResultReported {
        #[serde(rename = "match")]
        match_ref: MatchRef,
        reported_by: String,
        /// Player awaited for confirmation.
        opponent_id: Option<i64>,
        player1_score: i32,
        player2_score: i32,
        tiebreak1: Option<i32>,
        tiebreak2: Option<i32>,
        auto_confirm_secs: u64,
    },
    AwaitingConfirmation {
        #[serde(rename = "match")]
        match_ref: MatchRef,
        remaining_secs: u64,
    },
    ResultConfirmed {
        #[serde(rename = "match")]
        match_ref: MatchRef,
        #[serde(flatten)]
        source: ConfirmSource,
        winner_id: Option<i64>,
        changes: Vec<RatingChange>,
    },
    DisputeOpened {
        #[serde(rename = "match")]
        match_ref: MatchRef,
        dispute_id: i64,
        raised_by: String,
        reason: String,
        evidence: Option<String>,
    },
    DisputeResolved {
        #[serde(rename = "match")]
        match_ref: MatchRef,
        resolved_by: String,
        notes: String,
    },
    MatchCancelled {
        #[serde(rename = "match")]
        match_ref: MatchRef,
        cancelled_by: String,
    },
    TournamentCompleted {
        competition_id: i64,
        champion_id: Option<i64>,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create_thread(&self, request: &ThreadRequest) -> Result<ThreadHandle, NotifyError>;

    async fn post(&self, thread: &ThreadHandle, notice: &Notice) -> Result<(), NotifyError>;

    async fn notify_admins(&self, notice: &Notice) -> Result<(), NotifyError>;
}

// ── Sinks ─────────────────────────────────────────────────────────────

/// Sink that writes every notice to the log. Thread handles are sequential.
#[derive(Debug, Default)]
pub struct LogSink {
    next_thread: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn create_thread(&self, request: &ThreadRequest) -> Result<ThreadHandle, NotifyError> {
        let n = self.next_thread.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ThreadHandle(format!("thread-{n}"));
        tracing::info!(thread = %handle, "Opened thread '{}' for {}", request.name, request.match_ref);
        Ok(handle)
    }

    async fn post(&self, thread: &ThreadHandle, notice: &Notice) -> Result<(), NotifyError> {
        let body = serde_json::to_string(notice).map_err(|e| NotifyError::Delivery(e.to_string()))?;
        tracing::info!(thread = %thread, "{body}");
        Ok(())
    }

    async fn notify_admins(&self, notice: &Notice) -> Result<(), NotifyError> {
        let body = serde_json::to_string(notice).map_err(|e| NotifyError::Delivery(e.to_string()))?;
        tracing::info!(target: "admins", "{body}");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    threads: Vec<(ThreadHandle, ThreadRequest)>,
    posts: Vec<(ThreadHandle, Notice)>,
    admin: Vec<Notice>,
    fail_threads: bool,
}

/// Sink that records everything it receives. Used when embedding the core
/// without a chat platform, and by tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_thread` fail until switched back.
    pub fn set_fail_threads(&self, fail: bool) {
        self.state.lock().unwrap().fail_threads = fail;
    }

    pub fn threads(&self) -> Vec<(ThreadHandle, ThreadRequest)> {
        self.state.lock().unwrap().threads.clone()
    }

    pub fn posts(&self) -> Vec<(ThreadHandle, Notice)> {
        self.state.lock().unwrap().posts.clone()
    }

    pub fn admin_notices(&self) -> Vec<Notice> {
        self.state.lock().unwrap().admin.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn create_thread(&self, request: &ThreadRequest) -> Result<ThreadHandle, NotifyError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_threads {
            return Err(NotifyError::ThreadCreation("thread creation disabled".into()));
        }
        let handle = ThreadHandle(format!("mem-{}", state.threads.len() + 1));
        state.threads.push((handle.clone(), request.clone()));
        Ok(handle)
    }

    async fn post(&self, thread: &ThreadHandle, notice: &Notice) -> Result<(), NotifyError> {
        self.state
            .lock()
            .unwrap()
            .posts
            .push((thread.clone(), notice.clone()));
        Ok(())
    }

    async fn notify_admins(&self, notice: &Notice) -> Result<(), NotifyError> {
        self.state.lock().unwrap().admin.push(notice.clone());
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Return the thread of a match, creating it at most once.
///
/// The registry row is claimed before the sink is called. A claim held by
/// someone else yields `None`; a failed creation releases the claim so a
/// later attempt can retry.
pub async fn ensure_thread(
    db: &Database,
    sink: &dyn NotificationSink,
    request: &ThreadRequest,
) -> Result<Option<ThreadHandle>, sqlx::Error> {
    let r = request.match_ref;
    if let Some(existing) = db.thread_for_match(r).await? {
        return Ok(Some(existing));
    }
    if !db.claim_thread(r).await? {
        tracing::debug!("Thread for {r} already claimed");
        return Ok(None);
    }
    match sink.create_thread(request).await {
        Ok(handle) => {
            db.attach_thread(r, &handle).await?;
            metrics::THREADS_CREATED_TOTAL.inc();
            Ok(Some(handle))
        }
        Err(e) => {
            tracing::warn!("Could not create thread for {r}: {e}");
            db.release_thread_claim(r).await?;
            Ok(None)
        }
    }
}

/// Post a notice into the match thread, if one exists.
pub async fn post_to_match(db: &Database, sink: &dyn NotificationSink, r: MatchRef, notice: &Notice) {
    let thread = match db.thread_for_match(r).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            tracing::debug!("No thread registered for {r}, notice dropped");
            return;
        }
        Err(e) => {
            tracing::warn!("Thread lookup failed for {r}: {e}");
            return;
        }
    };
    if let Err(e) = sink.post(&thread, notice).await {
        tracing::warn!("Failed to post to thread {thread} for {r}: {e}");
    }
}

/// Send a notice to the admin channel, logging failures.
pub async fn alert_admins(sink: &dyn NotificationSink, notice: &Notice) {
    if let Err(e) = sink.notify_admins(notice).await {
        tracing::warn!("Failed to notify admins: {e}");
    }
}
