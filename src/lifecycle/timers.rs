// Auto-confirm timers, one per reported match.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::MatchLifecycle;
use crate::metrics;
use crate::models::MatchRef;
use crate::notify::{self, Notice};

struct Armed {
    token: u64,
    handle: JoinHandle<()>,
}

/// Armed timers keyed by match. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct ConfirmTimers {
    inner: Arc<Mutex<HashMap<MatchRef, Armed>>>,
    next_token: Arc<AtomicU64>,
}

impl ConfirmTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer for `r`. It posts a reminder every `tick`
    /// and auto-confirms once `delay` has passed.
    pub(crate) fn schedule(
        &self,
        lifecycle: &Arc<MatchLifecycle>,
        r: MatchRef,
        delay: Duration,
        tick: Duration,
    ) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(lifecycle);
        let timers = self.clone();

        // Held while spawning so the task cannot forget itself before it is stored
        let mut armed = self.inner.lock().unwrap();
        let handle = tokio::spawn(run_timer(weak, timers, r, token, delay, tick));
        if let Some(previous) = armed.insert(r, Armed { token, handle }) {
            previous.handle.abort();
        } else {
            metrics::AUTO_CONFIRM_TIMERS_ACTIVE.inc();
        }
        tracing::debug!("Auto-confirm armed for {r} in {}s", delay.as_secs());
    }

    /// Abort the timer for `r`, if any.
    pub fn cancel(&self, r: MatchRef) -> bool {
        let removed = self.inner.lock().unwrap().remove(&r);
        match removed {
            Some(armed) => {
                armed.handle.abort();
                metrics::AUTO_CONFIRM_TIMERS_ACTIVE.dec();
                tracing::debug!("Auto-confirm cancelled for {r}");
                true
            }
            None => false,
        }
    }

    /// Drop the entry without aborting, only if it still belongs to `token`.
    fn forget(&self, r: MatchRef, token: u64) {
        let mut armed = self.inner.lock().unwrap();
        if armed.get(&r).is_some_and(|a| a.token == token) {
            armed.remove(&r);
            metrics::AUTO_CONFIRM_TIMERS_ACTIVE.dec();
        }
    }

    pub fn is_armed(&self, r: MatchRef) -> bool {
        self.inner.lock().unwrap().contains_key(&r)
    }

    pub fn armed_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Abort every timer (shutdown).
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.inner.lock().unwrap().drain().collect();
        for (_, armed) in drained {
            armed.handle.abort();
            metrics::AUTO_CONFIRM_TIMERS_ACTIVE.dec();
        }
    }
}

async fn run_timer(
    lifecycle: Weak<MatchLifecycle>,
    timers: ConfirmTimers,
    r: MatchRef,
    token: u64,
    delay: Duration,
    tick: Duration,
) {
    let deadline = Instant::now() + delay;
    let tick = tick.max(Duration::from_millis(1));

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(remaining.min(tick)).await;

        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        let Some(lc) = lifecycle.upgrade() else {
            return;
        };
        tracing::debug!("Auto-confirm tick for {r}: {}s left", left.as_secs());
        let notice = Notice::AwaitingConfirmation {
            match_ref: r,
            remaining_secs: left.as_secs(),
        };
        notify::post_to_match(&lc.db, lc.sink.as_ref(), r, &notice).await;
    }

    // Leave the table first: confirm cancels timers and must not abort this task
    timers.forget(r, token);
    let Some(lc) = lifecycle.upgrade() else {
        return;
    };
    match lc.auto_confirm(r).await {
        Ok(Some(_)) => tracing::info!("Auto-confirmed {r}"),
        Ok(None) => tracing::debug!("Auto-confirm for {r} skipped, match moved on"),
        Err(e) => tracing::warn!("Auto-confirm for {r} failed: {e}"),
    }
}
