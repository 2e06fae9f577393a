// Ladder matchmaking queue. Players wait for an opponent within a rating
// window that widens the longer they wait.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::db::{Database, LadderMatch};
use crate::metrics;
use crate::models::MatchRef;
use crate::notify::{self, NotificationSink, Notice, ThreadRequest};

/// A player waiting for a ladder opponent.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub player_id: i64,
    pub ladder_id: i64,
    pub rating: i32,
    pub queued_at: Instant,
}

/// Two queued players matched against each other.
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    pub ladder_id: i64,
    pub player1_id: i64,
    pub player2_id: i64,
}

/// Status of the matchmaking queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub position: Option<usize>,
}

/// Wait after which two players are paired regardless of rating.
pub const FALLBACK_WAIT: Duration = Duration::from_secs(300);

/// Allowed rating gap for an entry that has waited `wait`.
pub fn rating_window(wait: Duration) -> i32 {
    if wait >= Duration::from_secs(300) {
        300
    } else if wait >= Duration::from_secs(120) {
        150
    } else {
        50
    }
}

/// Thread-safe FIFO matchmaking queue.
#[derive(Debug, Clone)]
pub struct MatchmakingQueue {
    inner: Arc<Mutex<VecDeque<QueueEntry>>>,
}

impl MatchmakingQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Add a player to the back of the queue. False when the player is
    /// already waiting in that ladder.
    pub fn enqueue(&self, player_id: i64, ladder_id: i64, rating: i32) -> bool {
        let mut queue = self.inner.lock().unwrap();
        if queue
            .iter()
            .any(|e| e.player_id == player_id && e.ladder_id == ladder_id)
        {
            return false;
        }
        queue.push_back(QueueEntry {
            player_id,
            ladder_id,
            rating,
            queued_at: Instant::now(),
        });
        metrics::MATCHMAKING_QUEUE_DEPTH.set(queue.len() as i64);
        true
    }

    /// Take a player out of the queue.
    pub fn remove(&self, player_id: i64, ladder_id: i64) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let before = queue.len();
        queue.retain(|e| !(e.player_id == player_id && e.ladder_id == ladder_id));
        metrics::MATCHMAKING_QUEUE_DEPTH.set(queue.len() as i64);
        queue.len() != before
    }

    /// Get the current queue depth.
    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn status(&self, player_id: i64, ladder_id: i64) -> QueueStatus {
        let queue = self.inner.lock().unwrap();
        QueueStatus {
            depth: queue.len(),
            position: queue
                .iter()
                .position(|e| e.player_id == player_id && e.ladder_id == ladder_id),
        }
    }

    /// Every compatible pair in the order they should be tried. Earlier
    /// entries get the first pick. Two entries are compatible when their gap
    /// fits the window of whichever has waited longer; once both have waited
    /// `FALLBACK_WAIT` they are compatible regardless of rating, after every
    /// in-window partner.
    pub fn candidates(&self, now: Instant) -> Vec<Pairing> {
        let queue = self.inner.lock().unwrap();
        let waited = |e: &QueueEntry| now.saturating_duration_since(e.queued_at) >= FALLBACK_WAIT;
        let mut pairs = Vec::new();
        for (i, a) in queue.iter().enumerate() {
            let rivals: Vec<&QueueEntry> = queue
                .iter()
                .skip(i + 1)
                .filter(|b| b.ladder_id == a.ladder_id)
                .collect();
            let (within, outside): (Vec<&QueueEntry>, Vec<&QueueEntry>) =
                rivals.into_iter().partition(|b| {
                    let wait = now.saturating_duration_since(a.queued_at.min(b.queued_at));
                    (a.rating - b.rating).abs() <= rating_window(wait)
                });
            let fallback = outside.into_iter().filter(|b| waited(a) && waited(*b));
            pairs.extend(within.into_iter().chain(fallback).map(|b| Pairing {
                ladder_id: a.ladder_id,
                player1_id: a.player_id,
                player2_id: b.player_id,
            }));
        }
        pairs
    }

    /// Take both players of `pairing` out of the queue. False, leaving the
    /// queue untouched, when either has already left.
    pub fn claim(&self, pairing: &Pairing) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let waiting = |player_id: i64| {
            queue
                .iter()
                .any(|e| e.player_id == player_id && e.ladder_id == pairing.ladder_id)
        };
        if !waiting(pairing.player1_id) || !waiting(pairing.player2_id) {
            return false;
        }
        queue.retain(|e| {
            e.ladder_id != pairing.ladder_id
                || (e.player_id != pairing.player1_id && e.player_id != pairing.player2_id)
        });
        metrics::MATCHMAKING_QUEUE_DEPTH.set(queue.len() as i64);
        true
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for MatchmakingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a ladder match, open its thread and announce it there.
pub async fn open_ladder_match(
    db: &Database,
    sink: &dyn NotificationSink,
    ladder_id: i64,
    player1_id: i64,
    player2_id: i64,
) -> Result<LadderMatch, sqlx::Error> {
    let created = db.create_ladder_match(ladder_id, player1_id, player2_id).await?;
    let r = MatchRef::Ladder(created.id);

    let request = ThreadRequest {
        match_ref: r,
        name: format!("Ladder Match #{}", created.id),
        participants: vec![player1_id, player2_id],
    };
    if let Some(thread) = notify::ensure_thread(db, sink, &request).await? {
        let notice = Notice::MatchOpened {
            match_ref: r,
            label: "Ladder".to_string(),
            player1_id: Some(player1_id),
            player2_id: Some(player2_id),
        };
        if let Err(e) = sink.post(&thread, &notice).await {
            tracing::warn!("Failed to announce {r} in {thread}: {e}");
        }
    }
    Ok(created)
}

/// Claim the first candidate pair that has not reached its ladder's daily
/// per-opponent limit. Pairs at the limit stay queued.
pub async fn next_pairing(
    db: &Database,
    queue: &MatchmakingQueue,
    now: Instant,
) -> Result<Option<Pairing>, sqlx::Error> {
    for pairing in queue.candidates(now) {
        if db
            .daily_limit_reached(pairing.ladder_id, pairing.player1_id, pairing.player2_id)
            .await?
        {
            tracing::debug!(
                "Players {} and {} reached today's limit in ladder {}",
                pairing.player1_id,
                pairing.player2_id,
                pairing.ladder_id
            );
            continue;
        }
        if queue.claim(&pairing) {
            return Ok(Some(pairing));
        }
    }
    Ok(None)
}

/// Turn a pairing into a ladder match.
pub async fn start_pairing(
    db: &Database,
    sink: &dyn NotificationSink,
    pairing: &Pairing,
) -> Result<MatchRef, sqlx::Error> {
    let created = open_ladder_match(
        db,
        sink,
        pairing.ladder_id,
        pairing.player1_id,
        pairing.player2_id,
    )
    .await?;
    let r = MatchRef::Ladder(created.id);
    metrics::MATCHMAKING_PAIRS_TOTAL.inc();
    tracing::info!(
        "Matched players {} and {} in ladder {} as {r}",
        pairing.player1_id,
        pairing.player2_id,
        pairing.ladder_id
    );
    Ok(r)
}

/// Spawn a background task that pairs queued players every `poll`.
pub fn spawn_matchmaking_worker(
    db: Arc<Database>,
    sink: Arc<dyn NotificationSink>,
    queue: MatchmakingQueue,
    poll: Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(poll).await;

            loop {
                let pairing = match next_pairing(&db, &queue, Instant::now()).await {
                    Ok(Some(pairing)) => pairing,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Matchmaking worker: failed to check pairings: {e}");
                        break;
                    }
                };
                if let Err(e) = start_pairing(&db, sink.as_ref(), &pairing).await {
                    tracing::error!("Matchmaking worker: failed to create match: {e}");
                }
            }
        }
    });
}
