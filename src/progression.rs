// Bracket progression: settle a bracket match, move the winner and loser
// along their pointers, and keep resolving byes until nothing is left.
//
// Each settlement is one transaction. Bye cascades run through an explicit
// queue rather than recursion so a single confirm touches a bounded,
// logged number of matches.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqliteConnection;

use crate::db::matches;
use crate::db::tournament as store;
use crate::db::{finish, Database, MatchRecord};
use crate::error::MatchError;
use crate::metrics;
use crate::models::{MatchRef, Slot};
use crate::notify::{self, NotificationSink, Notice, ThreadRequest};

/// Upper bound on settlements per drain. A bracket of 2n matches can never
/// need more, so hitting it means a broken link graph.
const MAX_STEPS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Result { match_id: i64, winner: i64, loser: i64 },
    Bye { match_id: i64 },
}

impl Step {
    fn match_id(self) -> i64 {
        match self {
            Step::Result { match_id, .. } | Step::Bye { match_id } => match_id,
        }
    }
}

#[derive(Debug, Default)]
struct Applied {
    next_byes: Vec<i64>,
    round_closed: bool,
    /// Set when this settlement finished the grand final.
    champion: Option<Option<i64>>,
}

/// Summary of one progression run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Advance {
    pub settled: Vec<i64>,
    pub byes_resolved: usize,
    pub rounds_closed: usize,
    pub threads_opened: usize,
    pub competition_completed: bool,
    pub champion_id: Option<i64>,
}

pub struct Progression {
    db: Arc<Database>,
    sink: Arc<dyn NotificationSink>,
}

impl Progression {
    pub fn new(db: Arc<Database>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { db, sink }
    }

    /// Settle a reported bracket match (reported -> completed) and advance.
    /// `record` is the report being confirmed; a different stored report at
    /// write time is a concurrent modification.
    pub async fn settle_result(&self, record: &MatchRecord) -> Result<Advance, MatchError> {
        let MatchRef::Tournament(match_id) = record.match_ref else {
            return Err(MatchError::WrongState("outside a bracket".into()));
        };
        let (Some(winner), Some(loser)) = (record.winner_id(), record.loser_id()) else {
            return Err(MatchError::WrongState("unreported".into()));
        };
        let step = Step::Result {
            match_id,
            winner,
            loser,
        };
        let mut advance = self
            .drain(record.scope_id, VecDeque::from([step]), Some(record))
            .await?;
        self.after_drain(record.scope_id, &mut advance).await;
        Ok(advance)
    }

    /// Settle every ready bye in a competition.
    pub async fn resolve_byes(&self, competition_id: i64) -> Result<Advance, MatchError> {
        let steps = self.pending_byes(competition_id).await?;
        let mut advance = self.drain(competition_id, steps, None).await?;
        self.after_drain(competition_id, &mut advance).await;
        Ok(advance)
    }

    /// Create a thread for every ready match between two players that has
    /// none yet. Returns how many threads were opened.
    pub async fn open_threads(&self, competition_id: i64) -> Result<usize, MatchError> {
        let ready = self.db.ready_matches_without_thread(competition_id).await?;
        let mut opened = 0;
        for m in ready {
            let r = MatchRef::Tournament(m.id);
            let participants: Vec<i64> = [m.player1_id, m.player2_id].into_iter().flatten().collect();
            let request = ThreadRequest {
                match_ref: r,
                name: format!("{} - Match {}", m.round_label, m.position + 1),
                participants,
            };
            let Some(thread) = notify::ensure_thread(&self.db, self.sink.as_ref(), &request).await?
            else {
                continue;
            };
            opened += 1;
            let notice = Notice::MatchOpened {
                match_ref: r,
                label: m.round_label.clone(),
                player1_id: m.player1_id,
                player2_id: m.player2_id,
            };
            if let Err(e) = self.sink.post(&thread, &notice).await {
                tracing::warn!("Failed to announce {r} in {thread}: {e}");
            }
        }
        if opened > 0 {
            tracing::info!("Opened {opened} match threads for competition {competition_id}");
        }
        Ok(opened)
    }

    async fn pending_byes(&self, competition_id: i64) -> Result<VecDeque<Step>, MatchError> {
        let mut conn = self.db.pool().acquire().await?;
        let ids = store::ready_byes(&mut conn, competition_id).await?;
        Ok(ids.into_iter().map(|match_id| Step::Bye { match_id }).collect())
    }

    /// Apply queued settlements until the queue and every stray bye are gone.
    ///
    /// With `expected`, the first step settles that report and its failure is
    /// returned. Any other failure is logged and stops the drain; the ready
    /// byes it left behind are picked up by the next `resolve_byes`.
    async fn drain(
        &self,
        competition_id: i64,
        mut queue: VecDeque<Step>,
        expected: Option<&MatchRecord>,
    ) -> Result<Advance, MatchError> {
        let mut advance = Advance::default();
        let mut first = expected.is_some();
        let mut processed = 0;

        loop {
            let mut closed_since_scan = false;
            while let Some(step) = queue.pop_front() {
                processed += 1;
                if processed > MAX_STEPS {
                    tracing::error!(
                        "Bracket progression for competition {competition_id} exceeded {MAX_STEPS} steps; stopping"
                    );
                    return Ok(advance);
                }

                let check = if first { expected } else { None };
                let applied = match self.settle_step(competition_id, step, check).await {
                    Ok(applied) => applied,
                    Err(e) if first => return Err(e),
                    Err(e) => {
                        tracing::error!(
                            "Bracket progression for competition {competition_id} stopped at match {}: {e}; \
                             left for the next bye sweep",
                            step.match_id()
                        );
                        return Ok(advance);
                    }
                };

                let Some(applied) = applied else {
                    if first {
                        return Err(MatchError::ConcurrentModification);
                    }
                    tracing::debug!("Match {} already settled, skipping", step.match_id());
                    continue;
                };
                first = false;

                advance.settled.push(step.match_id());
                if let Step::Bye { match_id } = step {
                    advance.byes_resolved += 1;
                    metrics::BYES_RESOLVED_TOTAL.inc();
                    tracing::info!("Resolved bye in tournament match #{match_id}");
                }
                queue.extend(
                    applied
                        .next_byes
                        .into_iter()
                        .map(|match_id| Step::Bye { match_id }),
                );
                if applied.round_closed {
                    advance.rounds_closed += 1;
                    closed_since_scan = true;
                }
                if let Some(champion) = applied.champion {
                    advance.competition_completed = true;
                    advance.champion_id = champion;
                }
            }

            if !closed_since_scan {
                break;
            }
            queue = match self.pending_byes(competition_id).await {
                Ok(queue) => queue,
                Err(e) => {
                    tracing::error!("Scanning byes of competition {competition_id} failed: {e}");
                    break;
                }
            };
            if queue.is_empty() {
                break;
            }
        }
        Ok(advance)
    }

    async fn settle_step(
        &self,
        competition_id: i64,
        step: Step,
        expected: Option<&MatchRecord>,
    ) -> Result<Option<Applied>, MatchError> {
        let mut tx = self.db.begin().await?;
        let result = apply_step(&mut tx, competition_id, step, expected).await;
        finish(tx, result, "bracket progression").await
    }

    /// Side effects once the drain has committed. Failures are logged only.
    async fn after_drain(&self, competition_id: i64, advance: &mut Advance) {
        if advance.rounds_closed > 0 {
            match self.open_threads(competition_id).await {
                Ok(n) => advance.threads_opened = n,
                Err(e) => tracing::warn!("Opening threads for competition {competition_id} failed: {e}"),
            }
        }
        if advance.competition_completed {
            tracing::info!(
                "Competition {competition_id} completed, champion {:?}",
                advance.champion_id
            );
            let notice = Notice::TournamentCompleted {
                competition_id,
                champion_id: advance.champion_id,
            };
            notify::alert_admins(self.sink.as_ref(), &notice).await;
        }
    }
}

/// One settlement: complete the match, feed both pointers, and report any
/// bye this made ready. `None` when the match was no longer in the expected
/// state.
async fn apply_step(
    conn: &mut SqliteConnection,
    competition_id: i64,
    step: Step,
    expected: Option<&MatchRecord>,
) -> Result<Option<Applied>, MatchError> {
    let id = step.match_id();
    let m = match step {
        Step::Result { winner, .. } => {
            // Write first so the row cannot change under the checks below
            if !store::complete_bracket_match(conn, id, "reported", Some(winner)).await? {
                return Ok(None);
            }
            if let Some(expected) = expected {
                if !matches::report_unchanged(conn, expected).await? {
                    return Err(MatchError::ConcurrentModification);
                }
            }
            store::fetch_tournament_match(conn, id)
                .await?
                .ok_or(MatchError::NotFound)?
        }
        Step::Bye { .. } => {
            let m = store::fetch_tournament_match(conn, id)
                .await?
                .ok_or(MatchError::NotFound)?;
            if !m.is_bye() {
                return Ok(None);
            }
            let advancing = m.player1_id.or(m.player2_id);
            if !store::complete_bracket_match(conn, id, "scheduled", advancing).await? {
                return Ok(None);
            }
            m
        }
    };
    let (winner, loser) = match step {
        Step::Result { winner, loser, .. } => (Some(winner), Some(loser)),
        Step::Bye { .. } => (m.player1_id.or(m.player2_id), None),
    };

    let mut applied = Applied::default();
    let mut touched = Vec::with_capacity(2);

    match (m.next_match_win, m.next_match_win_slot.and_then(Slot::from_i32)) {
        (Some(next), Some(slot)) => {
            store::fill_slot(conn, next, slot, winner).await?;
            touched.push(next);
        }
        _ => {
            // Only the grand final has nowhere to send its winner
            store::set_competition_status(conn, competition_id, "active", "completed").await?;
            applied.champion = Some(winner);
        }
    }

    match (m.next_match_loss, m.next_match_loss_slot.and_then(Slot::from_i32)) {
        (Some(next), Some(slot)) => {
            store::fill_slot(conn, next, slot, loser).await?;
            touched.push(next);
        }
        _ => {
            if let Some(loser) = loser {
                store::eliminate_participant(conn, competition_id, loser).await?;
            }
        }
    }

    for next in touched {
        if let Some(target) = store::fetch_tournament_match(conn, next).await? {
            if target.status == "scheduled" && target.is_bye() {
                applied.next_byes.push(next);
            }
        }
    }

    applied.round_closed = store::round_complete(conn, competition_id, m.round, &m.bracket_side).await?;
    Ok(Some(applied))
}
