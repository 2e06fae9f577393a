// Match lifecycle state machine: report, dispute, resolve, and restart
// recovery. Confirmation and admin undo live in `confirm`.
//
// Every transition is a conditional update on the expected status, so two
// commands racing on the same match cannot both succeed. Notifications go
// out only after the owning transaction has committed.

pub mod confirm;
mod stats;
pub mod timers;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::db::matches::{self as store, RecordedScore};
use crate::db::{finish, Database, Dispute, MatchRecord};
use crate::error::MatchError;
use crate::metrics;
use crate::models::{MatchRef, MatchStatus, ThreadHandle};
use crate::notify::{self, NotificationSink, Notice};
use crate::progression::Progression;

pub use confirm::Confirmation;
pub use timers::ConfirmTimers;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleConfig {
    /// How long a reported result waits before it confirms itself.
    pub auto_confirm: Duration,
    /// Interval between reminder posts while waiting.
    pub tick: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auto_confirm: Duration::from_secs(300),
            tick: Duration::from_secs(60),
        }
    }
}

/// A result as typed by the reporter: their own score first. Values above
/// `u16::MAX` are rejected when the request is deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScoreReport {
    pub your_score: u16,
    pub opponent_score: u16,
    #[serde(default)]
    pub your_tiebreak: Option<u16>,
    #[serde(default)]
    pub opponent_tiebreak: Option<u16>,
}

/// Caller identity resolved against the player and admin tables.
#[derive(Debug, Clone)]
pub(crate) struct Actor {
    pub discord_id: String,
    pub player_id: Option<i64>,
    pub is_admin: bool,
}

impl Actor {
    fn plays_in(&self, record: &MatchRecord) -> bool {
        self.player_id.is_some_and(|p| record.is_participant(p))
    }
}

/// Outcome of the start-up sweep over reported matches and active brackets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Recovery {
    pub confirmed: usize,
    pub rearmed: usize,
    /// Ready byes an interrupted progression had left behind.
    pub byes_resolved: usize,
    pub threads_opened: usize,
}

pub struct MatchLifecycle {
    pub(crate) db: Arc<Database>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    progression: Progression,
    timers: ConfirmTimers,
    config: LifecycleConfig,
}

impl MatchLifecycle {
    pub fn new(
        db: Arc<Database>,
        sink: Arc<dyn NotificationSink>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        let progression = Progression::new(db.clone(), sink.clone());
        Arc::new(Self {
            db,
            sink,
            progression,
            timers: ConfirmTimers::new(),
            config,
        })
    }

    pub fn timers(&self) -> &ConfirmTimers {
        &self.timers
    }

    pub fn config(&self) -> LifecycleConfig {
        self.config
    }

    /// Map a chat thread to its match through the registry.
    pub async fn resolve_thread(&self, thread: &ThreadHandle) -> Result<MatchRef, MatchError> {
        self.db
            .lookup_match_by_thread(thread)
            .await?
            .ok_or(MatchError::NotFound)
    }

    pub(crate) async fn load(&self, r: MatchRef) -> Result<MatchRecord, MatchError> {
        self.db.get_match_record(r).await?.ok_or(MatchError::NotFound)
    }

    pub(crate) async fn actor(&self, discord_id: &str) -> Result<Actor, MatchError> {
        let player = self.db.resolve_player(discord_id).await?;
        let is_admin = self.db.is_admin(discord_id).await?;
        if player.is_none() && !is_admin {
            return Err(MatchError::NotRegistered);
        }
        Ok(Actor {
            discord_id: discord_id.to_string(),
            player_id: player.map(|p| p.id),
            is_admin,
        })
    }

    pub(crate) async fn require_admin(&self, discord_id: &str) -> Result<(), MatchError> {
        if self.db.is_admin(discord_id).await? {
            Ok(())
        } else {
            Err(MatchError::Unauthorized)
        }
    }

    // ── Report ───────────────────────────────────────────────────────

    /// Record a result for an open match and arm the auto-confirm timer.
    pub async fn report_result(
        self: &Arc<Self>,
        r: MatchRef,
        reporter: &str,
        report: ScoreReport,
    ) -> Result<MatchRecord, MatchError> {
        let record = self.load(r).await?;
        match record.status {
            MatchStatus::Open => {}
            MatchStatus::Disputed => return Err(MatchError::Disputed),
            other => return Err(wrong_state(r, other)),
        }
        if record.has_bye || record.player1_id.is_none() || record.player2_id.is_none() {
            return Err(MatchError::WrongState("awaiting an opponent".into()));
        }

        let actor = self.actor(reporter).await?;
        let score = orient_score(&record, &actor, report)?;

        if !self.db.record_report(r, score, &actor.discord_id).await? {
            let current = self.load(r).await?;
            return Err(match current.status {
                MatchStatus::Disputed => MatchError::Disputed,
                other => wrong_state(r, other),
            });
        }

        metrics::MATCHES_REPORTED_TOTAL
            .with_label_values(&[r.kind().as_str()])
            .inc();
        tracing::info!(
            "{r} reported {}-{} by {}",
            score.player1,
            score.player2,
            actor.discord_id
        );

        self.timers
            .schedule(self, r, self.config.auto_confirm, self.config.tick);

        let opponent_id = match actor.player_id {
            Some(p) if record.player1_id == Some(p) => record.player2_id,
            Some(p) if record.player2_id == Some(p) => record.player1_id,
            _ => None,
        };
        let notice = Notice::ResultReported {
            match_ref: r,
            reported_by: actor.discord_id.clone(),
            opponent_id,
            player1_score: score.player1,
            player2_score: score.player2,
            tiebreak1: score.tiebreak1,
            tiebreak2: score.tiebreak2,
            auto_confirm_secs: self.config.auto_confirm.as_secs(),
        };
        notify::post_to_match(&self.db, self.sink.as_ref(), r, &notice).await;

        self.load(r).await
    }

    // ── Disputes ─────────────────────────────────────────────────────

    /// Flag an open or reported match for admin review.
    pub async fn open_dispute(
        &self,
        r: MatchRef,
        raiser: &str,
        reason: &str,
        evidence: Option<&str>,
    ) -> Result<Dispute, MatchError> {
        let record = self.load(r).await?;
        let actor = self.actor(raiser).await?;
        if !actor.plays_in(&record) {
            return Err(MatchError::NotParticipant);
        }
        let from = match record.status {
            MatchStatus::Open | MatchStatus::Reported => record.status,
            MatchStatus::Disputed => return Err(MatchError::Disputed),
            MatchStatus::Settled => return Err(MatchError::AlreadyConfirmed),
            other => return Err(wrong_state(r, other)),
        };

        let mut tx = self.db.begin().await?;
        let result: Result<Dispute, MatchError> = async {
            if !store::transition(&mut tx, r, from, MatchStatus::Disputed).await? {
                return Err(MatchError::ConcurrentModification);
            }
            Ok(store::insert_dispute(&mut tx, r, &actor.discord_id, reason, evidence).await?)
        }
        .await;
        let dispute = match finish(tx, result, "open dispute").await {
            Err(MatchError::ConcurrentModification) => return Err(self.conflict(r).await),
            other => other?,
        };

        self.timers.cancel(r);
        metrics::DISPUTES_OPENED_TOTAL.inc();
        tracing::info!("{r} disputed by {}: {reason}", actor.discord_id);

        let notice = Notice::DisputeOpened {
            match_ref: r,
            dispute_id: dispute.id,
            raised_by: actor.discord_id.clone(),
            reason: reason.to_string(),
            evidence: evidence.map(str::to_string),
        };
        notify::post_to_match(&self.db, self.sink.as_ref(), r, &notice).await;
        notify::alert_admins(self.sink.as_ref(), &notice).await;

        Ok(dispute)
    }

    /// Close a dispute and reopen the match so it can be reported again.
    pub async fn resolve_dispute(
        &self,
        r: MatchRef,
        admin: &str,
        notes: &str,
    ) -> Result<MatchRecord, MatchError> {
        self.require_admin(admin).await?;
        let record = self.load(r).await?;
        if record.status != MatchStatus::Disputed {
            return Err(wrong_state(r, record.status));
        }

        let mut tx = self.db.begin().await?;
        let result: Result<(), MatchError> = async {
            store::resolve_disputes(&mut tx, r, admin, notes).await?;
            if !store::reopen(&mut tx, r).await? {
                return Err(MatchError::ConcurrentModification);
            }
            store::insert_admin_action(&mut tx, admin, "resolve_dispute", r, notes).await?;
            Ok(())
        }
        .await;
        match finish(tx, result, "resolve dispute").await {
            Err(MatchError::ConcurrentModification) => return Err(self.conflict(r).await),
            other => other?,
        }

        metrics::DISPUTES_RESOLVED_TOTAL.inc();
        tracing::info!("{r} dispute resolved by admin {admin}");

        let notice = Notice::DisputeResolved {
            match_ref: r,
            resolved_by: admin.to_string(),
            notes: notes.to_string(),
        };
        notify::post_to_match(&self.db, self.sink.as_ref(), r, &notice).await;

        self.load(r).await
    }

    // ── Recovery ─────────────────────────────────────────────────────

    /// Start-up sweep: confirm every reported match whose window has passed,
    /// re-arm timers for the rest, then settle stranded byes and open missing
    /// threads in every active bracket.
    pub async fn recover_pending_confirmations(self: &Arc<Self>) -> Result<Recovery, MatchError> {
        let mut recovery = Recovery::default();
        let now = chrono::Utc::now().naive_utc();

        for record in self.db.list_reported().await? {
            let r = record.match_ref;
            let elapsed = record
                .reported_at
                .as_deref()
                .and_then(|s| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
                .and_then(|at| (now - at).to_std().ok())
                .unwrap_or(Duration::ZERO);

            if elapsed >= self.config.auto_confirm {
                match self.auto_confirm(r).await {
                    Ok(Some(_)) => recovery.confirmed += 1,
                    Ok(None) => {}
                    Err(e) => tracing::error!("Recovery confirm of {r} failed: {e}"),
                }
            } else {
                self.timers.schedule(
                    self,
                    r,
                    self.config.auto_confirm - elapsed,
                    self.config.tick,
                );
                recovery.rearmed += 1;
            }
        }

        for competition in self.db.list_competitions_with_status("active").await? {
            let id = competition.id;
            match self.progression.resolve_byes(id).await {
                Ok(advance) => {
                    recovery.byes_resolved += advance.byes_resolved;
                    recovery.threads_opened += advance.threads_opened;
                }
                Err(e) => tracing::error!("Recovery bye sweep of competition {id} failed: {e}"),
            }
            match self.progression.open_threads(id).await {
                Ok(opened) => recovery.threads_opened += opened,
                Err(e) => tracing::error!("Recovery thread sweep of competition {id} failed: {e}"),
            }
        }

        tracing::info!(
            "Recovered pending confirmations: {} confirmed, {} re-armed, {} byes resolved, {} threads opened",
            recovery.confirmed,
            recovery.rearmed,
            recovery.byes_resolved,
            recovery.threads_opened
        );
        Ok(recovery)
    }

    /// Re-read a match after a lost conditional update and describe why.
    pub(crate) async fn conflict(&self, r: MatchRef) -> MatchError {
        match self.load(r).await {
            Ok(current) => match current.status {
                MatchStatus::Disputed => MatchError::Disputed,
                MatchStatus::Settled => MatchError::AlreadyConfirmed,
                // A different report is waiting now
                MatchStatus::Reported => MatchError::ConcurrentModification,
                other => wrong_state(r, other),
            },
            Err(e) => e,
        }
    }
}

pub(crate) fn wrong_state(r: MatchRef, status: MatchStatus) -> MatchError {
    MatchError::WrongState(status.as_db_str(r.kind()).to_string())
}

/// Validate a report and turn it into player1/player2 order.
///
/// Participants report from their own perspective; an admin reports in
/// player1/player2 order. A level score needs two different tie-breaks,
/// which are dropped when the main score already decides the match.
pub(crate) fn orient_score(
    record: &MatchRecord,
    actor: &Actor,
    report: ScoreReport,
) -> Result<RecordedScore, MatchError> {
    let as_player2 = match actor.player_id {
        Some(p) if record.player1_id == Some(p) => false,
        Some(p) if record.player2_id == Some(p) => true,
        _ if actor.is_admin => false,
        _ => return Err(MatchError::NotParticipant),
    };

    let mine = i32::from(report.your_score);
    let theirs = i32::from(report.opponent_score);
    let (tb_mine, tb_theirs) = if mine == theirs {
        match (report.your_tiebreak, report.opponent_tiebreak) {
            (Some(a), Some(b)) if a == b => return Err(MatchError::TieBreakInvalid),
            (Some(a), Some(b)) => (Some(i32::from(a)), Some(i32::from(b))),
            _ => return Err(MatchError::DrawRejected),
        }
    } else {
        (None, None)
    };

    Ok(if as_player2 {
        RecordedScore {
            player1: theirs,
            player2: mine,
            tiebreak1: tb_theirs,
            tiebreak2: tb_mine,
        }
    } else {
        RecordedScore {
            player1: mine,
            player2: theirs,
            tiebreak1: tb_mine,
            tiebreak2: tb_theirs,
        }
    })
}
