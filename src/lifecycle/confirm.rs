// Confirmation (manual or automatic) and the admin undo of a confirmed
// ladder result.

use serde::Serialize;
use sqlx::SqliteConnection;

use super::stats::{self, PlayerResult};
use super::{wrong_state, MatchLifecycle};
use crate::db::ladder as ratings;
use crate::db::matches as store;
use crate::db::{finish, MatchRecord, PlayerRating};
use crate::elo::{self, Outcome};
use crate::error::MatchError;
use crate::metrics;
use crate::models::{ConfirmSource, MatchRef, MatchStatus, RatingChange};
use crate::notify::{self, Notice};
use crate::progression::Advance;

/// What a successful confirmation changed.
#[derive(Debug, Clone, Serialize)]
pub struct Confirmation {
    #[serde(rename = "match")]
    pub record: MatchRecord,
    #[serde(flatten)]
    pub source: ConfirmSource,
    pub winner_id: Option<i64>,
    /// Rating changes, ladder matches only.
    pub changes: Vec<RatingChange>,
    /// Bracket progression, tournament matches only.
    pub advance: Option<Advance>,
}

impl MatchLifecycle {
    /// Confirm a reported result on behalf of the opponent or an admin.
    pub async fn confirm_result(
        &self,
        r: MatchRef,
        confirmer: &str,
    ) -> Result<Confirmation, MatchError> {
        let record = self.load(r).await?;
        match record.status {
            MatchStatus::Reported => {}
            MatchStatus::Settled => return Err(MatchError::AlreadyConfirmed),
            MatchStatus::Disputed => return Err(MatchError::Disputed),
            other => return Err(wrong_state(r, other)),
        }

        let actor = self.actor(confirmer).await?;
        let plays = actor.plays_in(&record);
        let reported_it = record.reported_by.as_deref() == Some(actor.discord_id.as_str());
        if !actor.is_admin {
            if !plays {
                return Err(MatchError::NotParticipant);
            }
            if reported_it {
                return Err(MatchError::Unauthorized);
            }
        }

        let source = ConfirmSource::Manual {
            confirmer: actor.discord_id,
        };
        self.settle(record, source).await
    }

    /// Timer path. `None` when the match is no longer waiting for confirmation.
    pub async fn auto_confirm(&self, r: MatchRef) -> Result<Option<Confirmation>, MatchError> {
        let record = self.load(r).await?;
        if record.status != MatchStatus::Reported {
            return Ok(None);
        }
        match self.settle(record, ConfirmSource::Auto).await {
            Ok(confirmation) => Ok(Some(confirmation)),
            Err(
                MatchError::ConcurrentModification
                | MatchError::AlreadyConfirmed
                | MatchError::Disputed
                | MatchError::WrongState(_),
            ) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn settle(
        &self,
        record: MatchRecord,
        source: ConfirmSource,
    ) -> Result<Confirmation, MatchError> {
        let r = record.match_ref;
        let settled = match r {
            MatchRef::Ladder(_) => {
                let mut tx = self.db.begin().await?;
                let result = apply_ladder_result(&mut tx, &record).await;
                finish(tx, result, "confirm").await.map(|changes| (changes, None))
            }
            MatchRef::Tournament(_) => self
                .progression
                .settle_result(&record)
                .await
                .map(|advance| (Vec::new(), Some(advance))),
        };
        let (changes, advance) = match settled {
            Err(MatchError::ConcurrentModification) => return Err(self.conflict(r).await),
            other => other?,
        };

        self.timers.cancel(r);
        metrics::MATCHES_CONFIRMED_TOTAL
            .with_label_values(&[r.kind().as_str(), source.label()])
            .inc();

        let winner_id = record.winner_id();
        tracing::info!("{r} confirmed ({}), winner {winner_id:?}", source.label());

        let notice = Notice::ResultConfirmed {
            match_ref: r,
            source: source.clone(),
            winner_id,
            changes: changes.clone(),
        };
        notify::post_to_match(&self.db, self.sink.as_ref(), r, &notice).await;

        let record = self.load(r).await?;
        Ok(Confirmation {
            record,
            source,
            winner_id,
            changes,
            advance,
        })
    }

    /// Admin undo of a confirmed ladder match: ratings and stats go back to
    /// their recorded pre-match values and the match becomes cancelled.
    pub async fn cancel_match(&self, r: MatchRef, admin: &str) -> Result<MatchRecord, MatchError> {
        self.require_admin(admin).await?;
        if !matches!(r, MatchRef::Ladder(_)) {
            return Err(MatchError::WrongState("part of a tournament bracket".into()));
        }
        let record = self.load(r).await?;
        if record.status != MatchStatus::Settled {
            return Err(wrong_state(r, record.status));
        }

        let mut tx = self.db.begin().await?;
        let result = revert_ladder_result(&mut tx, &record, admin).await;
        match finish(tx, result, "cancel").await {
            Err(MatchError::ConcurrentModification) => return Err(self.conflict(r).await),
            other => other?,
        }

        metrics::MATCHES_CANCELLED_TOTAL.inc();
        tracing::info!("{r} cancelled by admin {admin}");

        let notice = Notice::MatchCancelled {
            match_ref: r,
            cancelled_by: admin.to_string(),
        };
        notify::post_to_match(&self.db, self.sink.as_ref(), r, &notice).await;

        self.load(r).await
    }
}

/// Both players' side of the result, player one first.
fn player_results(record: &MatchRecord) -> Result<(PlayerResult, PlayerResult), MatchError> {
    let (Some(s1), Some(s2)) = (record.player1_score, record.player2_score) else {
        return Err(MatchError::WrongState("unreported".into()));
    };
    let outcome = match record.winner_id() {
        Some(w) if record.player1_id == Some(w) => Outcome::Win,
        Some(_) => Outcome::Loss,
        None => Outcome::Draw,
    };
    Ok((
        PlayerResult {
            outcome,
            goals_for: s1,
            goals_against: s2,
        },
        PlayerResult {
            outcome: outcome.reversed(),
            goals_for: s2,
            goals_against: s1,
        },
    ))
}

fn players(record: &MatchRecord) -> Result<(i64, i64), MatchError> {
    match (record.player1_id, record.player2_id) {
        (Some(p1), Some(p2)) => Ok((p1, p2)),
        _ => Err(MatchError::WrongState("missing a player".into())),
    }
}

async fn load_rating(
    conn: &mut SqliteConnection,
    player_id: i64,
    ladder_id: i64,
) -> Result<PlayerRating, MatchError> {
    ratings::ensure_rating(conn, player_id, ladder_id).await?;
    ratings::fetch_rating(conn, player_id, ladder_id)
        .await?
        .ok_or(MatchError::NotFound)
}

/// reported -> confirmed plus both rating updates and history rows, all on
/// one connection inside the caller's transaction. The stored report must
/// still be the one in `record`.
async fn apply_ladder_result(
    conn: &mut SqliteConnection,
    record: &MatchRecord,
) -> Result<Vec<RatingChange>, MatchError> {
    let r = record.match_ref;
    if !store::transition(conn, r, MatchStatus::Reported, MatchStatus::Settled).await? {
        return Err(MatchError::ConcurrentModification);
    }
    // Disputed, reopened and reported again since `record` was loaded
    if !store::report_unchanged(conn, record).await? {
        return Err(MatchError::ConcurrentModification);
    }

    let (p1, p2) = players(record)?;
    let (res1, res2) = player_results(record)?;
    let ladder_id = record.scope_id;
    let goal_diff = (res1.goals_for - res1.goals_against).abs();

    let before1 = load_rating(conn, p1, ladder_id).await?;
    let before2 = load_rating(conn, p2, ladder_id).await?;

    let mut changes = Vec::with_capacity(2);
    for (before, opponent, result) in [(&before1, &before2, res1), (&before2, &before1, res2)] {
        let new_rating = elo::calculate_new_rating(
            before.rating,
            opponent.rating,
            result.outcome,
            goal_diff,
            before.win_streak,
            result.outcome == Outcome::Win,
        );
        let mut after = before.clone();
        stats::apply(&mut after, result, new_rating);
        ratings::write_rating(conn, &after, true).await?;
        ratings::insert_history(conn, r.id(), before, new_rating).await?;

        changes.push(RatingChange {
            player_id: before.player_id,
            before: before.rating,
            after: new_rating,
            delta: new_rating - before.rating,
            checkpoint: elo::is_checkpoint(before.rating, before.win_streak, result.outcome),
        });
    }
    Ok(changes)
}

async fn revert_ladder_result(
    conn: &mut SqliteConnection,
    record: &MatchRecord,
    admin: &str,
) -> Result<(), MatchError> {
    let r = record.match_ref;
    if !store::transition(conn, r, MatchStatus::Settled, MatchStatus::Cancelled).await? {
        return Err(MatchError::ConcurrentModification);
    }

    let (p1, p2) = players(record)?;
    let (res1, res2) = player_results(record)?;
    let history = ratings::history_for_match(conn, r.id()).await?;

    for (player_id, result) in [(p1, res1), (p2, res2)] {
        let Some(entry) = history.iter().find(|h| h.player_id == player_id) else {
            return Err(MatchError::WrongState(format!(
                "missing rating history for player {player_id}"
            )));
        };
        let mut rating = ratings::fetch_rating(conn, player_id, record.scope_id)
            .await?
            .ok_or(MatchError::NotFound)?;
        stats::revert(&mut rating, result, entry);
        ratings::write_rating(conn, &rating, false).await?;
    }

    ratings::delete_history(conn, r.id()).await?;
    let details = format!(
        "restored ratings of players {p1} and {p2} to {} and {}",
        history.iter().find(|h| h.player_id == p1).map_or(0, |h| h.rating_before),
        history.iter().find(|h| h.player_id == p2).map_or(0, |h| h.rating_before),
    );
    store::insert_admin_action(conn, admin, "cancel_match", r, &details).await?;
    Ok(())
}
