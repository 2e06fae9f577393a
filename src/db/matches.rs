// Kind-agnostic match access: a `MatchRef` picks the table, every state
// change is a conditional update on the expected status.

use serde::Serialize;
use sqlx::SqliteConnection;

use super::{AdminAction, Database, Dispute};
use crate::models::{MatchKind, MatchRef, MatchStatus};

/// Common view over ladder and tournament match rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRecord {
    #[serde(rename = "match")]
    pub match_ref: MatchRef,
    /// Ladder id or competition id.
    pub scope_id: i64,
    pub player1_id: Option<i64>,
    pub player2_id: Option<i64>,
    pub player1_score: Option<i32>,
    pub player2_score: Option<i32>,
    pub tiebreak1: Option<i32>,
    pub tiebreak2: Option<i32>,
    pub status: MatchStatus,
    pub reported_by: Option<String>,
    pub reported_at: Option<String>,
    /// Tournament slot filled by a permanent bye.
    pub has_bye: bool,
}

impl MatchRecord {
    pub fn is_participant(&self, player_id: i64) -> bool {
        self.player1_id == Some(player_id) || self.player2_id == Some(player_id)
    }

    /// Winner by main score, or by tie-break when the main score is level.
    pub fn winner_id(&self) -> Option<i64> {
        let (s1, s2) = (self.player1_score?, self.player2_score?);
        let p1_wins = if s1 != s2 {
            s1 > s2
        } else {
            self.tiebreak1? > self.tiebreak2?
        };
        if p1_wins {
            self.player1_id
        } else {
            self.player2_id
        }
    }

    /// Same recorded result: scores, tie-breaks, reporter and report time.
    /// The status is not compared.
    pub fn same_report(&self, other: &MatchRecord) -> bool {
        self.match_ref == other.match_ref
            && self.player1_id == other.player1_id
            && self.player2_id == other.player2_id
            && self.player1_score == other.player1_score
            && self.player2_score == other.player2_score
            && self.tiebreak1 == other.tiebreak1
            && self.tiebreak2 == other.tiebreak2
            && self.reported_by == other.reported_by
            && self.reported_at == other.reported_at
    }

    pub fn loser_id(&self) -> Option<i64> {
        let winner = self.winner_id()?;
        if self.player1_id == Some(winner) {
            self.player2_id
        } else {
            self.player1_id
        }
    }
}

#[derive(sqlx::FromRow)]
struct RawMatch {
    id: i64,
    scope_id: i64,
    player1_id: Option<i64>,
    player2_id: Option<i64>,
    player1_ready: bool,
    player2_ready: bool,
    player1_score: Option<i32>,
    player2_score: Option<i32>,
    tiebreak1: Option<i32>,
    tiebreak2: Option<i32>,
    status: String,
    reported_by: Option<String>,
    reported_at: Option<String>,
}

impl RawMatch {
    fn into_record(self, kind: MatchKind) -> Result<MatchRecord, sqlx::Error> {
        let status = MatchStatus::from_db_str(kind, &self.status).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown {} match status '{}'", kind.as_str(), self.status).into())
        })?;
        let has_bye = (self.player1_ready && self.player1_id.is_none())
            || (self.player2_ready && self.player2_id.is_none());
        Ok(MatchRecord {
            match_ref: MatchRef::new(kind, self.id),
            scope_id: self.scope_id,
            player1_id: self.player1_id,
            player2_id: self.player2_id,
            player1_score: self.player1_score,
            player2_score: self.player2_score,
            tiebreak1: self.tiebreak1,
            tiebreak2: self.tiebreak2,
            status,
            reported_by: self.reported_by,
            reported_at: self.reported_at,
            has_bye,
        })
    }
}

fn select_sql(kind: MatchKind) -> &'static str {
    match kind {
        MatchKind::Ladder => {
            "SELECT id, ladder_id AS scope_id, player1_id, player2_id,
                    1 AS player1_ready, 1 AS player2_ready,
                    player1_score, player2_score, tiebreak1, tiebreak2,
                    status, reported_by, reported_at
             FROM ladder_matches"
        }
        MatchKind::Tournament => {
            "SELECT id, competition_id AS scope_id, player1_id, player2_id,
                    player1_ready, player2_ready,
                    player1_score, player2_score, tiebreak1, tiebreak2,
                    status, reported_by, reported_at
             FROM tournament_matches"
        }
    }
}

/// Scores in player1/player2 order, ready to be recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedScore {
    pub player1: i32,
    pub player2: i32,
    pub tiebreak1: Option<i32>,
    pub tiebreak2: Option<i32>,
}

impl Database {
    pub async fn get_match_record(&self, r: MatchRef) -> Result<Option<MatchRecord>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        fetch_record(&mut conn, r).await
    }

    /// Every match still waiting for confirmation, across both tables.
    pub async fn list_reported(&self) -> Result<Vec<MatchRecord>, sqlx::Error> {
        let mut records = Vec::new();
        for kind in [MatchKind::Ladder, MatchKind::Tournament] {
            let rows = sqlx::query_as::<_, RawMatch>(&format!(
                "{} WHERE status = 'reported' ORDER BY id",
                select_sql(kind)
            ))
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                records.push(row.into_record(kind)?);
            }
        }
        Ok(records)
    }

    /// Record a result: open -> reported. Returns false when the match was
    /// not open at write time.
    pub async fn record_report(
        &self,
        r: MatchRef,
        score: RecordedScore,
        reported_by: &str,
    ) -> Result<bool, sqlx::Error> {
        let kind = r.kind();
        let result = sqlx::query(&format!(
            "UPDATE {} SET player1_score = ?, player2_score = ?, tiebreak1 = ?, tiebreak2 = ?,
                 status = 'reported', reported_by = ?, reported_at = datetime('now')
             WHERE id = ? AND status = ?",
            kind.table()
        ))
        .bind(score.player1)
        .bind(score.player2)
        .bind(score.tiebreak1)
        .bind(score.tiebreak2)
        .bind(reported_by)
        .bind(r.id())
        .bind(MatchStatus::Open.as_db_str(kind))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_disputes(&self, r: MatchRef) -> Result<Vec<Dispute>, sqlx::Error> {
        sqlx::query_as::<_, Dispute>(
            "SELECT id, match_type, match_id, raised_by, reason, evidence, status, resolved_by,
                    resolution_notes, created_at, resolved_at
             FROM disputes WHERE match_type = ? AND match_id = ? ORDER BY id",
        )
        .bind(r.kind().as_str())
        .bind(r.id())
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_admin_actions(&self, r: MatchRef) -> Result<Vec<AdminAction>, sqlx::Error> {
        sqlx::query_as::<_, AdminAction>(
            "SELECT id, admin_discord_id, action, match_type, match_id, details, created_at
             FROM admin_actions WHERE match_type = ? AND match_id = ? ORDER BY id",
        )
        .bind(r.kind().as_str())
        .bind(r.id())
        .fetch_all(&self.pool)
        .await
    }
}

// ── Transaction helpers ──────────────────────────────────────────────

pub(crate) async fn fetch_record(
    conn: &mut SqliteConnection,
    r: MatchRef,
) -> Result<Option<MatchRecord>, sqlx::Error> {
    let kind = r.kind();
    let row = sqlx::query_as::<_, RawMatch>(&format!("{} WHERE id = ?", select_sql(kind)))
        .bind(r.id())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|raw| raw.into_record(kind)).transpose()
}

/// Re-read the row inside the caller's transaction and check that it still
/// carries the report `expected` was loaded with.
pub(crate) async fn report_unchanged(
    conn: &mut SqliteConnection,
    expected: &MatchRecord,
) -> Result<bool, sqlx::Error> {
    let current = fetch_record(conn, expected.match_ref).await?;
    Ok(current.is_some_and(|c| c.same_report(expected)))
}

/// Conditional status change. Returns false when `from` no longer holds.
pub(crate) async fn transition(
    conn: &mut SqliteConnection,
    r: MatchRef,
    from: MatchStatus,
    to: MatchStatus,
) -> Result<bool, sqlx::Error> {
    let kind = r.kind();
    let result = sqlx::query(&format!(
        "UPDATE {} SET status = ? WHERE id = ? AND status = ?",
        kind.table()
    ))
    .bind(to.as_db_str(kind))
    .bind(r.id())
    .bind(from.as_db_str(kind))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// disputed -> open, discarding the reported result.
pub(crate) async fn reopen(conn: &mut SqliteConnection, r: MatchRef) -> Result<bool, sqlx::Error> {
    let kind = r.kind();
    let result = sqlx::query(&format!(
        "UPDATE {} SET status = ?, player1_score = NULL, player2_score = NULL,
             tiebreak1 = NULL, tiebreak2 = NULL, reported_by = NULL, reported_at = NULL
         WHERE id = ? AND status = ?",
        kind.table()
    ))
    .bind(MatchStatus::Open.as_db_str(kind))
    .bind(r.id())
    .bind(MatchStatus::Disputed.as_db_str(kind))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn insert_dispute(
    conn: &mut SqliteConnection,
    r: MatchRef,
    raised_by: &str,
    reason: &str,
    evidence: Option<&str>,
) -> Result<Dispute, sqlx::Error> {
    sqlx::query_as::<_, Dispute>(
        "INSERT INTO disputes (match_type, match_id, raised_by, reason, evidence)
         VALUES (?, ?, ?, ?, ?)
         RETURNING id, match_type, match_id, raised_by, reason, evidence, status, resolved_by,
                   resolution_notes, created_at, resolved_at",
    )
    .bind(r.kind().as_str())
    .bind(r.id())
    .bind(raised_by)
    .bind(reason)
    .bind(evidence)
    .fetch_one(&mut *conn)
    .await
}

pub(crate) async fn resolve_disputes(
    conn: &mut SqliteConnection,
    r: MatchRef,
    resolved_by: &str,
    notes: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE disputes SET status = 'resolved', resolved_by = ?, resolution_notes = ?,
             resolved_at = datetime('now')
         WHERE match_type = ? AND match_id = ? AND status = 'open'",
    )
    .bind(resolved_by)
    .bind(notes)
    .bind(r.kind().as_str())
    .bind(r.id())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn insert_admin_action(
    conn: &mut SqliteConnection,
    admin_discord_id: &str,
    action: &str,
    r: MatchRef,
    details: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO admin_actions (admin_discord_id, action, match_type, match_id, details)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(admin_discord_id)
    .bind(action)
    .bind(r.kind().as_str())
    .bind(r.id())
    .bind(details)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Database, MatchRef) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let ladder = db.create_ladder("1v1").await.unwrap();
        let a = db.upsert_player("1", "A").await.unwrap();
        let b = db.upsert_player("2", "B").await.unwrap();
        let m = db.create_ladder_match(ladder.id, a.id, b.id).await.unwrap();
        (db, MatchRef::Ladder(m.id))
    }

    fn score(p1: i32, p2: i32) -> RecordedScore {
        RecordedScore {
            player1: p1,
            player2: p2,
            tiebreak1: None,
            tiebreak2: None,
        }
    }

    #[tokio::test]
    async fn test_record_report_is_conditional() {
        let (db, r) = setup().await;
        assert!(db.record_report(r, score(3, 1), "1").await.unwrap());
        // Second report finds the match no longer open
        assert!(!db.record_report(r, score(0, 5), "2").await.unwrap());

        let rec = db.get_match_record(r).await.unwrap().unwrap();
        assert_eq!(rec.status, MatchStatus::Reported);
        assert_eq!(rec.player1_score, Some(3));
        assert_eq!(rec.reported_by.as_deref(), Some("1"));
        assert!(rec.reported_at.is_some());
        assert!(!rec.has_bye);
    }

    #[tokio::test]
    async fn test_transition_and_reopen() {
        let (db, r) = setup().await;
        db.record_report(r, score(2, 2), "1").await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        assert!(!transition(&mut conn, r, MatchStatus::Open, MatchStatus::Disputed)
            .await
            .unwrap());
        assert!(transition(&mut conn, r, MatchStatus::Reported, MatchStatus::Disputed)
            .await
            .unwrap());
        assert!(reopen(&mut conn, r).await.unwrap());
        drop(conn);

        let rec = db.get_match_record(r).await.unwrap().unwrap();
        assert_eq!(rec.status, MatchStatus::Open);
        assert!(rec.player1_score.is_none());
        assert!(rec.reported_by.is_none());
    }

    #[tokio::test]
    async fn test_list_reported() {
        let (db, r) = setup().await;
        assert!(db.list_reported().await.unwrap().is_empty());
        db.record_report(r, score(1, 0), "1").await.unwrap();
        let reported = db.list_reported().await.unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].match_ref, r);
    }

    #[tokio::test]
    async fn test_report_unchanged_sees_a_new_report() {
        let (db, r) = setup().await;
        db.record_report(r, score(3, 0), "1").await.unwrap();
        let first = db.get_match_record(r).await.unwrap().unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        assert!(report_unchanged(&mut conn, &first).await.unwrap());
        transition(&mut conn, r, MatchStatus::Reported, MatchStatus::Disputed)
            .await
            .unwrap();
        // Status alone does not count as a different report
        assert!(report_unchanged(&mut conn, &first).await.unwrap());
        reopen(&mut conn, r).await.unwrap();
        drop(conn);

        db.record_report(r, score(0, 3), "2").await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        assert!(!report_unchanged(&mut conn, &first).await.unwrap());
    }

    #[test]
    fn test_winner_by_tiebreak() {
        let rec = MatchRecord {
            match_ref: MatchRef::Ladder(1),
            scope_id: 1,
            player1_id: Some(10),
            player2_id: Some(20),
            player1_score: Some(2),
            player2_score: Some(2),
            tiebreak1: Some(3),
            tiebreak2: Some(4),
            status: MatchStatus::Reported,
            reported_by: None,
            reported_at: None,
            has_bye: false,
        };
        assert_eq!(rec.winner_id(), Some(20));
        assert_eq!(rec.loser_id(), Some(10));
        assert!(rec.is_participant(10));
        assert!(!rec.is_participant(30));
    }
}
