// Competitions, participants and bracket match nodes.

use sqlx::SqliteConnection;

use super::{Competition, Database, Participant, TournamentMatch};
use crate::models::Slot;
use crate::tournament::PlannedMatch;

const MATCH_COLUMNS: &str = "id, competition_id, round, bracket_side, round_label, position, \
     player1_id, player2_id, player1_ready, player2_ready, player1_score, player2_score, \
     tiebreak1, tiebreak2, winner_id, status, reported_by, reported_at, next_match_win, \
     next_match_win_slot, next_match_loss, next_match_loss_slot";

const PARTICIPANT_COLUMNS: &str = "id, competition_id, player_id, seed, status, joined_at";

impl Database {
    // ── Competitions ─────────────────────────────────────────────────

    pub async fn create_competition(&self, name: &str, slug: &str) -> Result<Competition, sqlx::Error> {
        sqlx::query_as::<_, Competition>(
            "INSERT INTO competitions (name, slug) VALUES (?, ?)
             RETURNING id, name, slug, format, status, created_at",
        )
        .bind(name)
        .bind(slug)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_competition(&self, id: i64) -> Result<Option<Competition>, sqlx::Error> {
        sqlx::query_as::<_, Competition>(
            "SELECT id, name, slug, format, status, created_at FROM competitions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_competitions_with_status(
        &self,
        status: &str,
    ) -> Result<Vec<Competition>, sqlx::Error> {
        sqlx::query_as::<_, Competition>(
            "SELECT id, name, slug, format, status, created_at FROM competitions
             WHERE status = ? ORDER BY id",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
    }

    // ── Participants ─────────────────────────────────────────────────

    /// Register a player. Registering twice returns the existing row.
    pub async fn add_participant(
        &self,
        competition_id: i64,
        player_id: i64,
    ) -> Result<Participant, sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO tournament_participants (competition_id, player_id) VALUES (?, ?)",
        )
        .bind(competition_id)
        .bind(player_id)
        .execute(&self.pool)
        .await?;
        sqlx::query_as::<_, Participant>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM tournament_participants
             WHERE competition_id = ? AND player_id = ?"
        ))
        .bind(competition_id)
        .bind(player_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Participants in registration order.
    pub async fn list_participants(&self, competition_id: i64) -> Result<Vec<Participant>, sqlx::Error> {
        sqlx::query_as::<_, Participant>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM tournament_participants
             WHERE competition_id = ? ORDER BY id"
        ))
        .bind(competition_id)
        .fetch_all(&self.pool)
        .await
    }

    // ── Bracket matches ──────────────────────────────────────────────

    pub async fn get_tournament_match(&self, id: i64) -> Result<Option<TournamentMatch>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        fetch_tournament_match(&mut conn, id).await
    }

    pub async fn list_tournament_matches(
        &self,
        competition_id: i64,
    ) -> Result<Vec<TournamentMatch>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        list_bracket(&mut conn, competition_id).await
    }

    /// Ready matches between two real players that have no registry row yet.
    pub async fn ready_matches_without_thread(
        &self,
        competition_id: i64,
    ) -> Result<Vec<TournamentMatch>, sqlx::Error> {
        let columns = MATCH_COLUMNS
            .split(", ")
            .map(|c| format!("m.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query_as::<_, TournamentMatch>(&format!(
            "SELECT {columns} FROM tournament_matches m
             LEFT JOIN match_threads t ON t.match_type = 'tournament' AND t.match_id = m.id
             WHERE m.competition_id = ? AND m.status = 'scheduled'
               AND m.player1_ready = 1 AND m.player2_ready = 1
               AND m.player1_id IS NOT NULL AND m.player2_id IS NOT NULL
               AND t.match_id IS NULL
             ORDER BY m.id"
        ))
        .bind(competition_id)
        .fetch_all(&self.pool)
        .await
    }
}

// ── Transaction helpers ──────────────────────────────────────────────

/// Conditional competition status change.
pub(crate) async fn set_competition_status(
    conn: &mut SqliteConnection,
    competition_id: i64,
    from: &str,
    to: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE competitions SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(competition_id)
        .bind(from)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn set_seed(
    conn: &mut SqliteConnection,
    competition_id: i64,
    player_id: i64,
    seed: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE tournament_participants SET seed = ? WHERE competition_id = ? AND player_id = ?")
        .bind(seed)
        .bind(competition_id)
        .bind(player_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn eliminate_participant(
    conn: &mut SqliteConnection,
    competition_id: i64,
    player_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE tournament_participants SET status = 'eliminated'
         WHERE competition_id = ? AND player_id = ?",
    )
    .bind(competition_id)
    .bind(player_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert an empty bracket node; links are filled in afterwards.
pub(crate) async fn insert_bracket_match(
    conn: &mut SqliteConnection,
    competition_id: i64,
    planned: &PlannedMatch,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO tournament_matches (competition_id, round, bracket_side, round_label, position)
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(competition_id)
    .bind(planned.round as i32)
    .bind(planned.side.as_str())
    .bind(&planned.label)
    .bind(planned.position as i32)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub(crate) async fn link_bracket_match(
    conn: &mut SqliteConnection,
    id: i64,
    win: Option<(i64, Slot)>,
    loss: Option<(i64, Slot)>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE tournament_matches SET next_match_win = ?, next_match_win_slot = ?,
             next_match_loss = ?, next_match_loss_slot = ?
         WHERE id = ?",
    )
    .bind(win.map(|(target, _)| target))
    .bind(win.map(|(_, slot)| slot.as_i32()))
    .bind(loss.map(|(target, _)| target))
    .bind(loss.map(|(_, slot)| slot.as_i32()))
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Seat a player (or a permanent bye when `player_id` is None) and mark the
/// slot ready.
pub(crate) async fn fill_slot(
    conn: &mut SqliteConnection,
    id: i64,
    slot: Slot,
    player_id: Option<i64>,
) -> Result<(), sqlx::Error> {
    let sql = match slot {
        Slot::One => "UPDATE tournament_matches SET player1_id = ?, player1_ready = 1 WHERE id = ?",
        Slot::Two => "UPDATE tournament_matches SET player2_id = ?, player2_ready = 1 WHERE id = ?",
    };
    let result = sqlx::query(sql)
        .bind(player_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

/// Mark a match completed with an optional winner. False when the match
/// was not in `from` at write time.
pub(crate) async fn complete_bracket_match(
    conn: &mut SqliteConnection,
    id: i64,
    from: &str,
    winner_id: Option<i64>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE tournament_matches SET status = 'completed', winner_id = ? WHERE id = ? AND status = ?",
    )
    .bind(winner_id)
    .bind(id)
    .bind(from)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn fetch_tournament_match(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<TournamentMatch>, sqlx::Error> {
    sqlx::query_as::<_, TournamentMatch>(&format!(
        "SELECT {MATCH_COLUMNS} FROM tournament_matches WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

pub(crate) async fn list_bracket(
    conn: &mut SqliteConnection,
    competition_id: i64,
) -> Result<Vec<TournamentMatch>, sqlx::Error> {
    sqlx::query_as::<_, TournamentMatch>(&format!(
        "SELECT {MATCH_COLUMNS} FROM tournament_matches WHERE competition_id = ? ORDER BY id"
    ))
    .bind(competition_id)
    .fetch_all(&mut *conn)
    .await
}

/// Scheduled matches whose slots are all filled but hold at least one bye.
pub(crate) async fn ready_byes(
    conn: &mut SqliteConnection,
    competition_id: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM tournament_matches
         WHERE competition_id = ? AND status = 'scheduled'
           AND player1_ready = 1 AND player2_ready = 1
           AND (player1_id IS NULL OR player2_id IS NULL)
         ORDER BY id",
    )
    .bind(competition_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// True once every match of the given round and side is completed.
pub(crate) async fn round_complete(
    conn: &mut SqliteConnection,
    competition_id: i64,
    round: i32,
    side: &str,
) -> Result<bool, sqlx::Error> {
    let (open,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tournament_matches
         WHERE competition_id = ? AND round = ? AND bracket_side = ? AND status != 'completed'",
    )
    .bind(competition_id)
    .bind(round)
    .bind(side)
    .fetch_one(&mut *conn)
    .await?;
    Ok(open == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tournament::BracketSide;

    #[tokio::test]
    async fn test_participants_keep_registration_order() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let comp = db.create_competition("Cup", "cup").await.unwrap();
        assert_eq!(comp.status, "draft");
        assert_eq!(comp.format, "double_elimination");

        let mut ids = Vec::new();
        for i in 0..3 {
            let p = db.upsert_player(&format!("d{i}"), &format!("P{i}")).await.unwrap();
            ids.push(p.id);
        }
        for &id in ids.iter().rev() {
            db.add_participant(comp.id, id).await.unwrap();
        }
        let again = db.add_participant(comp.id, ids[0]).await.unwrap();
        assert_eq!(again.status, "active");

        let listed: Vec<_> = db
            .list_participants(comp.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.player_id)
            .collect();
        assert_eq!(listed, vec![ids[2], ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn test_fill_slot_and_bye_detection() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let comp = db.create_competition("Cup", "cup").await.unwrap();
        let p = db.upsert_player("d1", "P1").await.unwrap();
        let planned = PlannedMatch {
            side: BracketSide::Winners,
            round: 1,
            position: 0,
            label: "WB R1".into(),
            win: None,
            loss: None,
            seats: None,
        };

        let mut conn = db.pool().acquire().await.unwrap();
        let id = insert_bracket_match(&mut conn, comp.id, &planned).await.unwrap();
        fill_slot(&mut conn, id, Slot::One, Some(p.id)).await.unwrap();
        assert!(ready_byes(&mut conn, comp.id).await.unwrap().is_empty());
        fill_slot(&mut conn, id, Slot::Two, None).await.unwrap();
        assert_eq!(ready_byes(&mut conn, comp.id).await.unwrap(), vec![id]);

        let m = fetch_tournament_match(&mut conn, id).await.unwrap().unwrap();
        assert!(m.is_ready());
        assert!(m.is_bye());

        assert!(!round_complete(&mut conn, comp.id, 1, "winners").await.unwrap());
        assert!(complete_bracket_match(&mut conn, id, "scheduled", Some(p.id)).await.unwrap());
        assert!(!complete_bracket_match(&mut conn, id, "scheduled", Some(p.id)).await.unwrap());
        assert!(round_complete(&mut conn, comp.id, 1, "winners").await.unwrap());

        assert!(fill_slot(&mut conn, 999, Slot::One, None).await.is_err());
    }
}
