// Players, admins, ladders, rating records and rating history.

use sqlx::SqliteConnection;

use super::{Database, Ladder, LadderMatch, Player, PlayerRating, RatingHistory, Standing};

const RATING_COLUMNS: &str = "player_id, ladder_id, rating, games_played, wins, draws, losses, \
     goals_scored, goals_conceded, points, win_streak, last_played";

const LADDER_MATCH_COLUMNS: &str = "id, ladder_id, player1_id, player2_id, player1_score, \
     player2_score, tiebreak1, tiebreak2, status, reported_by, reported_at, created_at";

const HISTORY_COLUMNS: &str = "id, match_id, ladder_id, player_id, rating_before, rating_after, \
     delta, win_streak_before, created_at";

impl Database {
    // ── Identity ─────────────────────────────────────────────────────

    /// Register a player or refresh the gamertag of an existing one.
    pub async fn upsert_player(&self, discord_id: &str, gamertag: &str) -> Result<Player, sqlx::Error> {
        sqlx::query_as::<_, Player>(
            "INSERT INTO players (discord_id, gamertag) VALUES (?, ?)
             ON CONFLICT(discord_id) DO UPDATE SET gamertag = excluded.gamertag
             RETURNING id, discord_id, gamertag, created_at",
        )
        .bind(discord_id)
        .bind(gamertag)
        .fetch_one(&self.pool)
        .await
    }

    /// Identity resolver: chat account to internal player.
    pub async fn resolve_player(&self, discord_id: &str) -> Result<Option<Player>, sqlx::Error> {
        sqlx::query_as::<_, Player>(
            "SELECT id, discord_id, gamertag, created_at FROM players WHERE discord_id = ?",
        )
        .bind(discord_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_player(&self, id: i64) -> Result<Option<Player>, sqlx::Error> {
        sqlx::query_as::<_, Player>(
            "SELECT id, discord_id, gamertag, created_at FROM players WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn add_admin(&self, discord_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR IGNORE INTO admins (discord_id) VALUES (?)")
            .bind(discord_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_admin(&self, discord_id: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as("SELECT discord_id FROM admins WHERE discord_id = ?")
            .bind(discord_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    // ── Ladders ──────────────────────────────────────────────────────

    pub async fn create_ladder(&self, name: &str) -> Result<Ladder, sqlx::Error> {
        sqlx::query_as::<_, Ladder>(
            "INSERT INTO ladders (name) VALUES (?)
             RETURNING id, name, max_matches_per_opponent, created_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_ladder(&self, id: i64) -> Result<Option<Ladder>, sqlx::Error> {
        sqlx::query_as::<_, Ladder>(
            "SELECT id, name, max_matches_per_opponent, created_at FROM ladders WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Set how many confirmed matches two players may play against each
    /// other per day. `None` when the ladder does not exist.
    pub async fn set_max_matches_per_opponent(
        &self,
        id: i64,
        limit: Option<i32>,
    ) -> Result<Option<Ladder>, sqlx::Error> {
        sqlx::query_as::<_, Ladder>(
            "UPDATE ladders SET max_matches_per_opponent = ? WHERE id = ?
             RETURNING id, name, max_matches_per_opponent, created_at",
        )
        .bind(limit)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Whether the pair already played the ladder's daily maximum of
    /// confirmed matches against each other today (UTC). Always false when
    /// the ladder has no positive limit.
    pub async fn daily_limit_reached(
        &self,
        ladder_id: i64,
        player1_id: i64,
        player2_id: i64,
    ) -> Result<bool, sqlx::Error> {
        let limit: Option<(Option<i32>,)> =
            sqlx::query_as("SELECT max_matches_per_opponent FROM ladders WHERE id = ?")
                .bind(ladder_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(limit) = limit.and_then(|(l,)| l).filter(|&l| l > 0) else {
            return Ok(false);
        };

        let (played,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ladder_matches
             WHERE ladder_id = ? AND status = 'confirmed'
               AND ((player1_id = ? AND player2_id = ?) OR (player1_id = ? AND player2_id = ?))
               AND date(created_at) = date('now')",
        )
        .bind(ladder_id)
        .bind(player1_id)
        .bind(player2_id)
        .bind(player2_id)
        .bind(player1_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(played >= i64::from(limit))
    }

    /// Create a paired ladder match, making sure both rating rows exist.
    pub async fn create_ladder_match(
        &self,
        ladder_id: i64,
        player1_id: i64,
        player2_id: i64,
    ) -> Result<LadderMatch, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        ensure_rating(&mut tx, player1_id, ladder_id).await?;
        ensure_rating(&mut tx, player2_id, ladder_id).await?;
        let row = sqlx::query_as::<_, LadderMatch>(&format!(
            "INSERT INTO ladder_matches (ladder_id, player1_id, player2_id) VALUES (?, ?, ?)
             RETURNING {LADDER_MATCH_COLUMNS}"
        ))
        .bind(ladder_id)
        .bind(player1_id)
        .bind(player2_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    // ── Ratings ──────────────────────────────────────────────────────

    pub async fn get_rating(
        &self,
        player_id: i64,
        ladder_id: i64,
    ) -> Result<Option<PlayerRating>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        fetch_rating(&mut conn, player_id, ladder_id).await
    }

    /// Leaderboard order: rating, goal difference, goals scored, fewest
    /// conceded, then gamertag.
    pub async fn standings(&self, ladder_id: i64) -> Result<Vec<Standing>, sqlx::Error> {
        sqlx::query_as::<_, Standing>(
            "SELECT r.player_id, p.gamertag, r.rating, r.games_played, r.wins, r.draws, r.losses,
                    r.goals_scored, r.goals_conceded, r.points, r.win_streak
             FROM player_ratings r
             JOIN players p ON p.id = r.player_id
             WHERE r.ladder_id = ?
             ORDER BY r.rating DESC,
                      (r.goals_scored - r.goals_conceded) DESC,
                      r.goals_scored DESC,
                      r.goals_conceded ASC,
                      p.gamertag ASC",
        )
        .bind(ladder_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn rating_history(
        &self,
        player_id: i64,
        ladder_id: i64,
    ) -> Result<Vec<RatingHistory>, sqlx::Error> {
        sqlx::query_as::<_, RatingHistory>(&format!(
            "SELECT {HISTORY_COLUMNS} FROM rating_history
             WHERE player_id = ? AND ladder_id = ? ORDER BY id"
        ))
        .bind(player_id)
        .bind(ladder_id)
        .fetch_all(&self.pool)
        .await
    }
}

// ── Transaction helpers ──────────────────────────────────────────────

pub(crate) async fn ensure_rating(
    conn: &mut SqliteConnection,
    player_id: i64,
    ladder_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO player_ratings (player_id, ladder_id) VALUES (?, ?)")
        .bind(player_id)
        .bind(ladder_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn fetch_rating(
    conn: &mut SqliteConnection,
    player_id: i64,
    ladder_id: i64,
) -> Result<Option<PlayerRating>, sqlx::Error> {
    sqlx::query_as::<_, PlayerRating>(&format!(
        "SELECT {RATING_COLUMNS} FROM player_ratings WHERE player_id = ? AND ladder_id = ?"
    ))
    .bind(player_id)
    .bind(ladder_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Overwrite a rating row. A missing row is an error, never a silent no-op.
pub(crate) async fn write_rating(
    conn: &mut SqliteConnection,
    rating: &PlayerRating,
    touch_last_played: bool,
) -> Result<(), sqlx::Error> {
    let last_played = if touch_last_played {
        "datetime('now')"
    } else {
        "last_played"
    };
    let result = sqlx::query(&format!(
        "UPDATE player_ratings SET rating = ?, games_played = ?, wins = ?, draws = ?, losses = ?,
             goals_scored = ?, goals_conceded = ?, points = ?, win_streak = ?,
             last_played = {last_played}
         WHERE player_id = ? AND ladder_id = ?"
    ))
    .bind(rating.rating)
    .bind(rating.games_played)
    .bind(rating.wins)
    .bind(rating.draws)
    .bind(rating.losses)
    .bind(rating.goals_scored)
    .bind(rating.goals_conceded)
    .bind(rating.points)
    .bind(rating.win_streak)
    .bind(rating.player_id)
    .bind(rating.ladder_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

pub(crate) async fn insert_history(
    conn: &mut SqliteConnection,
    match_id: i64,
    before: &PlayerRating,
    rating_after: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO rating_history
             (match_id, ladder_id, player_id, rating_before, rating_after, delta, win_streak_before)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(match_id)
    .bind(before.ladder_id)
    .bind(before.player_id)
    .bind(before.rating)
    .bind(rating_after)
    .bind(rating_after - before.rating)
    .bind(before.win_streak)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn history_for_match(
    conn: &mut SqliteConnection,
    match_id: i64,
) -> Result<Vec<RatingHistory>, sqlx::Error> {
    sqlx::query_as::<_, RatingHistory>(&format!(
        "SELECT {HISTORY_COLUMNS} FROM rating_history WHERE match_id = ? ORDER BY id"
    ))
    .bind(match_id)
    .fetch_all(&mut *conn)
    .await
}

pub(crate) async fn delete_history(
    conn: &mut SqliteConnection,
    match_id: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM rating_history WHERE match_id = ?")
        .bind(match_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
