// Database access layer (SQLite via sqlx).

pub mod ladder;
pub mod matches;
pub mod threads;
pub mod tournament;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::Transaction;

use crate::error::MatchError;

pub use matches::MatchRecord;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Player {
    pub id: i64,
    pub discord_id: String,
    pub gamertag: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ladder {
    pub id: i64,
    pub name: String,
    /// Confirmed matches two players may play against each other per day.
    /// `None` means unlimited.
    pub max_matches_per_opponent: Option<i32>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlayerRating {
    pub player_id: i64,
    pub ladder_id: i64,
    pub rating: i32,
    pub games_played: i32,
    pub wins: i32,
    pub draws: i32,
    pub losses: i32,
    pub goals_scored: i32,
    pub goals_conceded: i32,
    pub points: i32,
    pub win_streak: i32,
    pub last_played: Option<String>,
}

/// A leaderboard row: rating record plus the player's gamertag.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Standing {
    pub player_id: i64,
    pub gamertag: String,
    pub rating: i32,
    pub games_played: i32,
    pub wins: i32,
    pub draws: i32,
    pub losses: i32,
    pub goals_scored: i32,
    pub goals_conceded: i32,
    pub points: i32,
    pub win_streak: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LadderMatch {
    pub id: i64,
    pub ladder_id: i64,
    pub player1_id: i64,
    pub player2_id: i64,
    pub player1_score: Option<i32>,
    pub player2_score: Option<i32>,
    pub tiebreak1: Option<i32>,
    pub tiebreak2: Option<i32>,
    pub status: String,
    pub reported_by: Option<String>,
    pub reported_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RatingHistory {
    pub id: i64,
    pub match_id: Option<i64>,
    pub ladder_id: i64,
    pub player_id: i64,
    pub rating_before: i32,
    pub rating_after: i32,
    pub delta: i32,
    pub win_streak_before: i32,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dispute {
    pub id: i64,
    pub match_type: String,
    pub match_id: i64,
    pub raised_by: String,
    pub reason: String,
    pub evidence: Option<String>,
    pub status: String,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminAction {
    pub id: i64,
    pub admin_discord_id: String,
    pub action: String,
    pub match_type: String,
    pub match_id: i64,
    pub details: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Competition {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub format: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Participant {
    pub id: i64,
    pub competition_id: i64,
    pub player_id: i64,
    pub seed: Option<i32>,
    pub status: String,
    pub joined_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentMatch {
    pub id: i64,
    pub competition_id: i64,
    pub round: i32,
    pub bracket_side: String,
    pub round_label: String,
    pub position: i32,
    pub player1_id: Option<i64>,
    pub player2_id: Option<i64>,
    pub player1_ready: bool,
    pub player2_ready: bool,
    pub player1_score: Option<i32>,
    pub player2_score: Option<i32>,
    pub tiebreak1: Option<i32>,
    pub tiebreak2: Option<i32>,
    pub winner_id: Option<i64>,
    pub status: String,
    pub reported_by: Option<String>,
    pub reported_at: Option<String>,
    pub next_match_win: Option<i64>,
    pub next_match_win_slot: Option<i32>,
    pub next_match_loss: Option<i64>,
    pub next_match_loss_slot: Option<i32>,
}

impl TournamentMatch {
    /// Both slots are filled (with a player or a permanent bye).
    pub fn is_ready(&self) -> bool {
        self.player1_ready && self.player2_ready
    }

    /// A ready match with at least one empty slot plays itself.
    pub fn is_bye(&self) -> bool {
        self.is_ready() && (self.player1_id.is_none() || self.player2_id.is_none())
    }
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        // Every connection to `:memory:` opens a separate database, so in-memory
        // stores are pinned to a single connection that never gets recycled.
        let pool = if database_url.contains(":memory:") || database_url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(database_url)
                .await?
        } else {
            // Writers queue on the busy timeout instead of failing with SQLITE_BUSY
            let connect = database_url
                .parse::<SqliteConnectOptions>()?
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(connect)
                .await?
        };
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Raw pool access for maintenance queries and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS players (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                discord_id TEXT NOT NULL UNIQUE,
                gamertag TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS admins (
                discord_id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ladders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                max_matches_per_opponent INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS player_ratings (
                player_id INTEGER NOT NULL REFERENCES players(id),
                ladder_id INTEGER NOT NULL REFERENCES ladders(id),
                rating INTEGER NOT NULL DEFAULT 1000,
                games_played INTEGER NOT NULL DEFAULT 0,
                wins INTEGER NOT NULL DEFAULT 0,
                draws INTEGER NOT NULL DEFAULT 0,
                losses INTEGER NOT NULL DEFAULT 0,
                goals_scored INTEGER NOT NULL DEFAULT 0,
                goals_conceded INTEGER NOT NULL DEFAULT 0,
                points INTEGER NOT NULL DEFAULT 0,
                win_streak INTEGER NOT NULL DEFAULT 0,
                last_played TEXT,
                PRIMARY KEY (player_id, ladder_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ladder_matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ladder_id INTEGER NOT NULL REFERENCES ladders(id),
                player1_id INTEGER NOT NULL REFERENCES players(id),
                player2_id INTEGER NOT NULL REFERENCES players(id),
                player1_score INTEGER,
                player2_score INTEGER,
                tiebreak1 INTEGER,
                tiebreak2 INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                reported_by TEXT,
                reported_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rating_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                match_id INTEGER REFERENCES ladder_matches(id),
                ladder_id INTEGER NOT NULL REFERENCES ladders(id),
                player_id INTEGER NOT NULL REFERENCES players(id),
                rating_before INTEGER NOT NULL,
                rating_after INTEGER NOT NULL,
                delta INTEGER NOT NULL,
                win_streak_before INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS disputes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                match_type TEXT NOT NULL,
                match_id INTEGER NOT NULL,
                raised_by TEXT NOT NULL,
                reason TEXT NOT NULL,
                evidence TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                resolved_by TEXT,
                resolution_notes TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                resolved_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS admin_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                admin_discord_id TEXT NOT NULL,
                action TEXT NOT NULL,
                match_type TEXT NOT NULL,
                match_id INTEGER NOT NULL,
                details TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS competitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                format TEXT NOT NULL DEFAULT 'double_elimination',
                status TEXT NOT NULL DEFAULT 'draft',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tournament_participants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                competition_id INTEGER NOT NULL REFERENCES competitions(id) ON DELETE CASCADE,
                player_id INTEGER NOT NULL REFERENCES players(id),
                seed INTEGER,
                status TEXT NOT NULL DEFAULT 'active',
                joined_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(competition_id, player_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tournament_matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                competition_id INTEGER NOT NULL REFERENCES competitions(id) ON DELETE CASCADE,
                round INTEGER NOT NULL,
                bracket_side TEXT NOT NULL,
                round_label TEXT NOT NULL,
                position INTEGER NOT NULL,
                player1_id INTEGER REFERENCES players(id),
                player2_id INTEGER REFERENCES players(id),
                player1_ready INTEGER NOT NULL DEFAULT 0,
                player2_ready INTEGER NOT NULL DEFAULT 0,
                player1_score INTEGER,
                player2_score INTEGER,
                tiebreak1 INTEGER,
                tiebreak2 INTEGER,
                winner_id INTEGER REFERENCES players(id),
                status TEXT NOT NULL DEFAULT 'scheduled',
                reported_by TEXT,
                reported_at TEXT,
                next_match_win INTEGER REFERENCES tournament_matches(id),
                next_match_win_slot INTEGER,
                next_match_loss INTEGER REFERENCES tournament_matches(id),
                next_match_loss_slot INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS match_threads (
                match_type TEXT NOT NULL,
                match_id INTEGER NOT NULL,
                thread_id TEXT UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (match_type, match_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ladder_matches_status ON ladder_matches(status)",
            "CREATE INDEX IF NOT EXISTS idx_tournament_matches_comp ON tournament_matches(competition_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_rating_history_match ON rating_history(match_id)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Commit `tx` when `result` is Ok, roll it back otherwise.
///
/// A rollback that itself fails leaves the store in an unknown state; it is
/// logged as fatal and the original error is still returned.
pub(crate) async fn finish<T>(
    tx: Transaction<'static, Sqlite>,
    result: Result<T, MatchError>,
    context: &str,
) -> Result<T, MatchError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(
                    "FATAL: rollback failed during {context} after {e}: {rollback}; store may be inconsistent"
                );
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = test_db().await;
        db.run_migrations().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        for expected in [
            "admin_actions",
            "admins",
            "competitions",
            "disputes",
            "ladder_matches",
            "ladders",
            "match_threads",
            "player_ratings",
            "players",
            "rating_history",
            "tournament_matches",
            "tournament_participants",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_finish_rolls_back_on_error() {
        let db = test_db().await;
        let mut tx = db.begin().await.unwrap();
        sqlx::query("INSERT INTO ladders (name) VALUES ('doomed')")
            .execute(&mut *tx)
            .await
            .unwrap();
        let result: Result<(), MatchError> =
            finish(tx, Err(MatchError::ConcurrentModification), "test").await;
        assert!(matches!(result, Err(MatchError::ConcurrentModification)));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ladders")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_finish_commits_on_ok() {
        let db = test_db().await;
        let mut tx = db.begin().await.unwrap();
        sqlx::query("INSERT INTO ladders (name) VALUES ('kept')")
            .execute(&mut *tx)
            .await
            .unwrap();
        finish(tx, Ok(()), "test").await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ladders")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
