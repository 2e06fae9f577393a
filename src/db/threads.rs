// Thread registry: the one mapping between chat threads and matches.
//
// A row is claimed before the thread is created, so two deliveries of the
// same event race on the primary key and only one of them creates a thread.

use super::Database;
use crate::models::{MatchKind, MatchRef, ThreadHandle};

impl Database {
    /// Claim the registry row for a match. False when another caller already
    /// holds it (with or without an attached thread).
    pub async fn claim_thread(&self, r: MatchRef) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO match_threads (match_type, match_id) VALUES (?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(r.kind().as_str())
        .bind(r.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Attach the created thread to a claimed row.
    pub async fn attach_thread(&self, r: MatchRef, thread: &ThreadHandle) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE match_threads SET thread_id = ? WHERE match_type = ? AND match_id = ?")
            .bind(&thread.0)
            .bind(r.kind().as_str())
            .bind(r.id())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop a claim whose thread was never created.
    pub async fn release_thread_claim(&self, r: MatchRef) -> Result<(), sqlx::Error> {
        sqlx::query(
            "DELETE FROM match_threads WHERE match_type = ? AND match_id = ? AND thread_id IS NULL",
        )
        .bind(r.kind().as_str())
        .bind(r.id())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Register an existing thread for a match. Returns false if the match
    /// already has a registry row.
    pub async fn register_thread(&self, r: MatchRef, thread: &ThreadHandle) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO match_threads (match_type, match_id, thread_id) VALUES (?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(r.kind().as_str())
        .bind(r.id())
        .bind(&thread.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn lookup_match_by_thread(
        &self,
        thread: &ThreadHandle,
    ) -> Result<Option<MatchRef>, sqlx::Error> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT match_type, match_id FROM match_threads WHERE thread_id = ?")
                .bind(&thread.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(kind, id)| MatchKind::from_str_name(&kind).map(|k| MatchRef::new(k, id))))
    }

    pub async fn thread_for_match(&self, r: MatchRef) -> Result<Option<ThreadHandle>, sqlx::Error> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT thread_id FROM match_threads WHERE match_type = ? AND match_id = ?",
        )
        .bind(r.kind().as_str())
        .bind(r.id())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(id,)| id).map(ThreadHandle))
    }
}
