// Ladder match lifecycle against an in-memory store: report, confirm,
// disputes, admin undo, timers and restart recovery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ladder_bot::db::{Database, Player};
use ladder_bot::elo::STARTING_ELO;
use ladder_bot::error::MatchError;
use ladder_bot::lifecycle::{LifecycleConfig, MatchLifecycle, ScoreReport};
use ladder_bot::models::{ConfirmSource, MatchRef, MatchStatus, ThreadHandle};
use ladder_bot::notify::{MemorySink, Notice};
use ladder_bot::queue;

struct Harness {
    db: Arc<Database>,
    sink: Arc<MemorySink>,
    lc: Arc<MatchLifecycle>,
    ladder_id: i64,
    alice: Player,
    bob: Player,
    r: MatchRef,
}

fn slow() -> LifecycleConfig {
    LifecycleConfig {
        auto_confirm: Duration::from_secs(300),
        tick: Duration::from_secs(60),
    }
}

async fn setup(config: LifecycleConfig) -> Harness {
    setup_at("sqlite::memory:", config).await
}

async fn setup_at(database_url: &str, config: LifecycleConfig) -> Harness {
    let db = Arc::new(Database::new(database_url).await.unwrap());
    let sink = Arc::new(MemorySink::new());
    let lc = MatchLifecycle::new(db.clone(), sink.clone(), config);

    db.add_admin("admin").await.unwrap();
    let alice = db.upsert_player("alice", "Alice").await.unwrap();
    let bob = db.upsert_player("bob", "Bob").await.unwrap();
    db.upsert_player("carol", "Carol").await.unwrap();
    let ladder = db.create_ladder("Main").await.unwrap();
    let created = queue::open_ladder_match(&db, sink.as_ref(), ladder.id, alice.id, bob.id)
        .await
        .unwrap();

    Harness {
        db,
        sink,
        lc,
        ladder_id: ladder.id,
        alice,
        bob,
        r: MatchRef::Ladder(created.id),
    }
}

fn score(mine: u16, theirs: u16) -> ScoreReport {
    ScoreReport {
        your_score: mine,
        opponent_score: theirs,
        your_tiebreak: None,
        opponent_tiebreak: None,
    }
}

async fn rating(h: &Harness, player_id: i64) -> i32 {
    h.db.get_rating(player_id, h.ladder_id)
        .await
        .unwrap()
        .unwrap()
        .rating
}

#[tokio::test]
async fn test_three_one_confirm_moves_ratings() {
    let h = setup(slow()).await;

    let reported = h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();
    assert_eq!(reported.status, MatchStatus::Reported);
    assert_eq!(reported.reported_by.as_deref(), Some("alice"));
    assert!(h.lc.timers().is_armed(h.r));

    let confirmation = h.lc.confirm_result(h.r, "bob").await.unwrap();
    assert_eq!(confirmation.winner_id, Some(h.alice.id));
    assert_eq!(confirmation.record.status, MatchStatus::Settled);
    assert!(!h.lc.timers().is_armed(h.r));

    assert_eq!(rating(&h, h.alice.id).await, 1017);
    assert_eq!(rating(&h, h.bob.id).await, 988);

    let alice = h.db.get_rating(h.alice.id, h.ladder_id).await.unwrap().unwrap();
    assert_eq!((alice.wins, alice.points, alice.win_streak), (1, 3, 1));
    assert_eq!((alice.goals_scored, alice.goals_conceded), (3, 1));
    assert!(alice.last_played.is_some());

    let history = h.db.rating_history(h.bob.id, h.ladder_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!((history[0].rating_before, history[0].rating_after), (1000, 988));

    assert!(h
        .sink
        .posts()
        .iter()
        .any(|(_, n)| matches!(n, Notice::ResultConfirmed { source: ConfirmSource::Manual { .. }, .. })));
}

#[tokio::test]
async fn test_player_two_report_is_stored_in_slot_order() {
    let h = setup(slow()).await;
    let record = h.lc.report_result(h.r, "bob", score(1, 3)).await.unwrap();
    assert_eq!((record.player1_score, record.player2_score), (Some(3), Some(1)));
    assert_eq!(record.winner_id(), Some(h.alice.id));
}

#[tokio::test]
async fn test_report_validation() {
    let h = setup(slow()).await;

    let err = h.lc.report_result(h.r, "alice", score(2, 2)).await.unwrap_err();
    assert!(matches!(err, MatchError::DrawRejected));

    let tied = ScoreReport {
        your_tiebreak: Some(4),
        opponent_tiebreak: Some(4),
        ..score(2, 2)
    };
    let err = h.lc.report_result(h.r, "alice", tied).await.unwrap_err();
    assert!(matches!(err, MatchError::TieBreakInvalid));

    let err = h.lc.report_result(h.r, "carol", score(1, 0)).await.unwrap_err();
    assert!(matches!(err, MatchError::NotParticipant));

    let err = h.lc.report_result(h.r, "ghost", score(1, 0)).await.unwrap_err();
    assert!(matches!(err, MatchError::NotRegistered));

    let err = h
        .lc
        .report_result(MatchRef::Ladder(999), "alice", score(1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::NotFound));

    // Nothing was written by the rejected reports
    let record = h.db.get_match_record(h.r).await.unwrap().unwrap();
    assert_eq!(record.status, MatchStatus::Open);
    assert_eq!(record.player1_score, None);
}

#[tokio::test]
async fn test_penalties_decide_level_score() {
    let h = setup(slow()).await;
    let level = ScoreReport {
        your_tiebreak: Some(3),
        opponent_tiebreak: Some(5),
        ..score(2, 2)
    };
    h.lc.report_result(h.r, "alice", level).await.unwrap();
    let confirmation = h.lc.confirm_result(h.r, "bob").await.unwrap();
    assert_eq!(confirmation.winner_id, Some(h.bob.id));

    let bob = h.db.get_rating(h.bob.id, h.ladder_id).await.unwrap().unwrap();
    assert_eq!(bob.wins, 1);
    assert!(bob.rating > STARTING_ELO);
}

#[tokio::test]
async fn test_second_report_rejected() {
    let h = setup(slow()).await;
    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();
    let err = h.lc.report_result(h.r, "bob", score(3, 1)).await.unwrap_err();
    assert!(matches!(err, MatchError::WrongState(_)));
}

#[tokio::test]
async fn test_confirm_authorization() {
    let h = setup(slow()).await;

    let err = h.lc.confirm_result(h.r, "bob").await.unwrap_err();
    assert!(matches!(err, MatchError::WrongState(_)));

    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();

    let err = h.lc.confirm_result(h.r, "alice").await.unwrap_err();
    assert!(matches!(err, MatchError::Unauthorized));
    let err = h.lc.confirm_result(h.r, "carol").await.unwrap_err();
    assert!(matches!(err, MatchError::NotParticipant));
    let err = h.lc.confirm_result(h.r, "ghost").await.unwrap_err();
    assert!(matches!(err, MatchError::NotRegistered));

    let confirmation = h.lc.confirm_result(h.r, "admin").await.unwrap();
    assert_eq!(
        confirmation.source,
        ConfirmSource::Manual {
            confirmer: "admin".into()
        }
    );

    let err = h.lc.confirm_result(h.r, "bob").await.unwrap_err();
    assert!(matches!(err, MatchError::AlreadyConfirmed));
}

#[tokio::test]
async fn test_failed_rating_write_rolls_back_everything() {
    let h = setup(slow()).await;
    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();

    sqlx::query(&format!(
        "CREATE TRIGGER fail_second_rating BEFORE UPDATE ON player_ratings
         WHEN NEW.player_id = {}
         BEGIN SELECT RAISE(ABORT, 'injected failure'); END",
        h.bob.id
    ))
    .execute(h.db.pool())
    .await
    .unwrap();

    let err = h.lc.confirm_result(h.r, "bob").await.unwrap_err();
    assert_eq!(err.kind(), "internal_error");

    // Alice's row was written first inside the transaction and must be back
    let alice = h.db.get_rating(h.alice.id, h.ladder_id).await.unwrap().unwrap();
    assert_eq!((alice.rating, alice.games_played), (STARTING_ELO, 0));
    assert!(h.db.rating_history(h.alice.id, h.ladder_id).await.unwrap().is_empty());
    let record = h.db.get_match_record(h.r).await.unwrap().unwrap();
    assert_eq!(record.status, MatchStatus::Reported);

    sqlx::query("DROP TRIGGER fail_second_rating")
        .execute(h.db.pool())
        .await
        .unwrap();

    h.lc.confirm_result(h.r, "bob").await.unwrap();
    assert_eq!(rating(&h, h.alice.id).await, 1017);
    assert_eq!(rating(&h, h.bob.id).await, 988);
}

/// File-backed store with a real connection pool, removed on drop.
struct ScratchDb(PathBuf);

impl ScratchDb {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("{name}-{}.db", std::process::id()));
        let scratch = Self(path);
        scratch.remove();
        scratch
    }

    fn url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.0.display())
    }

    fn remove(&self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.0.display()));
        }
    }
}

impl Drop for ScratchDb {
    fn drop(&mut self) {
        self.remove();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_confirms_apply_once() {
    let scratch = ScratchDb::new("ladder-bot-concurrent-confirm");
    let h = setup_at(&scratch.url(), slow()).await;
    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();

    // Separate tasks on separate pooled connections race the same CAS
    let racers: Vec<_> = ["bob", "admin", "bob", "admin"]
        .into_iter()
        .map(|who| {
            let lc = h.lc.clone();
            let r = h.r;
            tokio::spawn(async move { lc.confirm_result(r, who).await })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(racers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.kind() == "already_confirmed"));

    let alice = h.db.get_rating(h.alice.id, h.ladder_id).await.unwrap().unwrap();
    assert_eq!(alice.games_played, 1);
    assert_eq!(alice.rating, 1017);
    assert_eq!(h.db.rating_history(h.alice.id, h.ladder_id).await.unwrap().len(), 1);

    h.lc.timers().cancel_all();
    h.db.pool().close().await;
}

#[tokio::test]
async fn test_cancel_restores_ratings_and_stats() {
    let h = setup(slow()).await;
    let alice_before = h.db.get_rating(h.alice.id, h.ladder_id).await.unwrap().unwrap();
    let bob_before = h.db.get_rating(h.bob.id, h.ladder_id).await.unwrap().unwrap();

    h.lc.report_result(h.r, "alice", score(4, 0)).await.unwrap();

    let err = h.lc.cancel_match(h.r, "admin").await.unwrap_err();
    assert!(matches!(err, MatchError::WrongState(_)));

    h.lc.confirm_result(h.r, "bob").await.unwrap();

    let err = h.lc.cancel_match(h.r, "alice").await.unwrap_err();
    assert!(matches!(err, MatchError::Unauthorized));

    let record = h.lc.cancel_match(h.r, "admin").await.unwrap();
    assert_eq!(record.status, MatchStatus::Cancelled);

    let alice_after = h.db.get_rating(h.alice.id, h.ladder_id).await.unwrap().unwrap();
    let bob_after = h.db.get_rating(h.bob.id, h.ladder_id).await.unwrap().unwrap();
    // last_played is left as it was after the confirm
    assert_eq!(
        (alice_after.rating, alice_after.games_played, alice_after.wins, alice_after.points),
        (alice_before.rating, 0, 0, 0)
    );
    assert_eq!(
        (bob_after.rating, bob_after.losses, bob_after.goals_conceded, bob_after.win_streak),
        (bob_before.rating, 0, 0, bob_before.win_streak)
    );
    assert!(h.db.rating_history(h.alice.id, h.ladder_id).await.unwrap().is_empty());

    let actions = h.db.list_admin_actions(h.r).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, "cancel_match");

    let err = h.lc.cancel_match(h.r, "admin").await.unwrap_err();
    assert!(matches!(err, MatchError::WrongState(_)));
}

#[tokio::test]
async fn test_dispute_freezes_match_until_resolved() {
    let h = setup(slow()).await;
    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();

    let err = h
        .lc
        .open_dispute(h.r, "carol", "not my match", None)
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::NotParticipant));

    let dispute = h
        .lc
        .open_dispute(h.r, "bob", "score was 1-3", Some("https://example.com/clip"))
        .await
        .unwrap();
    assert_eq!(dispute.raised_by, "bob");
    assert!(!h.lc.timers().is_armed(h.r));
    assert_eq!(h.sink.admin_notices().len(), 1);

    let err = h.lc.confirm_result(h.r, "bob").await.unwrap_err();
    assert!(matches!(err, MatchError::Disputed));
    let err = h.lc.report_result(h.r, "bob", score(3, 1)).await.unwrap_err();
    assert!(matches!(err, MatchError::Disputed));
    let err = h.lc.open_dispute(h.r, "alice", "again", None).await.unwrap_err();
    assert!(matches!(err, MatchError::Disputed));

    let err = h.lc.resolve_dispute(h.r, "alice", "mine").await.unwrap_err();
    assert!(matches!(err, MatchError::Unauthorized));

    let record = h.lc.resolve_dispute(h.r, "admin", "replay it").await.unwrap();
    assert_eq!(record.status, MatchStatus::Open);
    assert_eq!((record.player1_score, record.reported_by), (None, None));

    let disputes = h.db.list_disputes(h.r).await.unwrap();
    assert_eq!(disputes[0].status, "resolved");
    assert_eq!(disputes[0].resolved_by.as_deref(), Some("admin"));

    let err = h.lc.resolve_dispute(h.r, "admin", "twice").await.unwrap_err();
    assert!(matches!(err, MatchError::WrongState(_)));

    h.lc.report_result(h.r, "bob", score(3, 1)).await.unwrap();
    h.lc.confirm_result(h.r, "alice").await.unwrap();
    assert!(rating(&h, h.bob.id).await > STARTING_ELO);
}

#[tokio::test]
async fn test_dispute_after_confirm_rejected() {
    let h = setup(slow()).await;
    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();
    h.lc.confirm_result(h.r, "bob").await.unwrap();
    let err = h.lc.open_dispute(h.r, "bob", "late", None).await.unwrap_err();
    assert!(matches!(err, MatchError::AlreadyConfirmed));
}

#[tokio::test]
async fn test_auto_confirm_fires_after_window() {
    let h = setup(LifecycleConfig {
        auto_confirm: Duration::from_millis(300),
        tick: Duration::from_millis(100),
    })
    .await;

    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;

    let record = h.db.get_match_record(h.r).await.unwrap().unwrap();
    assert_eq!(record.status, MatchStatus::Settled);
    assert!(!h.lc.timers().is_armed(h.r));
    assert_eq!(rating(&h, h.alice.id).await, 1017);

    let posts = h.sink.posts();
    assert!(posts
        .iter()
        .any(|(_, n)| matches!(n, Notice::AwaitingConfirmation { .. })));
    assert!(posts.iter().any(|(_, n)| matches!(
        n,
        Notice::ResultConfirmed {
            source: ConfirmSource::Auto,
            ..
        }
    )));
}

#[tokio::test]
async fn test_manual_confirm_cancels_timer() {
    let h = setup(LifecycleConfig {
        auto_confirm: Duration::from_millis(300),
        tick: Duration::from_millis(100),
    })
    .await;

    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();
    h.lc.confirm_result(h.r, "bob").await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let auto = h.sink.posts().iter().filter(|(_, n)| {
        matches!(n, Notice::ResultConfirmed { source: ConfirmSource::Auto, .. })
    }).count();
    assert_eq!(auto, 0);
    assert_eq!(h.db.rating_history(h.alice.id, h.ladder_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_recovery_after_restart() {
    let h = setup(slow()).await;
    let second = queue::open_ladder_match(&h.db, h.sink.as_ref(), h.ladder_id, h.alice.id, h.bob.id)
        .await
        .unwrap();
    let fresh = MatchRef::Ladder(second.id);

    h.lc.report_result(h.r, "alice", score(3, 1)).await.unwrap();
    h.lc.report_result(fresh, "bob", score(2, 0)).await.unwrap();

    // The first report is long past its window
    sqlx::query("UPDATE ladder_matches SET reported_at = '2000-01-01 00:00:00' WHERE id = ?")
        .bind(h.r.id())
        .execute(h.db.pool())
        .await
        .unwrap();

    h.lc.timers().cancel_all();
    let restarted = MatchLifecycle::new(h.db.clone(), h.sink.clone(), slow());
    let recovery = restarted.recover_pending_confirmations().await.unwrap();
    assert_eq!((recovery.confirmed, recovery.rearmed), (1, 1));

    let record = h.db.get_match_record(h.r).await.unwrap().unwrap();
    assert_eq!(record.status, MatchStatus::Settled);
    assert!(restarted.timers().is_armed(fresh));
    assert!(!restarted.timers().is_armed(h.r));
}

#[tokio::test]
async fn test_thread_resolves_to_match() {
    let h = setup(slow()).await;
    let thread = h.db.thread_for_match(h.r).await.unwrap().unwrap();
    assert_eq!(h.lc.resolve_thread(&thread).await.unwrap(), h.r);

    let err = h
        .lc
        .resolve_thread(&ThreadHandle("nowhere".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::NotFound));
}
