// Per-player stat bookkeeping applied on confirm and reverted on cancel.

use crate::db::{PlayerRating, RatingHistory};
use crate::elo::Outcome;

const POINTS_WIN: i32 = 3;
const POINTS_DRAW: i32 = 1;

/// One player's side of a confirmed result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PlayerResult {
    pub outcome: Outcome,
    pub goals_for: i32,
    pub goals_against: i32,
}

impl PlayerResult {
    fn points(&self) -> i32 {
        match self.outcome {
            Outcome::Win => POINTS_WIN,
            Outcome::Draw => POINTS_DRAW,
            Outcome::Loss => 0,
        }
    }
}

/// Apply a result and the new rating to a rating record.
pub(crate) fn apply(record: &mut PlayerRating, result: PlayerResult, new_rating: i32) {
    record.rating = new_rating;
    record.games_played += 1;
    match result.outcome {
        Outcome::Win => record.wins += 1,
        Outcome::Draw => record.draws += 1,
        Outcome::Loss => record.losses += 1,
    }
    record.goals_scored += result.goals_for;
    record.goals_conceded += result.goals_against;
    record.points += result.points();
    record.win_streak = if result.outcome == Outcome::Win {
        record.win_streak + 1
    } else {
        0
    };
}

/// Undo `apply`: rating and streak come back from history, counters are
/// decremented and never go below zero.
pub(crate) fn revert(record: &mut PlayerRating, result: PlayerResult, history: &RatingHistory) {
    fn dec(value: &mut i32, by: i32) {
        *value = (*value - by).max(0);
    }

    record.rating = history.rating_before;
    record.win_streak = history.win_streak_before;
    dec(&mut record.games_played, 1);
    match result.outcome {
        Outcome::Win => dec(&mut record.wins, 1),
        Outcome::Draw => dec(&mut record.draws, 1),
        Outcome::Loss => dec(&mut record.losses, 1),
    }
    dec(&mut record.goals_scored, result.goals_for);
    dec(&mut record.goals_conceded, result.goals_against);
    dec(&mut record.points, result.points());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> PlayerRating {
        PlayerRating {
            player_id: 1,
            ladder_id: 1,
            rating: 1000,
            games_played: 0,
            wins: 0,
            draws: 0,
            losses: 0,
            goals_scored: 0,
            goals_conceded: 0,
            points: 0,
            win_streak: 2,
            last_played: None,
        }
    }

    fn history(before: &PlayerRating, after: i32) -> RatingHistory {
        RatingHistory {
            id: 1,
            match_id: Some(1),
            ladder_id: 1,
            player_id: 1,
            rating_before: before.rating,
            rating_after: after,
            delta: after - before.rating,
            win_streak_before: before.win_streak,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_apply_win() {
        let mut r = fresh();
        let res = PlayerResult {
            outcome: Outcome::Win,
            goals_for: 3,
            goals_against: 1,
        };
        apply(&mut r, res, 1017);
        assert_eq!(r.rating, 1017);
        assert_eq!((r.games_played, r.wins, r.points, r.win_streak), (1, 1, 3, 3));
        assert_eq!((r.goals_scored, r.goals_conceded), (3, 1));
    }

    #[test]
    fn test_loss_resets_streak() {
        let mut r = fresh();
        let res = PlayerResult {
            outcome: Outcome::Loss,
            goals_for: 0,
            goals_against: 2,
        };
        apply(&mut r, res, 990);
        assert_eq!(r.win_streak, 0);
        assert_eq!(r.losses, 1);
        assert_eq!(r.points, 0);
    }

    #[test]
    fn test_revert_restores_exactly() {
        let before = fresh();
        let mut r = before.clone();
        let res = PlayerResult {
            outcome: Outcome::Draw,
            goals_for: 1,
            goals_against: 1,
        };
        apply(&mut r, res, 1003);
        let h = history(&before, 1003);
        revert(&mut r, res, &h);
        assert_eq!(r, before);
    }

    #[test]
    fn test_revert_never_goes_negative() {
        let mut r = fresh();
        let res = PlayerResult {
            outcome: Outcome::Win,
            goals_for: 5,
            goals_against: 0,
        };
        let h = history(&r, 1020);
        revert(&mut r, res, &h);
        assert_eq!((r.games_played, r.wins, r.goals_scored, r.points), (0, 0, 0, 0));
    }
}
