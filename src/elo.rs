// Elo rating calculation for 1v1 ladder matches.
//
// Tiered K-factors (winners and losers use different ladders), a flat win
// bonus, a goal-margin multiplier, an anti-farming cap and the checkpoint
// rule that absorbs a loss for recovering players.

use serde::{Deserialize, Serialize};

pub const STARTING_ELO: i32 = 1000;

/// Rating gap at or below which both players are treated as dead even.
const EVEN_MATCH_WINDOW: i32 = 15;
const LOGISTIC_DIVISOR: f64 = 700.0;

const WIN_BONUS: f64 = 5.0;
const GOAL_BONUS_PER_GOAL: f64 = 0.05;
const GOAL_BONUS_CAP: f64 = 0.75;

/// Winners rated this far above the loser gain at most `FARM_CAP`.
const FARM_GAP: i32 = 300;
const FARM_CAP: f64 = 5.0;

const CHECKPOINT_STREAK: i32 = 3;
const CHECKPOINT_CEILING: i32 = 1000;

/// Match outcome from perspective of one player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win,
    Draw,
    Loss,
}

impl Outcome {
    pub fn score(self) -> f64 {
        match self {
            Outcome::Win => 1.0,
            Outcome::Draw => 0.5,
            Outcome::Loss => 0.0,
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Outcome::Win => Outcome::Loss,
            Outcome::Draw => Outcome::Draw,
            Outcome::Loss => Outcome::Win,
        }
    }
}

/// Base K-factor for a player's rating band and role.
fn k_factor(rating: i32, is_winner: bool) -> f64 {
    let bands = [900, 950, 1000, 1050, 1100, 1150, 1200, 1250, 1300];
    let table: [f64; 10] = if is_winner {
        [30.0, 28.0, 25.0, 22.0, 20.0, 18.0, 16.0, 17.0, 15.0, 14.0]
    } else {
        [22.0, 23.0, 24.0, 25.0, 27.0, 30.0, 33.0, 36.0, 40.0, 44.0]
    };
    let band = bands
        .iter()
        .position(|&upper| rating < upper)
        .unwrap_or(bands.len());
    table[band]
}

/// Calculate expected score for player A against player B.
pub fn expected_score(rating_a: i32, rating_b: i32) -> f64 {
    if (rating_a - rating_b).abs() <= EVEN_MATCH_WINDOW {
        return 0.5;
    }
    1.0 / (1.0 + 10.0_f64.powf((rating_b - rating_a) as f64 / LOGISTIC_DIVISOR))
}

/// Whether a loss at this rating and streak is fully absorbed.
pub fn is_checkpoint(rating: i32, win_streak: i32, outcome: Outcome) -> bool {
    outcome == Outcome::Loss && win_streak >= CHECKPOINT_STREAK && rating < CHECKPOINT_CEILING
}

/// Calculate new rating after a 1v1 match.
pub fn calculate_new_rating(
    rating: i32,
    opponent_rating: i32,
    outcome: Outcome,
    goal_diff: i32,
    win_streak: i32,
    is_winner: bool,
) -> i32 {
    if is_checkpoint(rating, win_streak, outcome) {
        return rating;
    }

    let expected = expected_score(rating, opponent_rating);
    let goal_bonus = if is_winner {
        (goal_diff.abs() as f64 * GOAL_BONUS_PER_GOAL).min(GOAL_BONUS_CAP)
    } else {
        0.0
    };
    let k = k_factor(rating, is_winner) * (1.0 + goal_bonus);
    let mut delta = k * (outcome.score() - expected);

    if is_winner {
        if outcome == Outcome::Win {
            delta += WIN_BONUS;
        }
        if rating - opponent_rating >= FARM_GAP {
            delta = delta.min(FARM_CAP);
        }
    }

    (rating as f64 + delta).round() as i32
}
