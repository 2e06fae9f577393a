// Error type shared by the lifecycle, bracket and progression services.

use thiserror::Error;

use crate::tournament::BracketError;

/// Every failure a match or bracket operation can surface. `kind()` is the
/// stable identifier handed to the command layer.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("match or competition not found")]
    NotFound,
    #[error("operation not allowed while the match is {0}")]
    WrongState(String),
    #[error("you are not a participant in this match")]
    NotParticipant,
    #[error("player is not registered")]
    NotRegistered,
    #[error("match is under dispute and awaits an admin")]
    Disputed,
    #[error("draws must include both tie-break scores")]
    DrawRejected,
    #[error("tie-break scores cannot be equal")]
    TieBreakInvalid,
    #[error("match result was already confirmed")]
    AlreadyConfirmed,
    #[error("you are not allowed to perform this action")]
    Unauthorized,
    #[error("match changed while the command was running, try again")]
    ConcurrentModification,
    #[error("at least 4 participants are required, found {count}")]
    NotEnoughParticipants { count: usize },
    #[error("invalid seeding: {0}")]
    InvalidSeeding(String),
    #[error("ladder seeding needs a ladder id")]
    MissingLadder,
    #[error("internal error: {0}")]
    Internal(#[from] sqlx::Error),
}

impl MatchError {
    /// Stable snake_case identifier for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            MatchError::NotFound => "not_found",
            MatchError::WrongState(_) => "wrong_state",
            MatchError::NotParticipant => "not_participant",
            MatchError::NotRegistered => "not_registered",
            MatchError::Disputed => "disputed",
            MatchError::DrawRejected => "draw_rejected",
            MatchError::TieBreakInvalid => "tie_break_invalid",
            MatchError::AlreadyConfirmed => "already_confirmed",
            MatchError::Unauthorized => "unauthorized",
            MatchError::ConcurrentModification => "concurrent_modification",
            MatchError::NotEnoughParticipants { .. } => "not_enough_participants",
            MatchError::InvalidSeeding(_) => "invalid_seeding",
            MatchError::MissingLadder => "missing_ladder",
            MatchError::Internal(_) => "internal_error",
        }
    }
}

impl From<BracketError> for MatchError {
    fn from(e: BracketError) -> Self {
        match e {
            BracketError::NotEnoughParticipants(count) => {
                MatchError::NotEnoughParticipants { count }
            }
            other => MatchError::InvalidSeeding(other.to_string()),
        }
    }
}
