// Shared match identifiers and status vocabulary used by the store, the
// lifecycle state machine and the bracket engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which table a match lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Ladder,
    Tournament,
}

impl MatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchKind::Ladder => "ladder",
            MatchKind::Tournament => "tournament",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "ladder" => Some(MatchKind::Ladder),
            "tournament" => Some(MatchKind::Tournament),
            _ => None,
        }
    }

    pub(crate) fn table(self) -> &'static str {
        match self {
            MatchKind::Ladder => "ladder_matches",
            MatchKind::Tournament => "tournament_matches",
        }
    }
}

/// A match reference resolved once (normally through the thread registry)
/// and then dispatched on. Ladder and tournament ids share no namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MatchRef {
    Ladder(i64),
    Tournament(i64),
}

impl MatchRef {
    pub fn new(kind: MatchKind, id: i64) -> Self {
        match kind {
            MatchKind::Ladder => MatchRef::Ladder(id),
            MatchKind::Tournament => MatchRef::Tournament(id),
        }
    }

    pub fn kind(self) -> MatchKind {
        match self {
            MatchRef::Ladder(_) => MatchKind::Ladder,
            MatchRef::Tournament(_) => MatchKind::Tournament,
        }
    }

    pub fn id(self) -> i64 {
        match self {
            MatchRef::Ladder(id) | MatchRef::Tournament(id) => id,
        }
    }
}

impl fmt::Display for MatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} match #{}", self.kind().as_str(), self.id())
    }
}

/// Lifecycle state of a match, independent of which table stores it.
///
/// The two tables spell the open and settled states differently
/// (`pending`/`confirmed` for ladder, `scheduled`/`completed` for brackets),
/// so conversion always goes through the match kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Open,
    Reported,
    Disputed,
    Settled,
    Cancelled,
}

impl MatchStatus {
    pub fn as_db_str(self, kind: MatchKind) -> &'static str {
        match (self, kind) {
            (MatchStatus::Open, MatchKind::Ladder) => "pending",
            (MatchStatus::Open, MatchKind::Tournament) => "scheduled",
            (MatchStatus::Reported, _) => "reported",
            (MatchStatus::Disputed, _) => "disputed",
            (MatchStatus::Settled, MatchKind::Ladder) => "confirmed",
            (MatchStatus::Settled, MatchKind::Tournament) => "completed",
            (MatchStatus::Cancelled, _) => "cancelled",
        }
    }

    pub fn from_db_str(kind: MatchKind, s: &str) -> Option<Self> {
        match (s, kind) {
            ("pending", MatchKind::Ladder) | ("scheduled", MatchKind::Tournament) => {
                Some(MatchStatus::Open)
            }
            ("reported", _) => Some(MatchStatus::Reported),
            ("disputed", _) => Some(MatchStatus::Disputed),
            ("confirmed", MatchKind::Ladder) | ("completed", MatchKind::Tournament) => {
                Some(MatchStatus::Settled)
            }
            ("cancelled", MatchKind::Ladder) => Some(MatchStatus::Cancelled),
            _ => None,
        }
    }
}

/// Participant slot within a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    One,
    Two,
}

impl Slot {
    /// Slot fed by the child at `index` within its round.
    pub fn for_index(index: u32) -> Self {
        if index % 2 == 0 {
            Slot::One
        } else {
            Slot::Two
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Slot::One => 1,
            Slot::Two => 2,
        }
    }

    pub fn from_i32(n: i32) -> Option<Self> {
        match n {
            1 => Some(Slot::One),
            2 => Some(Slot::Two),
            _ => None,
        }
    }
}

/// Opaque handle of a discussion thread on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadHandle(pub String);

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who settled a reported result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ConfirmSource {
    Manual { confirmer: String },
    Auto,
}

impl ConfirmSource {
    pub fn label(&self) -> &'static str {
        match self {
            ConfirmSource::Manual { .. } => "manual",
            ConfirmSource::Auto => "auto",
        }
    }
}

/// Rating movement of one player caused by a confirmed ladder match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingChange {
    pub player_id: i64,
    pub before: i32,
    pub after: i32,
    pub delta: i32,
    /// The loss was absorbed by checkpoint protection.
    pub checkpoint: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_source_labels() {
        let manual = ConfirmSource::Manual {
            confirmer: "7".into(),
        };
        assert_eq!(manual.label(), "manual");
        assert_eq!(ConfirmSource::Auto.label(), "auto");
        let json = serde_json::to_value(&manual).unwrap();
        assert_eq!(json["source"], "manual");
        assert_eq!(json["confirmer"], "7");
    }

    #[test]
    fn test_status_round_trips_per_kind() {
        for kind in [MatchKind::Ladder, MatchKind::Tournament] {
            for status in [
                MatchStatus::Open,
                MatchStatus::Reported,
                MatchStatus::Disputed,
                MatchStatus::Settled,
            ] {
                assert_eq!(
                    MatchStatus::from_db_str(kind, status.as_db_str(kind)),
                    Some(status)
                );
            }
        }
    }

    #[test]
    fn test_status_spelling_differs_by_kind() {
        assert_eq!(MatchStatus::Open.as_db_str(MatchKind::Ladder), "pending");
        assert_eq!(MatchStatus::Open.as_db_str(MatchKind::Tournament), "scheduled");
        assert_eq!(MatchStatus::Settled.as_db_str(MatchKind::Ladder), "confirmed");
        assert_eq!(
            MatchStatus::Settled.as_db_str(MatchKind::Tournament),
            "completed"
        );
        // Brackets never use the ladder spelling
        assert_eq!(MatchStatus::from_db_str(MatchKind::Tournament, "pending"), None);
        assert_eq!(MatchStatus::from_db_str(MatchKind::Tournament, "cancelled"), None);
    }

    #[test]
    fn test_slot_parity() {
        assert_eq!(Slot::for_index(0), Slot::One);
        assert_eq!(Slot::for_index(1), Slot::Two);
        assert_eq!(Slot::for_index(6), Slot::One);
        assert_eq!(Slot::from_i32(2), Some(Slot::Two));
        assert_eq!(Slot::from_i32(3), None);
    }

    #[test]
    fn test_match_ref_serializes_tagged() {
        let json = serde_json::to_value(MatchRef::Tournament(7)).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "tournament", "id": 7 }));
        assert_eq!(MatchRef::Ladder(3).to_string(), "ladder match #3");
    }
}
