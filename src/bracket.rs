// Tournament setup: registration, seeding, and writing a planned
// double-elimination bracket into the store.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::db::tournament as store;
use crate::db::{finish, Competition, Database, Participant};
use crate::error::MatchError;
use crate::models::Slot;
use crate::notify::NotificationSink;
use crate::progression::Progression;
use crate::tournament::{self, Entrant, TournamentFormat, MIN_PARTICIPANTS};

/// How seeds are handed out before a bracket starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedingMethod {
    /// Registration order.
    Registration,
    /// Ladder rating, highest first. Unrated players go last.
    Ladder,
    Random,
}

impl SeedingMethod {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "registration" => Some(Self::Registration),
            "ladder" => Some(Self::Ladder),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

/// Result of starting a bracket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BracketStart {
    pub matches_created: usize,
    pub byes_resolved: usize,
    pub threads_opened: usize,
}

pub struct BracketService {
    db: Arc<Database>,
    progression: Progression,
}

impl BracketService {
    pub fn new(db: Arc<Database>, sink: Arc<dyn NotificationSink>) -> Self {
        let progression = Progression::new(db.clone(), sink);
        Self { db, progression }
    }

    pub fn progression(&self) -> &Progression {
        &self.progression
    }

    async fn draft(&self, competition_id: i64) -> Result<Competition, MatchError> {
        let competition = self
            .db
            .get_competition(competition_id)
            .await?
            .ok_or(MatchError::NotFound)?;
        if competition.status != "draft" {
            return Err(MatchError::WrongState(competition.status));
        }
        Ok(competition)
    }

    /// Sign a registered player up for a competition that has not started.
    pub async fn register_participant(
        &self,
        competition_id: i64,
        discord_id: &str,
    ) -> Result<Participant, MatchError> {
        self.draft(competition_id).await?;
        let player = self
            .db
            .resolve_player(discord_id)
            .await?
            .ok_or(MatchError::NotRegistered)?;
        let participant = self.db.add_participant(competition_id, player.id).await?;
        tracing::info!(
            "Player {} ({}) joined competition {competition_id}",
            player.id,
            player.gamertag
        );
        Ok(participant)
    }

    /// Assign seeds 1..n to every participant. Returns them in seed order.
    pub async fn generate_seeding(
        &self,
        competition_id: i64,
        method: SeedingMethod,
        ladder_id: Option<i64>,
    ) -> Result<Vec<Participant>, MatchError> {
        self.draft(competition_id).await?;
        let mut participants = self.db.list_participants(competition_id).await?;

        match method {
            SeedingMethod::Registration => {}
            SeedingMethod::Ladder => {
                let ladder_id = ladder_id.ok_or(MatchError::MissingLadder)?;
                if self.db.get_ladder(ladder_id).await?.is_none() {
                    return Err(MatchError::NotFound);
                }
                let mut rated = Vec::with_capacity(participants.len());
                for p in participants {
                    let rating = self.db.get_rating(p.player_id, ladder_id).await?;
                    rated.push((rating.map(|r| r.rating), p));
                }
                // Stable: equal ratings keep registration order
                rated.sort_by_key(|(rating, _)| std::cmp::Reverse(rating.unwrap_or(i32::MIN)));
                participants = rated.into_iter().map(|(_, p)| p).collect();
            }
            SeedingMethod::Random => {
                participants.shuffle(&mut rand::thread_rng());
            }
        }

        let mut tx = self.db.begin().await?;
        let result: Result<(), MatchError> = async {
            for (index, p) in participants.iter_mut().enumerate() {
                let seed = index as i32 + 1;
                store::set_seed(&mut tx, competition_id, p.player_id, seed).await?;
                p.seed = Some(seed);
            }
            Ok(())
        }
        .await;
        finish(tx, result, "seeding").await?;

        tracing::info!(
            "Seeded {} participants of competition {competition_id} by {method:?}",
            participants.len()
        );
        Ok(participants)
    }

    /// Build the bracket, move the competition to active, settle the byes
    /// and open threads for every playable first-round match.
    pub async fn start_bracket(&self, competition_id: i64) -> Result<BracketStart, MatchError> {
        let competition = self.draft(competition_id).await?;
        let Some(format) = TournamentFormat::from_str_name(&competition.format) else {
            return Err(MatchError::WrongState(format!(
                "using unsupported format {}",
                competition.format
            )));
        };
        let participants = self.db.list_participants(competition_id).await?;
        if participants.len() < MIN_PARTICIPANTS {
            return Err(MatchError::NotEnoughParticipants {
                count: participants.len(),
            });
        }

        let entrants: Vec<Entrant> = participants
            .iter()
            .map(|p| Entrant {
                player_id: p.player_id,
                // Zero and negative seeds are rejected by the planner
                seed: p.seed.map(|s| u32::try_from(s).unwrap_or(0)),
            })
            .collect();
        let plan = tournament::plan_double_elimination(&entrants)?;

        let mut tx = self.db.begin().await?;
        let result: Result<(), MatchError> = async {
            if !store::set_competition_status(&mut tx, competition_id, "draft", "active").await? {
                return Err(MatchError::WrongState("already started".into()));
            }

            let mut ids = Vec::with_capacity(plan.matches.len());
            for planned in &plan.matches {
                ids.push(store::insert_bracket_match(&mut tx, competition_id, planned).await?);
            }
            for (planned, &id) in plan.matches.iter().zip(&ids) {
                let win = planned.win.map(|l| (ids[l.target], l.slot));
                let loss = planned.loss.map(|l| (ids[l.target], l.slot));
                store::link_bracket_match(&mut tx, id, win, loss).await?;
                if let Some([one, two]) = planned.seats {
                    store::fill_slot(&mut tx, id, Slot::One, one).await?;
                    store::fill_slot(&mut tx, id, Slot::Two, two).await?;
                }
            }
            for &(player_id, seed) in &plan.seeds {
                store::set_seed(&mut tx, competition_id, player_id, seed as i32).await?;
            }
            Ok(())
        }
        .await;
        finish(tx, result, "bracket start").await?;

        tracing::info!(
            "Competition {competition_id} started as {format:?}: {} entrants, bracket of {}, {} matches, {} byes",
            participants.len(),
            plan.size,
            plan.matches.len(),
            plan.bye_count()
        );

        // The bracket is committed; anything left here is retried by the
        // start-up sweep
        let mut start = BracketStart {
            matches_created: plan.matches.len(),
            ..BracketStart::default()
        };
        match self.progression.resolve_byes(competition_id).await {
            Ok(advance) => {
                start.byes_resolved = advance.byes_resolved;
                start.threads_opened = advance.threads_opened;
            }
            Err(e) => tracing::error!("Resolving byes of competition {competition_id} failed: {e}"),
        }
        match self.progression.open_threads(competition_id).await {
            Ok(opened) => start.threads_opened += opened,
            Err(e) => tracing::error!("Opening threads of competition {competition_id} failed: {e}"),
        }
        Ok(start)
    }
}
