// Double-elimination bracket planning: seeding, padding to a power of two,
// and the winners/losers/grand-final link graph.
//
// Everything here is pure. `bracket::BracketService` persists a plan and
// `progression::Progression` walks it once results come in.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Slot;

pub const MIN_PARTICIPANTS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TournamentFormat {
    DoubleElimination,
}

impl TournamentFormat {
    /// Parse the `competitions.format` column. Only double elimination is
    /// planned; anything else stays unstartable.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "double_elimination" => Some(Self::DoubleElimination),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BracketError {
    #[error("at least 4 participants are required, found {0}")]
    NotEnoughParticipants(usize),
    #[error("seed {0} is assigned twice")]
    DuplicateSeed(u32),
    #[error("seeds start at 1")]
    InvalidSeed,
}

/// A registered participant, in registration order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entrant {
    pub player_id: i64,
    pub seed: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketSide {
    Winners,
    Losers,
    GrandFinal,
}

impl BracketSide {
    pub fn as_str(self) -> &'static str {
        match self {
            BracketSide::Winners => "winners",
            BracketSide::Losers => "losers",
            BracketSide::GrandFinal => "grand_final",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "winners" => Some(BracketSide::Winners),
            "losers" => Some(BracketSide::Losers),
            "grand_final" => Some(BracketSide::GrandFinal),
            _ => None,
        }
    }
}

/// Where a match sends one of its players. `target` indexes `BracketPlan::matches`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Link {
    pub target: usize,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMatch {
    pub side: BracketSide,
    pub round: u32,
    pub position: u32,
    pub label: String,
    pub win: Option<Link>,
    pub loss: Option<Link>,
    /// Seeded players for winners round 1. `None` inside is a bye.
    pub seats: Option<[Option<i64>; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BracketPlan {
    pub size: u32,
    pub winners_rounds: u32,
    pub losers_rounds: u32,
    /// (player_id, seed) for every entrant.
    pub seeds: Vec<(i64, u32)>,
    pub matches: Vec<PlannedMatch>,
}

impl BracketPlan {
    pub fn round_count(&self, side: BracketSide, round: u32) -> usize {
        self.matches
            .iter()
            .filter(|m| m.side == side && m.round == round)
            .count()
    }

    pub fn bye_count(&self) -> usize {
        self.matches
            .iter()
            .filter_map(|m| m.seats)
            .filter(|seats| seats.iter().any(|s| s.is_none()))
            .count()
    }
}

// ── Seeding ───────────────────────────────────────────────────────────

/// Smallest power of two that fits `count` players and the highest seed,
/// never below 4.
pub fn bracket_size(count: usize, highest_seed: u32) -> u32 {
    let needed = (count as u32).max(highest_seed).max(MIN_PARTICIPANTS as u32);
    needed.next_power_of_two()
}

/// Seeds in standard bracket order, e.g. `[1, 8, 4, 5, 2, 7, 3, 6]` for 8.
/// Adjacent pairs meet in round 1, so the top seeds face the highest (bye) slots.
pub fn seed_positions(size: u32) -> Vec<u32> {
    let mut positions = vec![1u32];
    while (positions.len() as u32) < size {
        let m = positions.len() as u32 * 2;
        positions = positions.iter().flat_map(|&s| [s, m + 1 - s]).collect();
    }
    positions
}

/// Resolve explicit seeds and fill the rest in arrival order.
///
/// Explicit seeds may leave gaps; unseeded entrants take the lowest empty
/// seed numbers. Returns `(player_id, seed)` in registration order.
pub fn assign_seeds(entrants: &[Entrant]) -> Result<Vec<(i64, u32)>, BracketError> {
    let mut taken = std::collections::HashSet::new();
    for e in entrants {
        if let Some(seed) = e.seed {
            if seed == 0 {
                return Err(BracketError::InvalidSeed);
            }
            if !taken.insert(seed) {
                return Err(BracketError::DuplicateSeed(seed));
            }
        }
    }

    let mut next = 1u32;
    let mut seeds = Vec::with_capacity(entrants.len());
    for e in entrants {
        let seed = match e.seed {
            Some(s) => s,
            None => {
                while taken.contains(&next) {
                    next += 1;
                }
                taken.insert(next);
                next
            }
        };
        seeds.push((e.player_id, seed));
    }
    Ok(seeds)
}

// ── Planning ──────────────────────────────────────────────────────────

fn winners_label(round: u32, rounds: u32) -> String {
    if round == rounds {
        "WB Final".to_string()
    } else {
        format!("WB R{round}")
    }
}

fn losers_label(round: u32, rounds: u32) -> String {
    if round == rounds {
        "LB Final".to_string()
    } else {
        format!("LB R{round}")
    }
}

/// Number of matches in each losers round (index 0 is round 1).
fn losers_round_sizes(size: u32, rounds: u32) -> Vec<u32> {
    let mut sizes: Vec<u32> = Vec::with_capacity(rounds as usize);
    for k in 1..=rounds {
        let count = match k {
            1 => size / 4,
            k if k % 2 == 0 => sizes[(k - 2) as usize],
            _ => sizes[(k - 2) as usize] / 2,
        };
        sizes.push(count);
    }
    sizes
}

/// Build the full double-elimination plan for the given entrants.
pub fn plan_double_elimination(entrants: &[Entrant]) -> Result<BracketPlan, BracketError> {
    if entrants.len() < MIN_PARTICIPANTS {
        return Err(BracketError::NotEnoughParticipants(entrants.len()));
    }

    let seeds = assign_seeds(entrants)?;
    let highest = seeds.iter().map(|&(_, s)| s).max().unwrap_or(0);
    let size = bracket_size(entrants.len(), highest);
    let winners_rounds = size.trailing_zeros();
    let losers_rounds = 2 * (winners_rounds - 1);

    let mut by_seed: Vec<Option<i64>> = vec![None; size as usize];
    for &(player, seed) in &seeds {
        by_seed[(seed - 1) as usize] = Some(player);
    }
    let positions = seed_positions(size);

    let mut matches = Vec::new();
    let mut wb: Vec<Vec<usize>> = Vec::new();
    let mut lb: Vec<Vec<usize>> = Vec::new();

    for r in 1..=winners_rounds {
        let count = size >> r;
        let mut ids = Vec::with_capacity(count as usize);
        for j in 0..count {
            let seats = (r == 1).then(|| {
                let a = positions[(2 * j) as usize];
                let b = positions[(2 * j + 1) as usize];
                [by_seed[(a - 1) as usize], by_seed[(b - 1) as usize]]
            });
            ids.push(matches.len());
            matches.push(PlannedMatch {
                side: BracketSide::Winners,
                round: r,
                position: j,
                label: winners_label(r, winners_rounds),
                win: None,
                loss: None,
                seats,
            });
        }
        wb.push(ids);
    }

    for (k, count) in losers_round_sizes(size, losers_rounds).into_iter().enumerate() {
        let round = k as u32 + 1;
        let mut ids = Vec::with_capacity(count as usize);
        for j in 0..count {
            ids.push(matches.len());
            matches.push(PlannedMatch {
                side: BracketSide::Losers,
                round,
                position: j,
                label: losers_label(round, losers_rounds),
                win: None,
                loss: None,
                seats: None,
            });
        }
        lb.push(ids);
    }

    let grand_final = matches.len();
    matches.push(PlannedMatch {
        side: BracketSide::GrandFinal,
        round: winners_rounds + 1,
        position: 0,
        label: "Grand Final".to_string(),
        win: None,
        loss: None,
        seats: None,
    });

    // Winners bracket
    for r in 0..wb.len() {
        for (j, &id) in wb[r].iter().enumerate() {
            let j = j as u32;
            matches[id].win = Some(if r + 1 < wb.len() {
                Link {
                    target: wb[r + 1][(j / 2) as usize],
                    slot: Slot::for_index(j),
                }
            } else {
                Link {
                    target: grand_final,
                    slot: Slot::One,
                }
            });
            matches[id].loss = Some(if r == 0 {
                Link {
                    target: lb[0][(j / 2) as usize],
                    slot: Slot::for_index(j),
                }
            } else {
                // WB round r+1 (1-based) drops into LB round 2(r+1) - 2
                Link {
                    target: lb[2 * r - 1][j as usize],
                    slot: Slot::Two,
                }
            });
        }
    }

    // Losers bracket
    for k in 0..lb.len() {
        let round = k + 1;
        for (j, &id) in lb[k].iter().enumerate() {
            let j = j as u32;
            matches[id].win = Some(if k + 1 == lb.len() {
                Link {
                    target: grand_final,
                    slot: Slot::Two,
                }
            } else if round % 2 == 1 {
                Link {
                    target: lb[k + 1][j as usize],
                    slot: Slot::One,
                }
            } else {
                Link {
                    target: lb[k + 1][(j / 2) as usize],
                    slot: Slot::for_index(j),
                }
            });
        }
    }

    Ok(BracketPlan {
        size,
        winners_rounds,
        losers_rounds,
        seeds,
        matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entrants(n: usize) -> Vec<Entrant> {
        (1..=n as i64)
            .map(|player_id| Entrant {
                player_id,
                seed: None,
            })
            .collect()
    }

    #[test]
    fn test_format_names() {
        assert_eq!(
            TournamentFormat::from_str_name("double_elimination"),
            Some(TournamentFormat::DoubleElimination)
        );
        assert!(TournamentFormat::from_str_name("swiss").is_none());
    }

    #[test]
    fn test_bracket_sizes() {
        assert_eq!(bracket_size(4, 0), 4);
        assert_eq!(bracket_size(5, 0), 8);
        assert_eq!(bracket_size(8, 0), 8);
        assert_eq!(bracket_size(6, 0), 8);
        assert_eq!(bracket_size(2, 0), 4);
        // A high explicit seed widens the bracket
        assert_eq!(bracket_size(4, 9), 16);
    }

    #[test]
    fn test_seed_positions_standard_order() {
        assert_eq!(seed_positions(4), vec![1, 4, 2, 3]);
        assert_eq!(seed_positions(8), vec![1, 8, 4, 5, 2, 7, 3, 6]);
    }

    #[test]
    fn test_assign_seeds_fills_gaps_in_arrival_order() {
        let input = vec![
            Entrant { player_id: 10, seed: None },
            Entrant { player_id: 11, seed: Some(1) },
            Entrant { player_id: 12, seed: Some(3) },
            Entrant { player_id: 13, seed: None },
        ];
        let seeds = assign_seeds(&input).unwrap();
        assert_eq!(seeds, vec![(10, 2), (11, 1), (12, 3), (13, 4)]);
    }

    #[test]
    fn test_assign_seeds_rejects_duplicates() {
        let input = vec![
            Entrant { player_id: 1, seed: Some(2) },
            Entrant { player_id: 2, seed: Some(2) },
        ];
        assert_eq!(assign_seeds(&input), Err(BracketError::DuplicateSeed(2)));
        let zero = vec![Entrant { player_id: 1, seed: Some(0) }];
        assert_eq!(assign_seeds(&zero), Err(BracketError::InvalidSeed));
    }

    #[test]
    fn test_rejects_fewer_than_four() {
        assert_eq!(
            plan_double_elimination(&entrants(3)),
            Err(BracketError::NotEnoughParticipants(3))
        );
    }

    #[test]
    fn test_total_match_counts() {
        for (n, size) in [(4, 4), (5, 8), (6, 8), (8, 8), (9, 16)] {
            let plan = plan_double_elimination(&entrants(n)).unwrap();
            assert_eq!(plan.size, size);
            assert_eq!(plan.matches.len(), 2 * size as usize - 2, "n = {n}");
        }
    }

    #[test]
    fn test_round_counts_for_eight() {
        let plan = plan_double_elimination(&entrants(8)).unwrap();
        assert_eq!(plan.winners_rounds, 3);
        assert_eq!(plan.losers_rounds, 4);
        let wb: Vec<_> = (1..=3)
            .map(|r| plan.round_count(BracketSide::Winners, r))
            .collect();
        let lb: Vec<_> = (1..=4)
            .map(|r| plan.round_count(BracketSide::Losers, r))
            .collect();
        assert_eq!(wb, vec![4, 2, 1]);
        assert_eq!(lb, vec![2, 2, 1, 1]);
        assert_eq!(plan.round_count(BracketSide::GrandFinal, 4), 1);
    }

    #[test]
    fn test_round_counts_for_four() {
        let plan = plan_double_elimination(&entrants(4)).unwrap();
        assert_eq!(plan.winners_rounds, 2);
        assert_eq!(plan.losers_rounds, 2);
        assert_eq!(plan.round_count(BracketSide::Losers, 1), 1);
        assert_eq!(plan.round_count(BracketSide::Losers, 2), 1);
        assert_eq!(plan.bye_count(), 0);
    }

    #[test]
    fn test_five_entrants_get_three_byes_against_top_seeds() {
        let plan = plan_double_elimination(&entrants(5)).unwrap();
        assert_eq!(plan.bye_count(), 3);
        let firsts: Vec<_> = plan.matches.iter().filter_map(|m| m.seats).collect();
        assert_eq!(firsts[0], [Some(1), None]);
        assert_eq!(firsts[1], [Some(4), Some(5)]);
        assert_eq!(firsts[2], [Some(2), None]);
        assert_eq!(firsts[3], [Some(3), None]);
    }

    #[test]
    fn test_links_for_eight() {
        let plan = plan_double_elimination(&entrants(8)).unwrap();
        let find = |side, round, position| {
            plan.matches
                .iter()
                .position(|m| m.side == side && m.round == round && m.position == position)
                .unwrap()
        };
        let wb1_3 = &plan.matches[find(BracketSide::Winners, 1, 3)];
        assert_eq!(
            wb1_3.win,
            Some(Link { target: find(BracketSide::Winners, 2, 1), slot: Slot::Two })
        );
        assert_eq!(
            wb1_3.loss,
            Some(Link { target: find(BracketSide::Losers, 1, 1), slot: Slot::Two })
        );

        let wb2_1 = &plan.matches[find(BracketSide::Winners, 2, 1)];
        assert_eq!(
            wb2_1.loss,
            Some(Link { target: find(BracketSide::Losers, 2, 1), slot: Slot::Two })
        );

        let wb_final = &plan.matches[find(BracketSide::Winners, 3, 0)];
        let gf = find(BracketSide::GrandFinal, 4, 0);
        assert_eq!(wb_final.win, Some(Link { target: gf, slot: Slot::One }));
        assert_eq!(
            wb_final.loss,
            Some(Link { target: find(BracketSide::Losers, 4, 0), slot: Slot::Two })
        );

        let lb1_1 = &plan.matches[find(BracketSide::Losers, 1, 1)];
        assert_eq!(
            lb1_1.win,
            Some(Link { target: find(BracketSide::Losers, 2, 1), slot: Slot::One })
        );
        let lb2_1 = &plan.matches[find(BracketSide::Losers, 2, 1)];
        assert_eq!(
            lb2_1.win,
            Some(Link { target: find(BracketSide::Losers, 3, 0), slot: Slot::Two })
        );
        let lb_final = &plan.matches[find(BracketSide::Losers, 4, 0)];
        assert_eq!(lb_final.win, Some(Link { target: gf, slot: Slot::Two }));
        assert_eq!(lb_final.label, "LB Final");
        assert!(lb_final.loss.is_none());
        assert!(plan.matches[gf].win.is_none());
    }

    #[test]
    fn test_every_slot_is_fed_once() {
        let plan = plan_double_elimination(&entrants(8)).unwrap();
        let mut feeds = std::collections::HashMap::new();
        for m in &plan.matches {
            for link in [m.win, m.loss].into_iter().flatten() {
                *feeds.entry((link.target, link.slot)).or_insert(0) += 1;
            }
        }
        for (idx, m) in plan.matches.iter().enumerate() {
            if m.seats.is_some() {
                continue;
            }
            assert_eq!(feeds.get(&(idx, Slot::One)), Some(&1), "{}", m.label);
            assert_eq!(feeds.get(&(idx, Slot::Two)), Some(&1), "{}", m.label);
        }
    }
}
