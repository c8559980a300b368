//! Aim-assist targeting - continuous lock feedback and fire resolution

pub mod heading;

pub use heading::HeadingSource;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use uuid::Uuid;

use crate::geo::angle_diff;
use crate::presence::{Player, PlayerStatus};

/// Widest band: anything beyond this is not tracked at all
pub const APPROACH_ANGLE_DEG: f64 = 38.0;

/// At or inside this band the target is locking
pub const LOCKING_ANGLE_DEG: f64 = 24.0;

/// At or inside this band the target is locked, and a shot hits
pub const LOCKED_ANGLE_DEG: f64 = 14.0;

/// Aim-assist phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AimPhase {
    None,
    Tracking,
    Locking,
    Locked,
}

/// Current best-target snapshot, replaced wholesale on every recompute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AimAssistState {
    pub phase: AimPhase,
    pub target_id: Option<Uuid>,
    pub target_name: Option<String>,
    pub distance_m: Option<f64>,
    pub angle_difference: Option<f64>,
    /// 0.0 (edge of approach band) to 1.0 (dead on)
    pub progress: f64,
}

impl AimAssistState {
    pub fn none() -> Self {
        Self {
            phase: AimPhase::None,
            target_id: None,
            target_name: None,
            distance_m: None,
            angle_difference: None,
            progress: 0.0,
        }
    }
}

impl Default for AimAssistState {
    fn default() -> Self {
        Self::none()
    }
}

/// Running fire statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FireStats {
    pub shots: u32,
    pub hits: u32,
    pub streak: u32,
    pub last_hit_name: Option<String>,
}

/// Result of one fire action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FireOutcome {
    /// Heading the shot was fired at
    pub heading: f64,
    pub target_id: Option<Uuid>,
    pub target_name: Option<String>,
    pub distance_m: Option<f64>,
    pub stats: FireStats,
}

impl FireOutcome {
    pub fn is_hit(&self) -> bool {
        self.target_id.is_some()
    }
}

fn ranked<'a>(heading: f64, candidates: &'a [Player]) -> Option<(&'a Player, f64)> {
    candidates
        .iter()
        .map(|p| (p, angle_diff(heading, p.heading)))
        .min_by(|(a, angle_a), (b, angle_b)| {
            angle_a
                .total_cmp(angle_b)
                .then_with(|| a.distance_m.total_cmp(&b.distance_m))
        })
}

/// Evaluate the aim-assist state for a heading against candidates.
/// Ranking is by angle, then distance.
pub fn evaluate(heading: f64, candidates: &[Player]) -> AimAssistState {
    let Some((best, angle)) = ranked(heading, candidates) else {
        return AimAssistState::none();
    };
    if angle > APPROACH_ANGLE_DEG {
        return AimAssistState::none();
    }

    let phase = if angle <= LOCKED_ANGLE_DEG {
        AimPhase::Locked
    } else if angle <= LOCKING_ANGLE_DEG {
        AimPhase::Locking
    } else {
        AimPhase::Tracking
    };

    AimAssistState {
        phase,
        target_id: Some(best.id),
        target_name: Some(best.name.clone()),
        distance_m: Some(best.distance_m),
        angle_difference: Some(angle),
        progress: (1.0 - angle / APPROACH_ANGLE_DEG).clamp(0.0, 1.0),
    }
}

/// Pick the nearest candidate inside the locked band, if any
pub fn resolve_fire(heading: f64, candidates: &[Player]) -> Option<&Player> {
    candidates
        .iter()
        .filter(|p| angle_diff(heading, p.heading) <= LOCKED_ANGLE_DEG)
        .min_by(|a, b| a.distance_m.total_cmp(&b.distance_m))
}

/// Owns heading, candidates, the aim snapshot, and fire stats
pub struct TargetingEngine {
    heading: HeadingSource,
    candidates: Vec<Player>,
    aim: AimAssistState,
    stats: FireStats,
    seeds: ChaCha8Rng,
}

impl TargetingEngine {
    /// Starts in simulated-heading mode until a live heading arrives
    pub fn new(seed: u64) -> Self {
        let mut seeds = ChaCha8Rng::seed_from_u64(seed);
        let start = seeds.gen_range(0.0..360.0);
        let sim_seed = seeds.gen();
        Self {
            heading: HeadingSource::simulated(sim_seed, start),
            candidates: Vec::new(),
            aim: AimAssistState::none(),
            stats: FireStats::default(),
            seeds,
        }
    }

    pub fn heading(&self) -> f64 {
        self.heading.current()
    }

    pub fn is_simulating(&self) -> bool {
        !self.heading.is_live()
    }

    pub fn aim(&self) -> &AimAssistState {
        &self.aim
    }

    pub fn stats(&self) -> &FireStats {
        &self.stats
    }

    /// Sensor heading update; non-positive means "no live heading"
    pub fn update_heading(&mut self, reading: f64) {
        let seed = self.seeds.gen();
        if self.heading.observe(reading, seed) {
            self.recompute();
        }
    }

    /// One simulated drift step; no-op while a live heading exists
    pub fn tick_simulation(&mut self) {
        if self.heading.drift() {
            self.recompute();
        }
    }

    /// Replace the candidate set from a freshly derived player list.
    /// Out-of-range players are never candidates.
    pub fn set_players(&mut self, players: &[Player]) {
        self.candidates = players
            .iter()
            .filter(|p| p.status != PlayerStatus::OutOfRange)
            .cloned()
            .collect();
        self.recompute();
    }

    fn recompute(&mut self) {
        self.aim = evaluate(self.heading.current(), &self.candidates);
    }

    /// Resolve a fire action against the locked band
    pub fn fire(&mut self) -> FireOutcome {
        let heading = self.heading.current();
        let target = resolve_fire(heading, &self.candidates).cloned();

        self.stats.shots += 1;
        match &target {
            Some(player) => {
                self.stats.hits += 1;
                self.stats.streak += 1;
                self.stats.last_hit_name = Some(player.name.clone());
            }
            None => {
                self.stats.streak = 0;
            }
        }

        FireOutcome {
            heading,
            target_id: target.as_ref().map(|p| p.id),
            target_name: target.as_ref().map(|p| p.name.clone()),
            distance_m: target.as_ref().map(|p| p.distance_m),
            stats: self.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Source;
    use chrono::Utc;

    fn candidate(name: &str, heading: f64, distance_m: f64) -> Player {
        Player {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: PlayerStatus::for_distance(distance_m),
            distance_m,
            heading,
            zone_key: "0:0".to_string(),
            zone_label: "GRID-1".to_string(),
            last_seen: Utc::now(),
            source: Source::Mesh,
        }
    }

    #[test]
    fn ten_degrees_off_is_locked() {
        let state = evaluate(0.0, &[candidate("a", 10.0, 5.0)]);
        assert_eq!(state.phase, AimPhase::Locked);
        assert_eq!(state.angle_difference, Some(10.0));
        assert!((state.progress - (1.0 - 10.0 / 38.0)).abs() < 1e-9);
        assert!((state.progress - 0.737).abs() < 0.001);
    }

    #[test]
    fn angle_beats_distance_in_ranking() {
        let near_wide = candidate("near", 20.0, 30.0);
        let far_tight = candidate("far", 5.0, 50.0);
        let state = evaluate(0.0, &[near_wide, far_tight.clone()]);
        assert_eq!(state.target_id, Some(far_tight.id));
        assert_eq!(state.phase, AimPhase::Locked);
    }

    #[test]
    fn distance_breaks_angle_ties() {
        let far = candidate("far", 20.0, 22.0);
        let near = candidate("near", 340.0, 12.0);
        let state = evaluate(0.0, &[far, near.clone()]);
        assert_eq!(state.target_id, Some(near.id));
        assert_eq!(state.phase, AimPhase::Locking);
    }

    #[test]
    fn phase_bands() {
        assert_eq!(evaluate(0.0, &[candidate("a", 14.0, 5.0)]).phase, AimPhase::Locked);
        assert_eq!(evaluate(0.0, &[candidate("a", 24.0, 5.0)]).phase, AimPhase::Locking);
        assert_eq!(evaluate(0.0, &[candidate("a", 30.0, 5.0)]).phase, AimPhase::Tracking);
        assert_eq!(evaluate(0.0, &[candidate("a", 38.0, 5.0)]).phase, AimPhase::Tracking);

        let none = evaluate(0.0, &[candidate("a", 38.5, 5.0)]);
        assert_eq!(none, AimAssistState::none());
        assert_eq!(evaluate(0.0, &[]), AimAssistState::none());
    }

    #[test]
    fn fire_miss_resets_streak_and_counts_shot() {
        let mut engine = TargetingEngine::new(1);
        engine.update_heading(100.0);
        engine.set_players(&[candidate("a", 100.0, 5.0)]);

        let hit = engine.fire();
        assert!(hit.is_hit());
        assert_eq!(hit.stats.streak, 1);

        engine.set_players(&[candidate("b", 130.0, 5.0)]);
        let miss = engine.fire();
        assert!(!miss.is_hit());
        assert_eq!(miss.stats.shots, 2);
        assert_eq!(miss.stats.hits, 1);
        assert_eq!(miss.stats.streak, 0);
        assert_eq!(miss.stats.last_hit_name.as_deref(), Some("a"));
    }

    #[test]
    fn fire_picks_nearest_inside_locked_band() {
        let mut engine = TargetingEngine::new(2);
        engine.update_heading(50.0);
        let tight_far = candidate("tight", 50.0, 20.0);
        let loose_near = candidate("loose", 62.0, 3.0);
        let outside = candidate("outside", 70.0, 1.0);
        engine.set_players(&[tight_far, loose_near.clone(), outside]);

        let outcome = engine.fire();
        assert_eq!(outcome.target_id, Some(loose_near.id));
        assert_eq!(outcome.target_name.as_deref(), Some("loose"));
        assert_eq!(outcome.stats.hits, 1);
        assert_eq!(outcome.stats.streak, 1);
    }

    #[test]
    fn out_of_range_players_are_not_candidates() {
        let mut engine = TargetingEngine::new(3);
        engine.update_heading(10.0);
        engine.set_players(&[candidate("far", 10.0, 40.0)]);
        assert!(engine.candidates.is_empty());
        assert_eq!(engine.aim().phase, AimPhase::None);
        assert!(!engine.fire().is_hit());
    }

    #[test]
    fn simulation_only_runs_without_live_heading() {
        let mut engine = TargetingEngine::new(4);
        assert!(engine.is_simulating());
        engine.tick_simulation();

        engine.update_heading(45.0);
        assert!(!engine.is_simulating());
        engine.tick_simulation();
        assert_eq!(engine.heading(), 45.0);
    }

    #[test]
    fn heading_update_recomputes_aim() {
        let mut engine = TargetingEngine::new(5);
        engine.update_heading(200.0);
        engine.set_players(&[candidate("a", 10.0, 5.0)]);
        assert_eq!(engine.aim().phase, AimPhase::None);

        engine.update_heading(12.0);
        assert_eq!(engine.aim().phase, AimPhase::Locked);
    }
}
