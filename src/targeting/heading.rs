//! Heading source - live compass or simulated drift

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::geo::normalize_heading;

/// Max drift per simulation step (degrees, either direction)
const SIM_DRIFT_DEG: f64 = 4.0;

/// Where the current heading comes from
///
/// Selected by sensor availability: any positive reading switches to `Live`,
/// a non-positive reading (the "no heading" sentinel) switches to
/// `Simulated`, which drifts from the last known heading.
#[derive(Debug, Clone)]
pub enum HeadingSource {
    Live { heading: f64 },
    Simulated { heading: f64, rng: ChaCha8Rng },
}

impl HeadingSource {
    pub fn simulated(seed: u64, start: f64) -> Self {
        HeadingSource::Simulated {
            heading: normalize_heading(start),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn current(&self) -> f64 {
        match self {
            HeadingSource::Live { heading } | HeadingSource::Simulated { heading, .. } => *heading,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, HeadingSource::Live { .. })
    }

    /// Apply a sensor reading. Returns true if the heading value changed.
    pub fn observe(&mut self, reading: f64, fallback_seed: u64) -> bool {
        let before = self.current();
        if reading > 0.0 {
            *self = HeadingSource::Live {
                heading: normalize_heading(reading),
            };
        } else if self.is_live() {
            *self = HeadingSource::simulated(fallback_seed, before);
        }
        self.current() != before
    }

    /// Advance simulated drift by one step. No-op while live.
    pub fn drift(&mut self) -> bool {
        match self {
            HeadingSource::Live { .. } => false,
            HeadingSource::Simulated { heading, rng } => {
                let delta = rng.gen_range(-SIM_DRIFT_DEG..=SIM_DRIFT_DEG);
                *heading = normalize_heading(*heading + delta);
                true
            }
        }
    }
}
