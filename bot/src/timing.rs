//! Think-time allotment.

use std::time::Duration;

use engine::SearchLimit;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Inclusive think-time bounds for one bracket of the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl TimingRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        if self.min_ms > self.max_ms {
            return Err(ConfigError::InvalidRange {
                name,
                min_ms: self.min_ms,
                max_ms: self.max_ms,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Used for plies `1..=opening_plies`.
    pub opening: TimingRange,
    pub later: TimingRange,
    pub opening_plies: usize,
    /// Largest share of the remaining clock one move may use.
    pub safety_fraction: f64,
    /// Hold an early engine answer until the allotted time has passed.
    pub pace_moves: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            opening: TimingRange::new(1_000, 3_000),
            later: TimingRange::new(3_000, 8_000),
            opening_plies: 10,
            safety_fraction: 0.5,
            pace_moves: true,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.opening.validate("timing.opening")?;
        self.later.validate("timing.later")?;
        if !(self.safety_fraction > 0.0 && self.safety_fraction <= 1.0) {
            return Err(ConfigError::SafetyFraction(self.safety_fraction));
        }
        Ok(())
    }

    pub fn range_for(&self, ply_index: usize) -> TimingRange {
        if ply_index <= self.opening_plies {
            self.opening
        } else {
            self.later
        }
    }
}

/// Think time for ply `ply_index`: a uniform draw from its bracket, capped
/// at the safety fraction of `remaining_clock_ms`. The cap wins over the
/// bracket minimum.
pub fn allot<R: Rng + ?Sized>(
    ply_index: usize,
    timing: &TimingConfig,
    remaining_clock_ms: Option<u64>,
    rng: &mut R,
) -> Duration {
    let range = timing.range_for(ply_index);
    let drawn = if range.min_ms >= range.max_ms {
        range.min_ms
    } else {
        rng.gen_range(range.min_ms..=range.max_ms)
    };
    let capped = match remaining_clock_ms {
        Some(remaining) => drawn.min((remaining as f64 * timing.safety_fraction) as u64),
        None => drawn,
    };
    Duration::from_millis(capped)
}

/// How one own move is searched and paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    pub limit: SearchLimit,
    /// Earliest moment, measured from the start of the turn, at which the
    /// move is submitted.
    pub pace: Option<Duration>,
}

impl MovePlan {
    pub fn new<R: Rng + ?Sized>(
        ply_index: usize,
        timing: &TimingConfig,
        remaining_clock_ms: Option<u64>,
        single_node: bool,
        rng: &mut R,
    ) -> Self {
        let think = allot(ply_index, timing, remaining_clock_ms, rng);
        let limit = if single_node {
            SearchLimit::SingleNode
        } else {
            SearchLimit::MoveTime(think)
        };
        Self {
            limit,
            pace: timing.pace_moves.then_some(think),
        }
    }
}
