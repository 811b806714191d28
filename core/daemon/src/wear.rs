//! Wear score calculation.

use serde::Deserialize;

pub const DEFAULT_LAUNCH_FACTOR: f64 = 1.0;
pub const DEFAULT_TIME_FACTOR: f64 = 0.01;
pub const DEFAULT_MAX_WEAR: u32 = 100;

/// Weighting applied to launch and active-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct WearWeights {
    #[serde(default = "default_launch_factor")]
    pub launch_factor: f64,
    #[serde(default = "default_time_factor")]
    pub time_factor: f64,
    #[serde(default = "default_max_wear")]
    pub max_wear: u32,
}

impl Default for WearWeights {
    fn default() -> Self {
        Self {
            launch_factor: DEFAULT_LAUNCH_FACTOR,
            time_factor: DEFAULT_TIME_FACTOR,
            max_wear: DEFAULT_MAX_WEAR,
        }
    }
}

fn default_launch_factor() -> f64 {
    DEFAULT_LAUNCH_FACTOR
}

fn default_time_factor() -> f64 {
    DEFAULT_TIME_FACTOR
}

fn default_max_wear() -> u32 {
    DEFAULT_MAX_WEAR
}

impl WearWeights {
    /// `min(max_wear, floor(launches * launch_factor + (active_seconds / 60) * time_factor))`.
    ///
    /// Negative counters count as zero and the result never leaves `[0, max_wear]`.
    pub fn compute(&self, launches: i64, active_seconds: i64) -> u32 {
        let launches = launches.max(0) as f64;
        let active_minutes = active_seconds.max(0) as f64 / 60.0;
        let raw = launches * self.launch_factor + active_minutes * self.time_factor;

        if !raw.is_finite() || raw <= 0.0 {
            return 0;
        }

        let floored = raw.floor();
        if floored >= f64::from(self.max_wear) {
            self.max_wear
        } else {
            floored as u32
        }
    }

    /// Replaces unusable factors with defaults, reporting which ones were dropped.
    pub fn sanitized(self) -> (Self, Vec<&'static str>) {
        let mut rejected = Vec::new();
        let mut weights = self;
        if !weights.launch_factor.is_finite() || weights.launch_factor < 0.0 {
            weights.launch_factor = DEFAULT_LAUNCH_FACTOR;
            rejected.push("launch_factor");
        }
        if !weights.time_factor.is_finite() || weights.time_factor < 0.0 {
            weights.time_factor = DEFAULT_TIME_FACTOR;
            rejected.push("time_factor");
        }
        (weights, rejected)
    }
}
