//! Connectivity tiers and the hysteresis that keeps them from flapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use voxlane_core::config::NetworkConfig;

/// Ordered best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTier {
    Excellent,
    Good,
    Moderate,
    Poor,
    Offline,
}

impl NetworkTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Moderate => "moderate",
            Self::Poor => "poor",
            Self::Offline => "offline",
        }
    }

    pub fn is_worse_than(self, other: NetworkTier) -> bool {
        self > other
    }

    pub fn one_step_worse(self) -> NetworkTier {
        match self {
            Self::Excellent => Self::Good,
            Self::Good => Self::Moderate,
            Self::Moderate => Self::Poor,
            Self::Poor | Self::Offline => Self::Offline,
        }
    }

    /// Tiers where remote speech detection is abandoned for local detection.
    pub fn is_degraded(self) -> bool {
        matches!(self, Self::Poor | Self::Offline)
    }
}

impl std::fmt::Display for NetworkTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe result. `latency_ms` is `None` when the probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkQualitySample {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: Option<u64>,
}

impl NetworkQualitySample {
    pub fn latency(latency_ms: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            latency_ms: Some(latency_ms),
        }
    }

    pub fn failed() -> Self {
        Self {
            timestamp: Utc::now(),
            latency_ms: None,
        }
    }
}

/// Latency boundaries, each exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub excellent_below_ms: u64,
    pub good_below_ms: u64,
    pub moderate_below_ms: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for TierThresholds {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            excellent_below_ms: config.excellent_below_ms,
            good_below_ms: config.good_below_ms,
            moderate_below_ms: config.moderate_below_ms,
        }
    }
}

impl TierThresholds {
    pub fn classify(&self, sample: &NetworkQualitySample) -> NetworkTier {
        match sample.latency_ms {
            None => NetworkTier::Offline,
            Some(ms) if ms < self.excellent_below_ms => NetworkTier::Excellent,
            Some(ms) if ms < self.good_below_ms => NetworkTier::Good,
            Some(ms) if ms < self.moderate_below_ms => NetworkTier::Moderate,
            Some(_) => NetworkTier::Poor,
        }
    }
}

/// Published whenever the reported tier moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierChange {
    pub previous: Option<NetworkTier>,
    pub current: NetworkTier,
    /// The new tier is the confirmed tier, not a provisional one-step
    /// degradation while a demotion streak builds.
    pub confirmed: bool,
    pub at: DateTime<Utc>,
}

/// Result of feeding one raw tier through [`TierHysteresis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub reported: NetworkTier,
    pub confirmed: NetworkTier,
    pub confirmed_changed: bool,
}

/// Demotion needs `demote_after` consecutive worse samples; until then the
/// reported tier drops at most one step. Promotion needs `promote_after`
/// consecutive better samples (0 or 1 is immediate).
#[derive(Debug, Clone)]
pub struct TierHysteresis {
    demote_after: u32,
    promote_after: u32,
    confirmed: Option<NetworkTier>,
    reported: Option<NetworkTier>,
    down_streak: u32,
    /// Mildest tier seen in the current demotion streak.
    down_best: NetworkTier,
    up_streak: u32,
    /// Worst tier seen in the current promotion streak.
    up_worst: NetworkTier,
}

impl TierHysteresis {
    pub fn new(demote_after: u32, promote_after: u32) -> Self {
        Self {
            demote_after: demote_after.max(1),
            promote_after: promote_after.max(1),
            confirmed: None,
            reported: None,
            down_streak: 0,
            down_best: NetworkTier::Offline,
            up_streak: 0,
            up_worst: NetworkTier::Excellent,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.demote_after, config.promote_after)
    }

    pub fn confirmed(&self) -> Option<NetworkTier> {
        self.confirmed
    }

    pub fn reported(&self) -> Option<NetworkTier> {
        self.reported
    }

    pub fn observe(&mut self, raw: NetworkTier) -> Observation {
        let Some(confirmed) = self.confirmed else {
            return self.confirm(raw, true);
        };

        if raw.is_worse_than(confirmed) {
            self.reset_up();
            self.down_streak += 1;
            self.down_best = self.down_best.min(raw);
            if self.down_streak >= self.demote_after {
                let tier = self.down_best;
                return self.confirm(tier, tier != confirmed);
            }
            let provisional = confirmed.one_step_worse().min(raw);
            self.reported = Some(provisional);
            Observation {
                reported: provisional,
                confirmed,
                confirmed_changed: false,
            }
        } else if confirmed.is_worse_than(raw) {
            self.reset_down();
            self.up_streak += 1;
            self.up_worst = self.up_worst.max(raw);
            if self.up_streak >= self.promote_after {
                let tier = self.up_worst;
                return self.confirm(tier, tier != confirmed);
            }
            self.reported = Some(confirmed);
            Observation {
                reported: confirmed,
                confirmed,
                confirmed_changed: false,
            }
        } else {
            self.reset_down();
            self.reset_up();
            self.reported = Some(confirmed);
            Observation {
                reported: confirmed,
                confirmed,
                confirmed_changed: false,
            }
        }
    }

    /// The transport itself reported loss of connectivity: no streak needed.
    pub fn force(&mut self, tier: NetworkTier) -> Observation {
        let changed = self.confirmed != Some(tier);
        self.confirm(tier, changed)
    }

    fn confirm(&mut self, tier: NetworkTier, changed: bool) -> Observation {
        self.confirmed = Some(tier);
        self.reported = Some(tier);
        self.reset_down();
        self.reset_up();
        Observation {
            reported: tier,
            confirmed: tier,
            confirmed_changed: changed,
        }
    }

    fn reset_down(&mut self) {
        self.down_streak = 0;
        self.down_best = NetworkTier::Offline;
    }

    fn reset_up(&mut self) {
        self.up_streak = 0;
        self.up_worst = NetworkTier::Excellent;
    }
}
