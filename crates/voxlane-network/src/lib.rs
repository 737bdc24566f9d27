//! Network quality monitoring for voice sessions.
//!
//! Probe latency is classified into [`NetworkTier`]s; hysteresis keeps a
//! single slow probe from flipping the session into offline mode.

pub mod monitor;
pub mod probe;
pub mod tier;

pub use monitor::{NetworkMonitor, SubscriptionToken, TierCallback};
pub use probe::{HealthProbe, HttpProbe, ProbeError};
pub use tier::{NetworkQualitySample, NetworkTier, TierChange, TierHysteresis, TierThresholds};
