//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxlane_core::config::ReconnectConfig;
use voxlane_core::error::{Result, VoiceError};
use voxlane_core::metrics;

use crate::connection::{Connector, Link};

/// Reconnect delay schedule. Seeded schedules are reproducible.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    jitter: f64,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32, jitter: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            base,
            cap,
            max_attempts,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
            rng,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
            config.jitter,
            config.seed,
        )
    }

    /// Un-jittered delay before attempt `n` (0-based): `min(cap, base * 2^n)`.
    pub fn nominal_delay(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let nominal = self.nominal_delay(self.attempt);
        self.attempt += 1;
        if self.jitter == 0.0 {
            return Some(nominal);
        }
        let scale = self.rng.random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Some(nominal.mul_f64(scale))
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Drain the remaining schedule.
    pub fn schedule(&mut self) -> Vec<Duration> {
        std::iter::from_fn(|| self.next_delay()).collect()
    }

    /// Worst case total wait for a full budget, with maximum jitter.
    pub fn upper_bound(&self) -> Duration {
        (0..self.max_attempts)
            .map(|n| self.nominal_delay(n).mul_f64(1.0 + self.jitter))
            .sum()
    }
}

/// One connect attempt bounded by `timeout`.
pub async fn connect_with_timeout(connector: &dyn Connector, timeout: Duration) -> Result<Link> {
    match tokio::time::timeout(timeout, connector.connect()).await {
        Ok(result) => result,
        Err(_) => Err(VoiceError::Connection(format!(
            "connect attempt timed out after {timeout:?}"
        ))),
    }
}

/// Retry `connector` on the backoff schedule until it succeeds, fails
/// fatally, or the budget runs out. Returns `None` if cancelled.
pub async fn reconnect_with_backoff(
    connector: &dyn Connector,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<Result<Link>> {
    let mut backoff = Backoff::from_config(config);
    let mut last_error = String::new();

    while let Some(delay) = backoff.next_delay() {
        let attempt = backoff.attempts();
        debug!(attempt, ?delay, "Waiting before reconnect");
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        metrics::record_reconnect_attempt();
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = connect_with_timeout(connector, config.attempt_timeout()) => result,
        };
        match result {
            Ok(link) => {
                info!(attempt, "Reconnected to voice service");
                return Some(Ok(link));
            }
            Err(e) if e.is_fatal() => return Some(Err(e)),
            Err(e) => {
                warn!(attempt, max_attempts = backoff.max_attempts(), %e, "Reconnect attempt failed");
                last_error = e.to_string();
            }
        }
    }

    Some(Err(VoiceError::Connection(format!(
        "gave up after {} attempts: {last_error}",
        backoff.max_attempts()
    ))))
}
