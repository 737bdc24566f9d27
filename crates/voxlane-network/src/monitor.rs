//! Periodic network quality monitor.
//!
//! Probes run in a background task only while the monitor is started and at
//! least one subscriber is registered. Dropping the last subscriber cancels
//! the task and its timer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use voxlane_core::config::NetworkConfig;
use voxlane_core::metrics;

use crate::probe::HealthProbe;
use crate::tier::{NetworkQualitySample, NetworkTier, TierChange, TierHysteresis, TierThresholds};

pub type TierCallback = Arc<dyn Fn(&TierChange) + Send + Sync>;

/// Returned by [`NetworkMonitor::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Clone)]
struct ProbeTarget {
    interval: Duration,
    endpoint: String,
}

struct MonitorState {
    hysteresis: TierHysteresis,
    samples: VecDeque<NetworkQualitySample>,
    subscribers: BTreeMap<SubscriptionToken, TierCallback>,
    next_token: u64,
    target: Option<ProbeTarget>,
    task: Option<CancellationToken>,
}

struct MonitorInner {
    probe: Arc<dyn HealthProbe>,
    thresholds: TierThresholds,
    probe_timeout: Duration,
    window: usize,
    state: Mutex<MonitorState>,
}

/// Cloneable; clones share subscribers and the probe task.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    pub fn new(config: &NetworkConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                thresholds: TierThresholds::from(config),
                probe_timeout: config.probe_timeout(),
                window: config.window_size.max(1),
                state: Mutex::new(MonitorState {
                    hysteresis: TierHysteresis::from_config(config),
                    samples: VecDeque::new(),
                    subscribers: BTreeMap::new(),
                    next_token: 0,
                    target: None,
                    task: None,
                }),
            }),
        }
    }

    /// Begin probing `health_endpoint` every `probe_interval`. Probing is
    /// deferred until someone subscribes. Must be called inside a Tokio runtime.
    pub fn start(&self, probe_interval: Duration, health_endpoint: impl Into<String>) {
        let mut state = self.inner.state.lock();
        if let Some(task) = state.task.take() {
            task.cancel();
        }
        state.target = Some(ProbeTarget {
            interval: probe_interval,
            endpoint: health_endpoint.into(),
        });
        info!(?probe_interval, "Network monitor started");
        self.ensure_task(&mut state);
    }

    /// Stop probing. Subscribers stay registered.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.target = None;
        if let Some(task) = state.task.take() {
            task.cancel();
            info!("Network monitor stopped");
        }
    }

    pub fn subscribe(&self, callback: TierCallback) -> SubscriptionToken {
        let mut state = self.inner.state.lock();
        state.next_token += 1;
        let token = SubscriptionToken(state.next_token);
        state.subscribers.insert(token, callback);
        debug!(subscribers = state.subscribers.len(), "Tier subscriber added");
        self.ensure_task(&mut state);
        token
    }

    /// Remove a subscriber. Unknown tokens are ignored.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut state = self.inner.state.lock();
        if state.subscribers.remove(&token).is_none() {
            return;
        }
        if state.subscribers.is_empty() {
            if let Some(task) = state.task.take() {
                task.cancel();
                debug!("Last tier subscriber left, probe task released");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    pub fn is_probing(&self) -> bool {
        self.inner.state.lock().task.is_some()
    }

    /// Feed a sample from any source. Returns the change it caused, if any.
    pub fn record_sample(&self, sample: NetworkQualitySample) -> Option<TierChange> {
        let raw = self.inner.thresholds.classify(&sample);
        self.apply(Some(sample), |h| h.observe(raw))
    }

    /// The transport lost its connection. Confirmed immediately.
    pub fn report_transport_offline(&self) -> Option<TierChange> {
        self.apply(Some(NetworkQualitySample::failed()), |h| h.force(NetworkTier::Offline))
    }

    pub fn current_tier(&self) -> Option<NetworkTier> {
        self.inner.state.lock().hysteresis.reported()
    }

    pub fn confirmed_tier(&self) -> Option<NetworkTier> {
        self.inner.state.lock().hysteresis.confirmed()
    }

    pub fn recent_samples(&self) -> Vec<NetworkQualitySample> {
        self.inner.state.lock().samples.iter().copied().collect()
    }

    /// Mean latency over successful samples in the window.
    pub fn average_latency_ms(&self) -> Option<f64> {
        let state = self.inner.state.lock();
        let latencies: Vec<u64> = state.samples.iter().filter_map(|s| s.latency_ms).collect();
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
    }

    fn apply(
        &self,
        sample: Option<NetworkQualitySample>,
        step: impl FnOnce(&mut TierHysteresis) -> crate::tier::Observation,
    ) -> Option<TierChange> {
        let (change, callbacks) = {
            let mut state = self.inner.state.lock();
            if let Some(sample) = sample {
                if state.samples.len() == self.inner.window {
                    state.samples.pop_front();
                }
                state.samples.push_back(sample);
            }

            let previous = state.hysteresis.reported();
            let obs = step(&mut state.hysteresis);
            if previous == Some(obs.reported) {
                return None;
            }

            let change = TierChange {
                previous,
                current: obs.reported,
                confirmed: obs.reported == obs.confirmed,
                at: Utc::now(),
            };
            if obs.confirmed_changed {
                let from = previous.map(|t| t.as_str()).unwrap_or("unknown");
                metrics::record_tier_transition(from, obs.confirmed.as_str());
                info!(from, to = %obs.confirmed, "Network tier changed");
            } else {
                debug!(
                    to = %obs.reported,
                    confirmed = %obs.confirmed,
                    "Provisional network tier"
                );
            }
            let callbacks: Vec<TierCallback> = state.subscribers.values().cloned().collect();
            (change, callbacks)
        };

        for callback in callbacks {
            callback(&change);
        }
        Some(change)
    }

    fn ensure_task(&self, state: &mut MonitorState) {
        if state.task.is_some() || state.subscribers.is_empty() {
            return;
        }
        let Some(target) = state.target.clone() else {
            return;
        };
        let cancel = CancellationToken::new();
        state.task = Some(cancel.clone());

        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.probe_loop(target, cancel).await;
        });
    }

    async fn probe_loop(self, target: ProbeTarget, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(target.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(endpoint = %target.endpoint, "Probe task running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let result = tokio::time::timeout(
                        self.inner.probe_timeout,
                        self.inner.probe.probe(&target.endpoint),
                    )
                    .await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    let sample = match result {
                        Ok(Ok(latency)) => NetworkQualitySample::latency(latency.as_millis() as u64),
                        Ok(Err(e)) => {
                            debug!(%e, "Health probe failed");
                            NetworkQualitySample::failed()
                        }
                        Err(_) => {
                            debug!(timeout = ?self.inner.probe_timeout, "Health probe timed out");
                            NetworkQualitySample::failed()
                        }
                    };
                    self.record_sample(sample);
                }
            }
        }
        debug!("Probe task exited");
    }
}
