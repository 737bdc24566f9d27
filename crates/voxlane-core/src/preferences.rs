//! Voice preference store interface.
//!
//! Persistence lives outside this workspace; sessions only need read,
//! write, reset, and push notification of changes.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;
use crate::types::VoicePreferenceSnapshot;

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(&self) -> Result<VoicePreferenceSnapshot>;

    async fn update(&self, snapshot: VoicePreferenceSnapshot) -> Result<()>;

    /// Restore defaults and return them.
    async fn reset(&self) -> Result<VoicePreferenceSnapshot>;

    /// Receive every snapshot written after subscribing.
    fn subscribe(&self) -> broadcast::Receiver<VoicePreferenceSnapshot>;
}

/// Process-local store, seeded from config.
pub struct InMemoryPreferenceStore {
    defaults: VoicePreferenceSnapshot,
    current: RwLock<VoicePreferenceSnapshot>,
    changes: broadcast::Sender<VoicePreferenceSnapshot>,
}

impl InMemoryPreferenceStore {
    pub fn new(defaults: VoicePreferenceSnapshot) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            current: RwLock::new(defaults.clone()),
            defaults,
            changes,
        }
    }

    fn publish(&self, snapshot: VoicePreferenceSnapshot) {
        // No subscribers is fine
        let receivers = self.changes.send(snapshot).unwrap_or(0);
        debug!(receivers, "Voice preferences changed");
    }
}

impl Default for InMemoryPreferenceStore {
    fn default() -> Self {
        Self::new(VoicePreferenceSnapshot::default())
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get(&self) -> Result<VoicePreferenceSnapshot> {
        Ok(self.current.read().clone())
    }

    async fn update(&self, snapshot: VoicePreferenceSnapshot) -> Result<()> {
        *self.current.write() = snapshot.clone();
        self.publish(snapshot);
        Ok(())
    }

    async fn reset(&self) -> Result<VoicePreferenceSnapshot> {
        let defaults = self.defaults.clone();
        *self.current.write() = defaults.clone();
        self.publish(defaults.clone());
        Ok(defaults)
    }

    fn subscribe(&self) -> broadcast::Receiver<VoicePreferenceSnapshot> {
        self.changes.subscribe()
    }
}
