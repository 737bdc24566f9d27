//! Small LRU of recently synthesized phrases.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use voxlane_core::metrics;
use voxlane_core::types::VoiceParams;

/// Cache key: the text plus everything that changes how it sounds.
/// Case is kept since it can change pronunciation. Voice values are
/// quantized so float noise from blending doesn't split entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhraseKey {
    text: String,
    voice_id: String,
    language: String,
    params: [u16; 3],
}

impl PhraseKey {
    pub fn new(text: &str, voice_id: &str, language: &str, params: &VoiceParams) -> Self {
        let q = |v: f64| (v.clamp(0.0, 1.0) * 100.0).round() as u16;
        Self {
            text: text.trim().to_string(),
            voice_id: voice_id.to_string(),
            language: language.to_string(),
            params: [q(params.stability), q(params.clarity), q(params.expressiveness)],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct PhraseCache {
    capacity: usize,
    // Front is most recently used
    entries: Mutex<VecDeque<(PhraseKey, Vec<u8>)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PhraseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn get(&self, key: &PhraseKey) -> Option<Vec<u8>> {
        if !self.is_enabled() {
            return None;
        }
        let mut entries = self.entries.lock();
        match entries.iter().position(|(k, _)| k == key) {
            Some(idx) => {
                let entry = entries.remove(idx)?;
                let audio = entry.1.clone();
                entries.push_front(entry);
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_tts_cache_hit();
                Some(audio)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: PhraseKey, audio: Vec<u8>) {
        if !self.is_enabled() || audio.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(idx) = entries.iter().position(|(k, _)| *k == key) {
            entries.remove(idx);
        }
        entries.push_front((key, audio));
        while entries.len() > self.capacity {
            if let Some((evicted, _)) = entries.pop_back() {
                debug!(text_len = evicted.text.len(), "Evicted phrase from cache");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
