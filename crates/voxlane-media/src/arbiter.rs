//! Audio playback arbitration.
//!
//! The arbiter owns the single [`PlaybackHandle`] that is allowed to sound
//! out loud. Chunks are checked against the [`ResponseTracker`] before they
//! reach the sink, and `stop()` is authoritative even while an `accept()` on
//! another thread is mid-write. A stopped or finished response never gets a
//! second handle.
//!
//! `accept` expects a single producer (the session loop or one audio thread).
//! `stop` and `complete` may be called from anywhere.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use voxlane_core::config::OverlapPolicy;
use voxlane_core::metrics;
use voxlane_core::types::AudioChunk;

use crate::sink::AudioSink;
use crate::tracker::ResponseTracker;

/// Chunks held ahead of a sequence gap before the gap is skipped.
const MAX_PENDING: usize = 256;

/// The resource currently producing sound.
#[derive(Debug)]
pub struct PlaybackHandle {
    pub owner_response_id: String,
    pub owner_generation: u64,
    pub token: u64,
    next_sequence: u64,
    pending: BTreeMap<u64, AudioChunk>,
    finishing: bool,
}

impl PlaybackHandle {
    fn owned_by(&self, response_id: &str, generation: u64) -> bool {
        self.owner_response_id == response_id && self.owner_generation == generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// This many chunks (including the accepted one) went to the sink.
    Played(usize),
    /// Waiting for an earlier sequence number.
    Buffered,
    DroppedStale,
    DroppedDuplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub accepted: u64,
    pub written: u64,
    pub dropped_stale: u64,
    pub dropped_duplicate: u64,
    pub heals: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    written: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_duplicate: AtomicU64,
    heals: AtomicU64,
}

/// How the last handle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Stopped,
    Finished,
}

/// The response whose handle was last released. Its later chunks never
/// reach the sink: a stopped response stays silent and a finished one has
/// already been played.
struct Retired {
    response_id: String,
    generation: u64,
    ending: Ending,
    next_sequence: u64,
}

impl Retired {
    fn matches(&self, response_id: &str, generation: u64) -> bool {
        self.response_id == response_id && self.generation == generation
    }
}

struct Slot {
    handle: Option<PlaybackHandle>,
    retired: Option<Retired>,
}

pub struct PlaybackArbiter {
    tracker: ResponseTracker,
    sink: Arc<dyn AudioSink>,
    policy: OverlapPolicy,
    /// Token of the playing handle, 0 when silent.
    current: AtomicU64,
    next_token: AtomicU64,
    slot: Mutex<Slot>,
    counters: Counters,
}

impl PlaybackArbiter {
    pub fn new(tracker: ResponseTracker, sink: Arc<dyn AudioSink>, policy: OverlapPolicy) -> Self {
        Self {
            tracker,
            sink,
            policy,
            current: AtomicU64::new(0),
            next_token: AtomicU64::new(0),
            slot: Mutex::new(Slot {
                handle: None,
                retired: None,
            }),
            counters: Counters::default(),
        }
    }

    pub fn tracker(&self) -> &ResponseTracker {
        &self.tracker
    }

    /// Offer a chunk for playback. `generation` is the generation its
    /// response was registered at.
    pub fn accept(&self, chunk: AudioChunk, generation: u64) -> AcceptOutcome {
        let (token, ready, finished) = {
            let mut slot = self.slot.lock();

            if self.tracker.is_stale(&chunk.response_id, generation) {
                self.counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
                metrics::record_stale_chunk_dropped();
                trace!(
                    response_id = %chunk.response_id,
                    sequence = chunk.sequence,
                    generation,
                    "Dropping stale chunk"
                );
                return AcceptOutcome::DroppedStale;
            }

            if let Some(retired) = slot
                .retired
                .as_ref()
                .filter(|r| r.matches(&chunk.response_id, generation))
            {
                return self.drop_retired(retired, &chunk);
            }

            let needs_new = match &slot.handle {
                Some(h) => !h.owned_by(&chunk.response_id, generation),
                None => true,
            };
            if needs_new {
                if let Some(old) = slot.handle.take() {
                    self.overlap(old, &chunk.response_id);
                }
                let handle = self.start_handle(&mut slot, &chunk.response_id, generation);
                slot.handle = Some(handle);
            }

            let Some(handle) = slot.handle.as_mut() else {
                return AcceptOutcome::DroppedStale;
            };

            if handle.finishing
                || chunk.sequence < handle.next_sequence
                || handle.pending.contains_key(&chunk.sequence)
            {
                self.counters.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
                metrics::record_duplicate_chunk_dropped();
                trace!(response_id = %chunk.response_id, sequence = chunk.sequence, "Duplicate chunk");
                return AcceptOutcome::DroppedDuplicate;
            }

            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            handle.pending.insert(chunk.sequence, chunk);

            if handle.pending.len() > MAX_PENDING {
                if let Some(&first) = handle.pending.keys().next() {
                    warn!(
                        response_id = %handle.owner_response_id,
                        missing_from = handle.next_sequence,
                        resume_at = first,
                        "Skipping sequence gap"
                    );
                    handle.next_sequence = first;
                }
            }

            let mut ready = Vec::new();
            while let Some(next) = handle.pending.remove(&handle.next_sequence) {
                handle.next_sequence += 1;
                let last = next.is_final;
                ready.push(next);
                if last {
                    handle.finishing = true;
                    handle.pending.clear();
                    break;
                }
            }
            (handle.token, ready, handle.finishing)
        };

        if ready.is_empty() {
            return AcceptOutcome::Buffered;
        }

        for chunk in &ready {
            self.sink.write(token, chunk);
        }
        self.counters
            .written
            .fetch_add(ready.len() as u64, Ordering::Relaxed);

        if finished {
            self.release(token);
        }
        AcceptOutcome::Played(ready.len())
    }

    /// Halt output and drop the handle with its buffered chunks. Returns
    /// whether anything was playing.
    pub fn stop(&self) -> bool {
        let mut slot = self.slot.lock();
        let Some(handle) = slot.handle.take() else {
            trace!("Stop with nothing playing");
            return false;
        };
        self.clear_current(handle.token);
        self.sink.halt(handle.token);
        debug!(
            response_id = %handle.owner_response_id,
            token = handle.token,
            discarded = handle.pending.len(),
            "Playback stopped"
        );
        slot.retired = Some(Retired {
            response_id: handle.owner_response_id,
            generation: handle.owner_generation,
            ending: Ending::Stopped,
            next_sequence: handle.next_sequence,
        });
        true
    }

    /// Release the handle for a response that finished without a final
    /// chunk. Buffered chunks still waiting on a gap are discarded.
    pub fn complete(&self, response_id: &str) -> bool {
        let mut slot = self.slot.lock();
        match slot.handle.take() {
            Some(handle) if handle.owner_response_id == response_id => {
                self.clear_current(handle.token);
                self.sink.finish(handle.token);
                debug!(response_id, token = handle.token, "Playback complete");
                slot.retired = Some(Retired {
                    response_id: handle.owner_response_id,
                    generation: handle.owner_generation,
                    ending: Ending::Finished,
                    next_sequence: handle.next_sequence,
                });
                true
            }
            other => {
                slot.handle = other;
                false
            }
        }
    }

    /// Token of the playing handle, if any. Lock-free.
    pub fn playing_token(&self) -> Option<u64> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            token => Some(token),
        }
    }

    pub fn playing_response(&self) -> Option<String> {
        self.slot
            .lock()
            .handle
            .as_ref()
            .map(|h| h.owner_response_id.clone())
    }

    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped_stale: self.counters.dropped_stale.load(Ordering::Relaxed),
            dropped_duplicate: self.counters.dropped_duplicate.load(Ordering::Relaxed),
            heals: self.counters.heals.load(Ordering::Relaxed),
        }
    }

    fn start_handle(&self, slot: &mut Slot, response_id: &str, generation: u64) -> PlaybackHandle {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(other) =
            self.current
                .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
        {
            // The slot was empty, so nothing should own the output
            warn!(token, other, "Output owner out of sync with slot");
            self.current.store(token, Ordering::Release);
        }

        slot.retired = None;

        debug!(response_id, generation, token, "Playback handle started");
        PlaybackHandle {
            owner_response_id: response_id.to_string(),
            owner_generation: generation,
            token,
            next_sequence: 0,
            pending: BTreeMap::new(),
            finishing: false,
        }
    }

    /// A handle is still present while another response wants to play.
    fn overlap(&self, old: PlaybackHandle, incoming: &str) {
        match self.policy {
            OverlapPolicy::FailFast => panic!(
                "second playback handle for {incoming} while {} (token {}) is playing",
                old.owner_response_id, old.token
            ),
            OverlapPolicy::SelfHeal => {
                warn!(
                    playing = %old.owner_response_id,
                    incoming,
                    token = old.token,
                    "Overlapping playback, forcing stop"
                );
                self.counters.heals.fetch_add(1, Ordering::Relaxed);
                metrics::record_playback_heal();
                self.clear_current(old.token);
                self.sink.halt(old.token);
            }
        }
    }

    fn release(&self, token: u64) {
        let mut slot = self.slot.lock();
        if slot.handle.as_ref().is_some_and(|h| h.token == token) {
            if let Some(handle) = slot.handle.take() {
                slot.retired = Some(Retired {
                    response_id: handle.owner_response_id,
                    generation: handle.owner_generation,
                    ending: Ending::Finished,
                    next_sequence: handle.next_sequence,
                });
            }
            self.clear_current(token);
            self.sink.finish(token);
            debug!(token, "Playback finished");
        }
    }

    fn drop_retired(&self, retired: &Retired, chunk: &AudioChunk) -> AcceptOutcome {
        match retired.ending {
            Ending::Stopped => {
                self.counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
                metrics::record_stale_chunk_dropped();
                trace!(
                    response_id = %chunk.response_id,
                    sequence = chunk.sequence,
                    "Dropping chunk for stopped playback"
                );
                AcceptOutcome::DroppedStale
            }
            Ending::Finished => {
                self.counters.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
                metrics::record_duplicate_chunk_dropped();
                trace!(
                    response_id = %chunk.response_id,
                    sequence = chunk.sequence,
                    played_through = retired.next_sequence,
                    "Chunk for finished playback"
                );
                AcceptOutcome::DroppedDuplicate
            }
        }
    }

    fn clear_current(&self, token: u64) {
        let _ = self
            .current
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}
