//! Audio output sinks.
//!
//! A sink receives chunks tagged with the playback token of the handle that
//! owns them. Once a token is halted or finished, later writes for it must be
//! discarded; the arbiter relies on this when a write races a stop.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use voxlane_core::types::AudioChunk;

pub trait AudioSink: Send + Sync {
    fn write(&self, token: u64, chunk: &AudioChunk);

    /// Stop output for `token` immediately and discard anything queued.
    /// Called while the arbiter holds its slot lock, so it must not block.
    fn halt(&self, token: u64);

    /// `token` played to the end. Same non-blocking rule as `halt`.
    fn finish(&self, token: u64);
}

/// What a [`ChannelSink`] forwards to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Audio {
        token: u64,
        response_id: String,
        sequence: u64,
        payload: Vec<u8>,
    },
    Halt {
        token: u64,
    },
    Finish {
        token: u64,
    },
}

/// Forwards playback events to a consumer task or thread (an output device,
/// a file writer, a test).
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
    /// Tokens at or below this are closed. Handles never overlap and tokens
    /// only grow, so a watermark is enough.
    closed_through: Mutex<u64>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed_through: Mutex::new(0),
            },
            rx,
        )
    }

    fn close(&self, token: u64, event: SinkEvent) {
        let mut closed = self.closed_through.lock();
        if token <= *closed {
            trace!(token, "Sink token already closed");
            return;
        }
        *closed = token;
        if self.tx.send(event).is_err() {
            debug!(token, "Sink consumer dropped");
        }
    }
}

impl AudioSink for ChannelSink {
    fn write(&self, token: u64, chunk: &AudioChunk) {
        // Check and send under one lock so a halt cannot slip in between
        let closed = self.closed_through.lock();
        if token <= *closed {
            trace!(token, sequence = chunk.sequence, "Dropping write for closed token");
            return;
        }
        let _ = self.tx.send(SinkEvent::Audio {
            token,
            response_id: chunk.response_id.clone(),
            sequence: chunk.sequence,
            payload: chunk.payload.clone(),
        });
    }

    fn halt(&self, token: u64) {
        self.close(token, SinkEvent::Halt { token });
    }

    fn finish(&self, token: u64) {
        self.close(token, SinkEvent::Finish { token });
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&self, _token: u64, _chunk: &AudioChunk) {}
    fn halt(&self, _token: u64) {}
    fn finish(&self, _token: u64) {}
}
