//! Media plumbing for voice sessions: response tracking, playback
//! arbitration, audio sinks, and local speech detection.

pub mod arbiter;
pub mod sink;
pub mod tracker;
pub mod vad;

pub use arbiter::{AcceptOutcome, ArbiterStats, PlaybackArbiter};
pub use sink::{AudioSink, ChannelSink, NullSink, SinkEvent};
pub use tracker::{ResponseStatus, ResponseStream, ResponseTracker, TrackerError};
pub use vad::{VadEvent, VoiceActivityDetector};
