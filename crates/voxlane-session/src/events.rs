//! Events published to session observers.

use std::time::Duration;

use serde::Serialize;

use voxlane_core::error::VoiceError;
use voxlane_core::protocol::Citation;
use voxlane_network::NetworkTier;

use crate::state::{DetectionMode, SessionState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },

    /// Incremental response text.
    TextDelta { response_id: String, text: String },

    MessageCompleted {
        response_id: String,
        content: String,
        citations: Vec<Citation>,
    },

    /// Synthesis failed on every provider for part of a response. Text
    /// keeps flowing.
    VoiceUnavailable { response_id: String, reason: String },

    DetectionModeChanged {
        mode: DetectionMode,
        tier: Option<NetworkTier>,
    },

    /// Connectivity recovered; the caller may switch back to remote detection.
    RemoteDetectionAvailable { tier: NetworkTier },

    /// A user-facing error. `fatal` errors close the session.
    Error {
        kind: String,
        message: String,
        retry_after: Option<Duration>,
        fatal: bool,
    },
}

impl SessionEvent {
    pub fn from_error(error: &VoiceError) -> Self {
        let retry_after = match error {
            VoiceError::QuotaExceeded { retry_after, .. } => *retry_after,
            _ => None,
        };
        Self::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
            retry_after,
            fatal: error.is_fatal() || matches!(error, VoiceError::Connection(_)),
        }
    }
}

/// Point-in-time view of a session, for status output and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub state: SessionState,
    pub active_response_id: Option<String>,
    pub generation: u64,
    pub detection_mode: DetectionMode,
    pub network_tier: Option<NetworkTier>,
    pub dropped_chunks: u64,
    pub buffered_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_keeps_retry_hint() {
        let err = VoiceError::QuotaExceeded {
            message: "daily limit".into(),
            retry_after: Some(Duration::from_secs(60)),
        };
        match SessionEvent::from_error(&err) {
            SessionEvent::Error {
                kind,
                retry_after,
                fatal,
                ..
            } => {
                assert_eq!(kind, "quota_exceeded");
                assert_eq!(retry_after, Some(Duration::from_secs(60)));
                assert!(fatal);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = SessionEvent::StateChanged {
            from: SessionState::Speaking,
            to: SessionState::Interrupted,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["to"], "interrupted");
    }
}
