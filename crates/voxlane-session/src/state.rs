//! Session lifecycle states and the per-connection session record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use voxlane_core::types::VoicePreferenceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Thinking,
    Speaking,
    /// Transient: a barge-in is being applied. Always followed by `Listening`.
    Interrupted,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// A live link to the service exists.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Listening | Self::Thinking | Self::Speaking | Self::Interrupted
        )
    }

    /// Outbound frames are queued until the link comes up.
    pub fn buffers_outbound(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Connecting) => true,
            (Connecting, Listening | Idle) => true,
            (Listening, Thinking) => true,
            (Thinking, Speaking | Listening) => true,
            (Speaking, Interrupted | Listening) => true,
            (Interrupted, Listening) => true,
            (Listening | Thinking | Speaking, Reconnecting) => true,
            (Reconnecting, Listening) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How end-of-utterance and barge-in are detected while listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// The service reports `speech.started` / `speech.stopped`.
    Remote,
    /// On-device energy detection over outbound audio.
    Local,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

/// One live conversation. Created when the handshake succeeds and owned by
/// the session loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSession {
    pub session_id: String,
    pub state: SessionState,
    pub active_response_id: Option<String>,
    pub generation: u64,
    pub language: String,
    pub preferences: VoicePreferenceSnapshot,
    pub last_activity_at: DateTime<Utc>,
}

impl VoiceSession {
    pub fn new(session_id: impl Into<String>, preferences: VoicePreferenceSnapshot) -> Self {
        Self {
            session_id: session_id.into(),
            state: SessionState::Listening,
            active_response_id: None,
            generation: 0,
            language: preferences.language.clone(),
            preferences,
            last_activity_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Replace the preference snapshot wholesale.
    pub fn apply_preferences(&mut self, preferences: VoicePreferenceSnapshot) {
        self.language = preferences.language.clone();
        self.preferences = preferences;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_only_from_speaking() {
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Listening,
            SessionState::Thinking,
            SessionState::Reconnecting,
            SessionState::Closed,
        ] {
            assert!(!state.can_transition_to(SessionState::Interrupted), "{state}");
        }
        assert!(SessionState::Speaking.can_transition_to(SessionState::Interrupted));
    }

    #[test]
    fn test_interrupted_returns_to_listening_only() {
        assert!(SessionState::Interrupted.can_transition_to(SessionState::Listening));
        assert!(!SessionState::Interrupted.can_transition_to(SessionState::Thinking));
        assert!(!SessionState::Interrupted.can_transition_to(SessionState::Speaking));
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Closed.can_transition_to(SessionState::Listening));
        assert!(SessionState::Speaking.can_transition_to(SessionState::Closed));
    }

    #[test]
    fn test_reconnecting_edges() {
        assert!(SessionState::Speaking.can_transition_to(SessionState::Reconnecting));
        assert!(SessionState::Reconnecting.can_transition_to(SessionState::Listening));
        assert!(!SessionState::Reconnecting.can_transition_to(SessionState::Speaking));
        assert!(!SessionState::Idle.can_transition_to(SessionState::Reconnecting));
    }

    #[test]
    fn test_preferences_replace_language() {
        let mut session = VoiceSession::new("c-1", VoicePreferenceSnapshot::default());
        assert_eq!(session.language, "en");
        session.apply_preferences(VoicePreferenceSnapshot {
            language: "de".into(),
            ..Default::default()
        });
        assert_eq!(session.language, "de");
        assert_eq!(session.preferences.language, "de");
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
    }
}
