use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    /// Transport or handshake failure. Retried with backoff by the session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A cancel raced a response that had already finished. Never surfaced.
    #[error("Cancellation race: {0}")]
    CancellationRace(String),

    #[error("Provider error: {0}")]
    Provider(String),

    /// Every configured TTS provider failed for an utterance.
    #[error("Voice unavailable: {0}")]
    VoiceUnavailable(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid state: operation '{operation}' not allowed while {state}")]
    InvalidState { operation: String, state: String },

    #[error("Session closed")]
    Closed,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoiceError {
    /// Errors that end the session with no automatic retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::QuotaExceeded { .. } | Self::Closed)
    }

    /// Whether the error is meant for the user. Races and protocol
    /// anomalies stay in logs and metrics.
    pub fn is_surfaced(&self) -> bool {
        !matches!(
            self,
            Self::CancellationRace(_) | Self::ProtocolViolation(_) | Self::Provider(_)
        )
    }

    /// Short machine-readable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::CancellationRace(_) => "cancellation_race",
            Self::Provider(_) => "provider",
            Self::VoiceUnavailable(_) => "voice_unavailable",
            Self::Auth(_) => "auth",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::InvalidState { .. } => "invalid_state",
            Self::Closed => "closed",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
