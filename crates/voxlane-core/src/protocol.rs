//! Voice service wire protocol.
//!
//! JSON text frames over a single WebSocket, tagged by a `type` field.
//! Audio payloads travel as base64 strings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

/// Protocol version implemented by this client.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client -> Server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        #[serde(with = "base64_bytes")]
        audio: Vec<u8>,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "ping")]
    Ping,

    /// Ask the service to stop generating a response.
    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(rename = "responseId")]
        response_id: String,
    },
}

impl ClientFrame {
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server -> Client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Handshake acknowledgment. Always the first frame on a connection.
    #[serde(rename = "connected")]
    Connected {
        client_id: String,
        protocol_version: u32,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    #[serde(rename = "response.created", rename_all = "camelCase")]
    ResponseCreated { response_id: String },

    #[serde(rename = "chunk", rename_all = "camelCase")]
    Chunk {
        response_id: String,
        sequence: u64,
        #[serde(
            default,
            with = "base64_bytes_opt",
            skip_serializing_if = "Option::is_none"
        )]
        audio: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default)]
        is_final: bool,
    },

    #[serde(rename = "message.done", rename_all = "camelCase")]
    MessageDone {
        response_id: String,
        message: DoneMessage,
    },

    #[serde(rename = "response.cancelled", rename_all = "camelCase")]
    ResponseCancelled { response_id: String },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    #[serde(rename = "pong")]
    Pong,

    /// Server-side speech detection saw the user start talking.
    #[serde(rename = "speech.started")]
    SpeechStarted,

    #[serde(rename = "speech.stopped")]
    SpeechStopped,
}

impl ServerFrame {
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Frame type label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ResponseCreated { .. } => "response.created",
            Self::Chunk { .. } => "chunk",
            Self::MessageDone { .. } => "message.done",
            Self::ResponseCancelled { .. } => "response.cancelled",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::SpeechStarted => "speech.started",
            Self::SpeechStopped => "speech.stopped",
        }
    }
}

/// Final assembled assistant message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoneMessage {
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// How the session should treat an upstream `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    Auth,
    Quota,
    /// The cancel arrived after the response had finished.
    CancellationRace,
    Other,
}

/// Classify an upstream error by its code, falling back to the message text
/// only for cancellation races.
pub fn classify_server_error(code: &str, message: &str) -> ServerErrorKind {
    match code {
        "auth_failed" | "unauthorized" | "forbidden" | "invalid_token" => ServerErrorKind::Auth,
        "quota_exceeded" | "rate_limited" | "insufficient_quota" => ServerErrorKind::Quota,
        "cancellation_race" | "no_active_response" | "response_already_completed" => {
            ServerErrorKind::CancellationRace
        }
        _ => {
            // TODO: drop the message match once the service sends typed codes for cancel races
            let lower = message.to_ascii_lowercase();
            if lower.contains("no active response") || lower.contains("already completed") {
                ServerErrorKind::CancellationRace
            } else {
                ServerErrorKind::Other
            }
        }
    }
}

/// Convert an upstream `error` frame into the session's error taxonomy.
pub fn server_error(code: &str, message: &str, retry_after_ms: Option<u64>) -> VoiceError {
    match classify_server_error(code, message) {
        ServerErrorKind::Auth => VoiceError::Auth(format!("{code}: {message}")),
        ServerErrorKind::Quota => VoiceError::QuotaExceeded {
            message: format!("{code}: {message}"),
            retry_after: retry_after_ms.map(Duration::from_millis),
        },
        ServerErrorKind::CancellationRace => {
            VoiceError::CancellationRace(format!("{code}: {message}"))
        }
        ServerErrorKind::Other => VoiceError::Provider(format!("{code}: {message}")),
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connected() {
        let frame = ServerFrame::parse(
            r#"{"type":"connected","client_id":"c-1","protocol_version":1,"capabilities":["audio","text"]}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Connected {
                client_id,
                capabilities,
                ..
            } => {
                assert_eq!(client_id, "c-1");
                assert_eq!(capabilities, vec!["audio", "text"]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_audio_chunk() {
        // "AAEC" is base64 for [0, 1, 2]
        let frame = ServerFrame::parse(
            r#"{"type":"chunk","responseId":"r1","sequence":3,"audio":"AAEC","isFinal":true}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Chunk {
                response_id: "r1".into(),
                sequence: 3,
                audio: Some(vec![0, 1, 2]),
                text: None,
                is_final: true,
            }
        );
    }

    #[test]
    fn test_parse_text_chunk_without_final_flag() {
        let frame =
            ServerFrame::parse(r#"{"type":"chunk","responseId":"r1","sequence":0,"text":"Hi."}"#)
                .unwrap();
        match frame {
            ServerFrame::Chunk {
                audio, text, is_final, ..
            } => {
                assert!(audio.is_none());
                assert_eq!(text.as_deref(), Some("Hi."));
                assert!(!is_final);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_message_done_with_citations() {
        let frame = ServerFrame::parse(
            r#"{"type":"message.done","responseId":"r1","message":{"content":"Done.","citations":[{"title":"Guide","url":"https://x"}]}}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::MessageDone { message, .. } => {
                assert_eq!(message.content, "Done.");
                assert_eq!(message.citations[0].title.as_deref(), Some("Guide"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_bad_base64_is_rejected() {
        let result = ServerFrame::parse(
            r#"{"type":"chunk","responseId":"r1","sequence":0,"audio":"@@not-base64@@"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_client_frames_serialize_with_type_tag() {
        let cancel = ClientFrame::ResponseCancel {
            response_id: "r9".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(cancel, r#"{"type":"response.cancel","responseId":"r9"}"#);

        let audio = ClientFrame::AudioChunk { audio: vec![0, 1, 2] }
            .to_json()
            .unwrap();
        assert_eq!(audio, r#"{"type":"audio_chunk","audio":"AAEC"}"#);

        assert_eq!(ClientFrame::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_classify_by_code() {
        assert_eq!(classify_server_error("auth_failed", ""), ServerErrorKind::Auth);
        assert_eq!(classify_server_error("quota_exceeded", ""), ServerErrorKind::Quota);
        assert_eq!(
            classify_server_error("cancellation_race", ""),
            ServerErrorKind::CancellationRace
        );
        assert_eq!(classify_server_error("internal", "boom"), ServerErrorKind::Other);
    }

    #[test]
    fn test_classify_cancel_race_by_message() {
        assert_eq!(
            classify_server_error("bad_request", "Cancel failed: no active response"),
            ServerErrorKind::CancellationRace
        );
        assert_eq!(
            classify_server_error("bad_request", "Response already completed"),
            ServerErrorKind::CancellationRace
        );
    }

    #[test]
    fn test_quota_error_carries_retry_hint() {
        match server_error("quota_exceeded", "slow down", Some(1_500)) {
            VoiceError::QuotaExceeded { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_millis(1_500)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
