//! Shared domain types.

use serde::{Deserialize, Serialize};

/// Ordered unit of synthesized audio belonging to one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub response_id: String,
    /// Monotonic per response, starting at 0.
    pub sequence: u64,
    pub is_final: bool,
    pub payload: Vec<u8>,
}

impl AudioChunk {
    pub fn new(response_id: impl Into<String>, sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            response_id: response_id.into(),
            sequence,
            is_final: false,
            payload,
        }
    }

    pub fn final_chunk(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Voice rendering values, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub stability: f64,
    pub clarity: f64,
    pub expressiveness: f64,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            stability: 0.5,
            clarity: 0.75,
            expressiveness: 0.3,
        }
    }
}

impl VoiceParams {
    pub fn clamped(self) -> Self {
        Self {
            stability: self.stability.clamp(0.0, 1.0),
            clarity: self.clarity.clamp(0.0, 1.0),
            expressiveness: self.expressiveness.clamp(0.0, 1.0),
        }
    }
}

/// The user's voice preferences as seen by one session. Replaced as a whole
/// on every sync, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePreferenceSnapshot {
    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    #[serde(default = "default_language")]
    pub language: String,

    /// 0 (least sensitive) to 100 (most sensitive).
    #[serde(default = "default_vad_sensitivity")]
    pub vad_sensitivity: u8,

    /// Pin a named style preset instead of classifying each utterance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_preset: Option<String>,

    /// When false, the user's raw voice values are used unblended.
    #[serde(default = "default_true")]
    pub style_blend_enabled: bool,

    #[serde(default)]
    pub voice: VoiceParams,

    /// Provider ids in preference order; the first is primary.
    #[serde(default)]
    pub tts_provider_order: Vec<String>,
}

fn default_voice_id() -> String {
    "21m00Tcm4TlvDq8ikWAM".into()
}

fn default_language() -> String {
    "en".into()
}

fn default_vad_sensitivity() -> u8 {
    50
}

fn default_true() -> bool {
    true
}

impl Default for VoicePreferenceSnapshot {
    fn default() -> Self {
        Self {
            voice_id: default_voice_id(),
            language: default_language(),
            vad_sensitivity: default_vad_sensitivity(),
            style_preset: None,
            style_blend_enabled: true,
            voice: VoiceParams::default(),
            tts_provider_order: Vec::new(),
        }
    }
}
