//! Speaking-style classification and voice value blending.

use std::fmt;

use voxlane_core::types::{VoiceParams, VoicePreferenceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeechStyle {
    Calm,
    Urgent,
    Empathetic,
    Instructional,
    Conversational,
}

impl SpeechStyle {
    pub const ALL: [SpeechStyle; 5] = [
        SpeechStyle::Calm,
        SpeechStyle::Urgent,
        SpeechStyle::Empathetic,
        SpeechStyle::Instructional,
        SpeechStyle::Conversational,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calm => "calm",
            Self::Urgent => "urgent",
            Self::Empathetic => "empathetic",
            Self::Instructional => "instructional",
            Self::Conversational => "conversational",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Preset voice values for this style.
    pub fn preset(&self) -> VoiceParams {
        let (stability, clarity, expressiveness) = match self {
            Self::Calm => (0.8, 0.7, 0.2),
            Self::Urgent => (0.35, 0.9, 0.7),
            Self::Empathetic => (0.6, 0.7, 0.55),
            Self::Instructional => (0.7, 0.85, 0.3),
            Self::Conversational => (0.5, 0.75, 0.4),
        };
        VoiceParams {
            stability,
            clarity,
            expressiveness,
        }
    }
}

impl fmt::Display for SpeechStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const URGENT_CUES: &[&str] = &[
    "immediately",
    "emergency",
    "urgent",
    "right away",
    "call 911",
    "call your doctor",
    "seek medical",
    "warning",
    "danger",
    "asap",
    "do not",
    "don't",
    "stop",
];

const EMPATHETIC_CUES: &[&str] = &[
    "sorry",
    "understand",
    "i hear you",
    "that sounds",
    "difficult",
    "hard time",
    "worried",
    "frustrat",
    "feel",
    "it's okay",
];

const INSTRUCTIONAL_CUES: &[&str] = &[
    "first",
    "then",
    "next",
    "step",
    "finally",
    "make sure",
    "you should",
    "how to",
    "follow",
    "take ",
];

const CALM_CUES: &[&str] = &[
    "relax",
    "breathe",
    "no need to worry",
    "nothing to worry",
    "normal",
    "common",
    "gently",
    "rest",
    "slowly",
];

/// Keyword classifier over one utterance.
///
/// Ties resolve urgent > empathetic > instructional > calm. Text that matches
/// nothing is conversational.
pub fn classify(text: &str) -> SpeechStyle {
    let lower = text.to_lowercase();
    let score = |cues: &[&str]| cues.iter().filter(|c| lower.contains(*c)).count();

    let mut best = (SpeechStyle::Conversational, 0usize);
    for (style, cues) in [
        (SpeechStyle::Urgent, URGENT_CUES),
        (SpeechStyle::Empathetic, EMPATHETIC_CUES),
        (SpeechStyle::Instructional, INSTRUCTIONAL_CUES),
        (SpeechStyle::Calm, CALM_CUES),
    ] {
        let s = score(cues);
        // strict: earlier styles win ties
        if s > best.1 {
            best = (style, s);
        }
    }

    let exclamations = lower.matches('!').count();
    if best.1 == 0 && exclamations >= 2 {
        return SpeechStyle::Urgent;
    }
    best.0
}

/// Fixed-weight mix of the user's voice values with a style preset.
#[derive(Debug, Clone, Copy)]
pub struct StyleBlender {
    user_weight: f64,
}

impl Default for StyleBlender {
    fn default() -> Self {
        Self::new(0.6)
    }
}

impl StyleBlender {
    pub fn new(user_weight: f64) -> Self {
        Self {
            user_weight: user_weight.clamp(0.0, 1.0),
        }
    }

    pub fn user_weight(&self) -> f64 {
        self.user_weight
    }

    pub fn blend(&self, user: &VoiceParams, preset: &VoiceParams) -> VoiceParams {
        let w = self.user_weight;
        let mix = |u: f64, p: f64| u * w + p * (1.0 - w);
        VoiceParams {
            stability: mix(user.stability, preset.stability),
            clarity: mix(user.clarity, preset.clarity),
            expressiveness: mix(user.expressiveness, preset.expressiveness),
        }
        .clamped()
    }

    /// Style and final voice values for an utterance.
    ///
    /// Blending disabled: no style, raw user values. A pinned preset in the
    /// snapshot skips classification.
    pub fn resolve(
        &self,
        text: &str,
        prefs: &VoicePreferenceSnapshot,
    ) -> (Option<SpeechStyle>, VoiceParams) {
        if !prefs.style_blend_enabled {
            return (None, prefs.voice.clamped());
        }
        let style = prefs
            .style_preset
            .as_deref()
            .and_then(SpeechStyle::from_name)
            .unwrap_or_else(|| classify(text));
        (Some(style), self.blend(&prefs.voice, &style.preset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_classify_styles() {
        assert_eq!(
            classify("Call 911 immediately if the chest pain gets worse."),
            SpeechStyle::Urgent
        );
        assert_eq!(
            classify("I'm sorry, that sounds really difficult."),
            SpeechStyle::Empathetic
        );
        assert_eq!(
            classify("First wash your hands, then apply the cream."),
            SpeechStyle::Instructional
        );
        assert_eq!(
            classify("This is very common, just breathe and relax."),
            SpeechStyle::Calm
        );
        assert_eq!(classify("The weather is nice today."), SpeechStyle::Conversational);
    }

    #[test]
    fn test_classify_tie_prefers_urgent() {
        // one urgent cue, one empathetic cue
        assert_eq!(classify("Sorry, this is urgent."), SpeechStyle::Urgent);
    }

    #[test]
    fn test_style_names_roundtrip() {
        for style in SpeechStyle::ALL {
            assert_eq!(SpeechStyle::from_name(style.as_str()), Some(style));
        }
        assert_eq!(SpeechStyle::from_name(" Calm "), Some(SpeechStyle::Calm));
        assert_eq!(SpeechStyle::from_name("sarcastic"), None);
    }

    #[test]
    fn test_blend_sixty_forty() {
        let blender = StyleBlender::default();
        let user = VoiceParams {
            stability: 1.0,
            clarity: 0.5,
            expressiveness: 0.0,
        };
        let out = blender.blend(&user, &SpeechStyle::Calm.preset());
        assert!(approx(out.stability, 0.92));
        assert!(approx(out.clarity, 0.58));
        assert!(approx(out.expressiveness, 0.08));
    }

    #[test]
    fn test_resolve_disabled_passes_raw_values() {
        let prefs = VoicePreferenceSnapshot {
            style_blend_enabled: false,
            voice: VoiceParams {
                stability: 0.1,
                clarity: 0.2,
                expressiveness: 0.3,
            },
            ..Default::default()
        };
        let (style, params) = StyleBlender::default().resolve("Call 911 immediately!", &prefs);
        assert_eq!(style, None);
        assert_eq!(params, prefs.voice);
    }

    #[test]
    fn test_resolve_pinned_preset_skips_classifier() {
        let prefs = VoicePreferenceSnapshot {
            style_preset: Some("instructional".into()),
            ..Default::default()
        };
        let (style, _) = StyleBlender::default().resolve("Call 911 immediately!", &prefs);
        assert_eq!(style, Some(SpeechStyle::Instructional));
    }

    #[test]
    fn test_resolve_unknown_preset_falls_back_to_classifier() {
        let prefs = VoicePreferenceSnapshot {
            style_preset: Some("whisper".into()),
            ..Default::default()
        };
        let (style, _) = StyleBlender::default().resolve("I'm so sorry to hear that.", &prefs);
        assert_eq!(style, Some(SpeechStyle::Empathetic));
    }
}
