//! Speech synthesis for voice sessions.
//!
//! The [`TtsRouter`] tries the preferred provider under a timeout, falls back
//! to one secondary, and blends the user's voice values with a per-utterance
//! style preset.

pub mod cache;
pub mod elevenlabs;
pub mod openai;
pub mod provider;
pub mod router;
pub mod style;

pub use cache::{CacheStats, PhraseCache, PhraseKey};
pub use elevenlabs::ElevenLabsProvider;
pub use openai::OpenAiSpeechProvider;
pub use provider::{ProviderError, ProviderRegistry, SynthesisRequest, TtsProvider};
pub use router::{AudioResult, TtsError, TtsRouter};
pub use style::{SpeechStyle, StyleBlender, classify};
