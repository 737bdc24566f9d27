//! Provider selection, timeout-bounded fallback and style blending.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use voxlane_core::config::TtsConfig;
use voxlane_core::error::VoiceError;
use voxlane_core::metrics;
use voxlane_core::types::{VoiceParams, VoicePreferenceSnapshot};
use voxlane_network::NetworkTier;

use crate::cache::{PhraseCache, PhraseKey};
use crate::provider::{ProviderError, ProviderRegistry, SynthesisRequest, TtsProvider};
use crate::style::{SpeechStyle, StyleBlender};

/// Synthesized audio and how it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioResult {
    pub audio: Vec<u8>,
    /// Provider id, or "cache".
    pub provider: String,
    pub used_fallback: bool,
    pub from_cache: bool,
    pub style: Option<SpeechStyle>,
    pub params: VoiceParams,
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("no TTS providers configured")]
    NoProviders,

    #[error("{provider} rejected the request: {source}")]
    Rejected {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("all providers failed: {0}")]
    VoiceUnavailable(String),
}

impl From<TtsError> for VoiceError {
    fn from(e: TtsError) -> Self {
        VoiceError::VoiceUnavailable(e.to_string())
    }
}

pub struct TtsRouter {
    registry: ProviderRegistry,
    synthesis_timeout: Duration,
    blender: StyleBlender,
    cache: PhraseCache,
    prefer_local: AtomicBool,
}

impl TtsRouter {
    pub fn new(registry: ProviderRegistry, config: &TtsConfig) -> Self {
        Self {
            registry,
            synthesis_timeout: config.synthesis_timeout(),
            blender: StyleBlender::new(config.user_weight),
            cache: PhraseCache::new(config.cache_capacity),
            prefer_local: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &TtsConfig) -> Self {
        Self::new(ProviderRegistry::from_config(config), config)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &PhraseCache {
        &self.cache
    }

    /// Apply a confirmed network tier. Poor and offline favor local
    /// providers and cached phrases.
    pub fn set_network_tier(&self, tier: NetworkTier) {
        self.set_prefer_local(tier.is_degraded());
    }

    pub fn set_prefer_local(&self, prefer: bool) {
        let was = self.prefer_local.swap(prefer, Ordering::Relaxed);
        if was != prefer {
            info!(prefer_local = prefer, "TTS provider preference changed");
        }
    }

    pub fn prefers_local(&self) -> bool {
        self.prefer_local.load(Ordering::Relaxed)
    }

    /// Providers to try, primary first.
    pub fn provider_order(&self, prefs: &VoicePreferenceSnapshot) -> Vec<Arc<dyn TtsProvider>> {
        let mut order: Vec<Arc<dyn TtsProvider>> = if prefs.tts_provider_order.is_empty() {
            self.registry.all().to_vec()
        } else {
            prefs
                .tts_provider_order
                .iter()
                .filter_map(|id| {
                    let provider = self.registry.get(id);
                    if provider.is_none() {
                        warn!(provider = %id, "Preferred TTS provider not registered, skipping");
                    }
                    provider
                })
                .collect()
        };

        if self.prefers_local() {
            // stable: keeps relative order within each group
            order.sort_by_key(|p| !p.is_local());
        }
        order
    }

    /// Synthesize one utterance. At most two providers are tried, each
    /// bounded by the synthesis timeout.
    pub async fn synthesize(
        &self,
        text: &str,
        prefs: &VoicePreferenceSnapshot,
    ) -> Result<AudioResult, TtsError> {
        let (style, params) = self.blender.resolve(text, prefs);
        let key = PhraseKey::new(text, &prefs.voice_id, &prefs.language, &params);

        if self.prefers_local() {
            if let Some(audio) = self.cache.get(&key) {
                debug!(text_len = text.len(), "Serving phrase from cache");
                return Ok(cached(audio, style, params));
            }
        }

        let order = self.provider_order(prefs);
        if order.is_empty() {
            return match self.cache.get(&key) {
                Some(audio) => Ok(cached(audio, style, params)),
                None => Err(TtsError::NoProviders),
            };
        }

        let request = SynthesisRequest {
            text: text.to_string(),
            voice_id: prefs.voice_id.clone(),
            language: prefs.language.clone(),
            params,
        };

        let mut failures = Vec::new();
        for (i, provider) in order.iter().take(2).enumerate() {
            let used_fallback = i > 0;
            if used_fallback {
                metrics::record_tts_fallback(provider.id());
            }

            match self.attempt(provider.as_ref(), &request).await {
                Ok(audio) => {
                    debug!(
                        provider = provider.id(),
                        used_fallback,
                        style = style.map(|s| s.as_str()),
                        bytes = audio.len(),
                        "Synthesis complete"
                    );
                    self.cache.put(key, audio.clone());
                    return Ok(AudioResult {
                        audio,
                        provider: provider.id().to_string(),
                        used_fallback,
                        from_cache: false,
                        style,
                        params,
                    });
                }
                Err(e) => {
                    metrics::record_tts_failure(provider.id(), e.kind());
                    if !e.allows_fallback() {
                        warn!(provider = provider.id(), %e, "Provider rejected request, not falling back");
                        return Err(TtsError::Rejected {
                            provider: provider.id().to_string(),
                            source: e,
                        });
                    }
                    warn!(provider = provider.id(), attempt = i + 1, %e, "Provider failed, trying next");
                    failures.push(format!("{}: {e}", provider.id()));
                }
            }
        }

        if let Some(audio) = self.cache.get(&key) {
            info!("All providers failed, serving phrase from cache");
            return Ok(cached(audio, style, params));
        }

        Err(TtsError::VoiceUnavailable(failures.join("; ")))
    }

    async fn attempt(
        &self,
        provider: &dyn TtsProvider,
        request: &SynthesisRequest,
    ) -> Result<Vec<u8>, ProviderError> {
        match tokio::time::timeout(self.synthesis_timeout, provider.synthesize(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.synthesis_timeout)),
        }
    }
}

fn cached(audio: Vec<u8>, style: Option<SpeechStyle>, params: VoiceParams) -> AudioResult {
    AudioResult {
        audio,
        provider: "cache".into(),
        used_fallback: false,
        from_cache: true,
        style,
        params,
    }
}
