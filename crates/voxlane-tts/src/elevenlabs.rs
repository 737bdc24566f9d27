//! ElevenLabs streaming synthesis.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::debug;

use voxlane_core::config::TtsProviderConfig;

use crate::provider::{ProviderError, SynthesisRequest, TtsProvider, retry_after};

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const DEFAULT_OUTPUT_FORMAT: &str = "pcm_16000";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ElevenLabsProvider {
    id: String,
    api_key: Option<String>,
    base_url: String,
    model: String,
    voice: Option<String>,
    output_format: String,
    local: bool,
    client: reqwest::Client,
}

impl ElevenLabsProvider {
    pub fn from_config(config: &TtsProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            api_key: config
                .resolve_api_key()
                .or_else(|| std::env::var("ELEVENLABS_API_KEY").ok().filter(|v| !v.is_empty())),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: config.voice.clone(),
            output_format: config
                .output_format
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.to_string()),
            local: config.local,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Streaming endpoint for a voice.
    pub fn stream_url(&self, voice: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{voice}/stream?output_format={}",
            self.base_url.trim_end_matches('/'),
            self.output_format
        )
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth(format!("no API key configured for {}", self.id)))?;

        let voice = self.voice.as_deref().unwrap_or(&request.voice_id);
        let url = self.stream_url(voice);
        debug!(provider = %self.id, voice, model = %self.model, text_len = request.text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", api_key)
            .header("Content-Type", "application/json")
            .json(&json!({
                "text": request.text,
                "model_id": self.model,
                "language_code": request.language,
                "voice_settings": {
                    "stability": request.params.stability,
                    "similarity_boost": request.params.clarity,
                    "style": request.params.expressiveness,
                }
            }))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(e, REQUEST_TIMEOUT))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let hint = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, hint, body));
        }

        let mut audio = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Unavailable(format!("TTS stream error: {e}")))?;
            audio.extend_from_slice(&bytes);
        }

        debug!(provider = %self.id, bytes = audio.len(), "TTS stream complete");
        Ok(audio)
    }
}
