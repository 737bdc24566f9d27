//! OpenAI-compatible `/audio/speech` synthesis.
//!
//! Many self-hosted TTS servers expose the same endpoint, so this provider
//! doubles as the on-device/LAN backend when marked `local` in config.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use voxlane_core::config::TtsProviderConfig;

use crate::provider::{ProviderError, SynthesisRequest, TtsProvider, retry_after};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "tts-1";
const DEFAULT_VOICE: &str = "alloy";
const DEFAULT_FORMAT: &str = "pcm";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenAiSpeechProvider {
    id: String,
    api_key: Option<String>,
    base_url: String,
    model: String,
    voice: String,
    response_format: String,
    local: bool,
    client: reqwest::Client,
}

impl OpenAiSpeechProvider {
    pub fn from_config(config: &TtsProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            api_key: config.resolve_api_key(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: config.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            response_format: config
                .output_format
                .clone()
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
            local: config.local,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn speech_url(&self) -> String {
        format!("{}/audio/speech", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl TtsProvider for OpenAiSpeechProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, ProviderError> {
        // Local servers usually run without auth
        if self.api_key.is_none() && !self.local {
            return Err(ProviderError::Auth(format!("no API key configured for {}", self.id)));
        }

        // This API has no stability knob; map expressiveness onto speaking rate.
        let speed = 0.9 + 0.2 * request.params.expressiveness;
        debug!(provider = %self.id, voice = %self.voice, model = %self.model, "Requesting speech");

        let mut builder = self.client.post(self.speech_url()).json(&json!({
            "model": self.model,
            "input": request.text,
            "voice": self.voice,
            "response_format": self.response_format,
            "speed": speed,
        }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(e, REQUEST_TIMEOUT))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let hint = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, hint, body));
        }

        let audio = resp
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("failed to read audio: {e}")))?;
        Ok(audio.to_vec())
    }
}
