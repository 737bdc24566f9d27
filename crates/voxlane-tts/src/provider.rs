//! TTS provider abstraction and registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use voxlane_core::config::TtsConfig;
use voxlane_core::types::VoiceParams;

use crate::elevenlabs::ElevenLabsProvider;
use crate::openai::OpenAiSpeechProvider;

/// One synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
    pub language: String,
    pub params: VoiceParams,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider rejected credentials: {0}")]
    Auth(String),

    #[error("provider rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The request itself was bad; another provider would reject it too.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
        }
    }

    /// Map a non-success HTTP response.
    pub fn from_status(status: reqwest::StatusCode, retry_after: Option<Duration>, body: String) -> Self {
        let message = format!("{status}: {body}");
        match status.as_u16() {
            401 | 403 => Self::Auth(message),
            429 => Self::RateLimited {
                message,
                retry_after,
            },
            s if s >= 500 => Self::Unavailable(message),
            _ => Self::Rejected(message),
        }
    }

    pub fn from_transport(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn id(&self) -> &str;

    /// On-device or on the local network.
    fn is_local(&self) -> bool {
        false
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, ProviderError>;
}

/// Providers known to the router, in configuration order.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn TtsProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every provider listed in config. Unknown kinds are skipped.
    pub fn from_config(config: &TtsConfig) -> Self {
        let mut registry = Self::new();
        for provider in &config.providers {
            match provider.kind.as_str() {
                "elevenlabs" => registry.register(Arc::new(ElevenLabsProvider::from_config(provider))),
                "openai" => registry.register(Arc::new(OpenAiSpeechProvider::from_config(provider))),
                other => warn!(provider = %provider.id, kind = other, "Unknown TTS provider kind, skipping"),
            }
        }
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn TtsProvider>) {
        self.providers.push(provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TtsProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    pub fn all(&self) -> &[Arc<dyn TtsProvider>] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxlane_core::config::TtsProviderConfig;

    fn provider_config(id: &str, kind: &str) -> TtsProviderConfig {
        TtsProviderConfig {
            id: id.into(),
            kind: kind.into(),
            api_key: Some("k".into()),
            api_key_env: None,
            base_url: None,
            model: None,
            voice: None,
            output_format: None,
            local: kind == "openai",
        }
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, None, String::new()),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::FORBIDDEN, None, String::new()),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), String::new()),
            ProviderError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, None, String::new()),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_REQUEST, None, String::new()),
            ProviderError::Rejected(_)
        ));
    }

    #[test]
    fn test_fallback_eligibility() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).allows_fallback());
        assert!(ProviderError::Auth("x".into()).allows_fallback());
        assert!(ProviderError::Unavailable("x".into()).allows_fallback());
        assert!(!ProviderError::Rejected("x".into()).allows_fallback());
    }

    #[test]
    fn test_registry_from_config() {
        let config = TtsConfig {
            providers: vec![
                provider_config("cloud", "elevenlabs"),
                provider_config("edge", "openai"),
                provider_config("mystery", "carrier-pigeon"),
            ],
            ..TtsConfig::default()
        };
        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(registry.list(), vec!["cloud", "edge"]);
        assert!(registry.get("edge").unwrap().is_local());
        assert!(!registry.get("cloud").unwrap().is_local());
        assert!(registry.get("mystery").is_none());
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
