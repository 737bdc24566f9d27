//! Reachability probes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("health endpoint returned {0}")]
    Status(u16),

    #[error("probe transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Round-trip latency to `endpoint`.
    async fn probe(&self, endpoint: &str) -> Result<Duration, ProbeError>;
}

/// GETs the health endpoint and times the response headers.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, endpoint: &str) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let resp = self.client.get(endpoint).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Transport(e.to_string())
            }
        })?;
        let elapsed = started.elapsed();

        let status = resp.status();
        trace!(endpoint, status = status.as_u16(), ?elapsed, "Health probe");
        if status.is_server_error() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(elapsed)
    }
}
