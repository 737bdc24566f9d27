//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};
use crate::types::VoicePreferenceSnapshot;

/// Top-level Voxlane configuration, loaded from `~/.voxlane/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad: Option<VadConfig>,

    /// Defaults used to seed the in-memory preference store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences: Option<VoicePreferenceSnapshot>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

// --- Reasoning/speech service ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket URL of the voice service.
    #[serde(default = "default_server_url")]
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,

    /// How long to wait for the `connected` frame after the upgrade.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8765/voice".into()
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            auth_token: None,
            auth_token_env: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn resolve_auth_token(&self) -> Option<String> {
        resolve_secret_field(&self.auth_token, &self.auth_token_env)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// --- Session ---

/// What the playback arbiter does when a second handle would start while
/// one is still playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Panic. Used in debug builds so the bug is caught early.
    FailFast,
    /// Force-stop the old handle and continue.
    SelfHeal,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::FailFast
        } else {
            Self::SelfHeal
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Close the session after this long without user or server activity.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Frames held while connecting or reconnecting. Oldest dropped first.
    #[serde(default = "default_send_buffer_limit")]
    pub send_buffer_limit: usize,

    /// Advisory wait for `response.cancelled` after a barge-in.
    #[serde(default = "default_cancel_ack_timeout_ms")]
    pub cancel_ack_timeout_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap_policy: Option<OverlapPolicy>,
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_ping_interval_ms() -> u64 {
    15_000
}

fn default_send_buffer_limit() -> usize {
    256
}

fn default_cancel_ack_timeout_ms() -> u64 {
    2_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            send_buffer_limit: default_send_buffer_limit(),
            cancel_ack_timeout_ms: default_cancel_ack_timeout_ms(),
            overlap_policy: None,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.overlap_policy.unwrap_or_default()
    }
}

// --- Reconnection ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on a single connect attempt.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Relative jitter applied to each delay, in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Fixed RNG seed for a reproducible schedule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_base_delay_ms() -> u64 {
    300
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    6
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            jitter: default_jitter(),
            seed: None,
        }
    }
}

impl ReconnectConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

// --- Network quality ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// HTTP endpoint probed for latency. Derived from the server URL when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Upper bound (exclusive) for the Excellent tier.
    #[serde(default = "default_excellent_below_ms")]
    pub excellent_below_ms: u64,

    #[serde(default = "default_good_below_ms")]
    pub good_below_ms: u64,

    /// Latencies at or above this are Poor.
    #[serde(default = "default_moderate_below_ms")]
    pub moderate_below_ms: u64,

    /// Consecutive unfavorable samples before a demotion is confirmed.
    #[serde(default = "default_demote_after")]
    pub demote_after: u32,

    /// Consecutive favorable samples before a promotion. 0 or 1 is immediate.
    #[serde(default = "default_promote_after")]
    pub promote_after: u32,

    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_probe_interval_ms() -> u64 {
    2_000
}

fn default_probe_timeout_ms() -> u64 {
    1_500
}

fn default_excellent_below_ms() -> u64 {
    100
}

fn default_good_below_ms() -> u64 {
    200
}

fn default_moderate_below_ms() -> u64 {
    500
}

fn default_demote_after() -> u32 {
    3
}

fn default_promote_after() -> u32 {
    1
}

fn default_window_size() -> usize {
    20
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            health_endpoint: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            excellent_below_ms: default_excellent_below_ms(),
            good_below_ms: default_good_below_ms(),
            moderate_below_ms: default_moderate_below_ms(),
            demote_after: default_demote_after(),
            promote_after: default_promote_after(),
            window_size: default_window_size(),
        }
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// --- Speech synthesis ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Per-provider synthesis timeout.
    #[serde(default = "default_synthesis_timeout_ms")]
    pub synthesis_timeout_ms: u64,

    #[serde(default)]
    pub providers: Vec<TtsProviderConfig>,

    /// Weight of the user's own voice values in the style blend.
    #[serde(default = "default_user_weight")]
    pub user_weight: f64,

    /// Entries kept in the phrase cache. 0 disables it.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_synthesis_timeout_ms() -> u64 {
    4_000
}

fn default_user_weight() -> f64 {
    0.6
}

fn default_cache_capacity() -> usize {
    64
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            synthesis_timeout_ms: default_synthesis_timeout_ms(),
            providers: Vec::new(),
            user_weight: default_user_weight(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl TtsConfig {
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn provider(&self, id: &str) -> Option<&TtsProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}

/// Configuration for a single TTS provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsProviderConfig {
    pub id: String,

    /// Backend kind: "elevenlabs" or "openai".
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Fixed voice for this provider, overriding the user's voice id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,

    /// Runs on-device or on the local network; preferred when connectivity is poor.
    #[serde(default)]
    pub local: bool,
}

fn default_provider_kind() -> String {
    "elevenlabs".into()
}

impl TtsProviderConfig {
    /// Resolve the API key: check `api_key` first, then the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Local speech detection ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// RMS threshold at sensitivity 100.
    #[serde(default = "default_min_rms")]
    pub min_rms: f64,

    /// RMS threshold at sensitivity 0.
    #[serde(default = "default_max_rms")]
    pub max_rms: f64,

    /// Silent frames before an utterance is considered finished.
    #[serde(default = "default_silence_frames")]
    pub silence_frames: usize,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_frame_ms() -> u32 {
    20
}

fn default_min_rms() -> f64 {
    150.0
}

fn default_max_rms() -> f64 {
    1_200.0
}

fn default_silence_frames() -> usize {
    15
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
            min_rms: default_min_rms(),
            max_rms: default_max_rms(),
            silence_frames: default_silence_frames(),
        }
    }
}

impl VadConfig {
    /// Map a 0-100 sensitivity onto an RMS threshold. Higher sensitivity
    /// means a lower threshold.
    pub fn threshold_for(&self, sensitivity: u8) -> f64 {
        let s = f64::from(sensitivity.min(100)) / 100.0;
        self.max_rms - (self.max_rms - self.min_rms) * s
    }

    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

// --- Logging & metrics ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxlane_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus exporter, e.g. "127.0.0.1:9464".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus_addr: Option<String>,
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| VoiceError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw)?;

        let config: Config =
            json5::from_str(&substituted).map_err(|e| VoiceError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        self.reconnect.clone().unwrap_or_default()
    }

    pub fn network(&self) -> NetworkConfig {
        self.network.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn vad(&self) -> VadConfig {
        self.vad.clone().unwrap_or_default()
    }

    pub fn preferences(&self) -> VoicePreferenceSnapshot {
        self.preferences.clone().unwrap_or_default()
    }

    /// Health endpoint to probe: explicit setting, else `/health` on the
    /// voice server's host with an http(s) scheme.
    pub fn health_endpoint(&self) -> String {
        if let Some(endpoint) = self.network.as_ref().and_then(|n| n.health_endpoint.clone()) {
            return endpoint;
        }
        let url = self.server().url;
        let http = if let Some(rest) = url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            url
        };
        // Keep scheme and authority only
        let authority_end = http
            .find("://")
            .and_then(|i| http[i + 3..].find('/').map(|j| i + 3 + j))
            .unwrap_or(http.len());
        format!("{}/health", &http[..authority_end])
    }

    /// Get a config value by dotted path (e.g. "network.demote_after").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Set a config value by dotted path.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let mut json = serde_json::to_value(&*self)
            .map_err(|e| anyhow::anyhow!("Config serialization error: {e}"))?;

        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            anyhow::bail!("Empty path");
        };

        let mut current = &mut json;
        for segment in parents {
            if current.get(*segment).is_none() {
                current[*segment] = serde_json::json!({});
            }
            current = current
                .get_mut(*segment)
                .ok_or_else(|| anyhow::anyhow!("Cannot descend into '{segment}'"))?;
        }
        current[*last] = value;

        *self = serde_json::from_value(json)
            .map_err(|e| anyhow::anyhow!("Config deserialization error: {e}"))?;
        Ok(())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let server = self.server();
        if !(server.url.starts_with("ws://") || server.url.starts_with("wss://")) {
            errors.push(format!("Server url must use ws:// or wss://: {}", server.url));
        }
        if server.resolve_auth_token().is_none() {
            warnings.push("No server auth token configured".to_string());
        }

        let network = self.network();
        if !(network.excellent_below_ms < network.good_below_ms
            && network.good_below_ms < network.moderate_below_ms)
        {
            errors.push("Network tier thresholds must be strictly increasing".to_string());
        }
        if network.demote_after == 0 {
            errors.push("network.demote_after must be at least 1".to_string());
        }
        if network.probe_interval_ms == 0 {
            errors.push("network.probe_interval_ms cannot be 0".to_string());
        }

        let reconnect = self.reconnect();
        if reconnect.base_delay_ms > reconnect.max_delay_ms {
            errors.push("reconnect.base_delay_ms exceeds reconnect.max_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            errors.push("reconnect.jitter must be within [0, 1]".to_string());
        }

        let tts = self.tts();
        if !(0.0..=1.0).contains(&tts.user_weight) {
            errors.push("tts.user_weight must be within [0, 1]".to_string());
        }
        if tts.providers.is_empty() {
            warnings.push("No TTS providers configured; local synthesis disabled".to_string());
        }
        for p in &tts.providers {
            if !p.local && p.resolve_api_key().is_none() {
                warnings.push(format!("TTS provider '{}' has no API key configured", p.id));
            }
            if p.kind != "elevenlabs" && p.kind != "openai" {
                errors.push(format!("TTS provider '{}' has unknown kind '{}'", p.id, p.kind));
            }
        }

        let vad = self.vad();
        if vad.min_rms >= vad.max_rms {
            errors.push("vad.min_rms must be below vad.max_rms".to_string());
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Voxlane data: `~/.voxlane/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxlane")
}

/// Expand a leading `~` in a user-supplied path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
