//! Counters reported through the `metrics` facade.
//!
//! Without an installed recorder every call is a no-op.

/// A response was cancelled by barge-in or by the server.
pub fn record_cancellation(origin: &str) {
    let labels = [("origin", origin.to_string())];
    metrics::counter!("voice_cancellations_total", &labels).increment(1);
}

pub fn record_stale_chunk_dropped() {
    metrics::counter!("voice_stale_chunks_dropped_total").increment(1);
}

pub fn record_duplicate_chunk_dropped() {
    metrics::counter!("voice_duplicate_chunks_dropped_total").increment(1);
}

/// A second playback handle had to be force-stopped.
pub fn record_playback_heal() {
    metrics::counter!("voice_playback_heals_total").increment(1);
}

pub fn record_tts_fallback(provider: &str) {
    let labels = [("provider", provider.to_string())];
    metrics::counter!("tts_fallback_total", &labels).increment(1);
}

pub fn record_tts_failure(provider: &str, kind: &str) {
    let labels = [
        ("provider", provider.to_string()),
        ("kind", kind.to_string()),
    ];
    metrics::counter!("tts_failures_total", &labels).increment(1);
}

pub fn record_tts_cache_hit() {
    metrics::counter!("tts_cache_hits_total").increment(1);
}

pub fn record_tier_transition(from: &str, to: &str) {
    let labels = [("from", from.to_string()), ("to", to.to_string())];
    metrics::counter!("network_tier_transitions_total", &labels).increment(1);
}

pub fn record_reconnect_attempt() {
    metrics::counter!("session_reconnect_attempts_total").increment(1);
}

/// Outcome of waiting for `response.cancelled`: "acked", "timeout", or "race".
pub fn record_cancel_ack(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("session_cancel_ack_total", &labels).increment(1);
}

pub fn record_state_transition(to: &str) {
    let labels = [("to", to.to_string())];
    metrics::counter!("session_state_transitions_total", &labels).increment(1);
}

pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("voice_errors_total", &labels).increment(1);
}
