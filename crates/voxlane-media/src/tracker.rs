//! Response & cancellation tracking.
//!
//! Holds the single active response and a generation counter. The counter
//! moves exactly once per cancellation and once per response that replaces
//! a still-active one. Completion never moves it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use voxlane_core::error::VoiceError;

const DEFAULT_HISTORY_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Active,
    Cancelled,
    Completed,
    /// Replaced by a newer response before finishing.
    Stale,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Stale => "stale",
        }
    }
}

/// One assistant utterance as seen by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStream {
    pub response_id: String,
    /// Generation in force when the response became active.
    pub session_generation: u64,
    pub status: ResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// Upstream created a response while another was active. The new
    /// response has been installed; the old one is Stale.
    #[error(
        "response {incoming} created while {previous} was active (now generation {generation})"
    )]
    Superseded {
        previous: String,
        incoming: String,
        generation: u64,
    },

    #[error("response {0} is already active")]
    AlreadyActive(String),
}

impl From<TrackerError> for VoiceError {
    fn from(e: TrackerError) -> Self {
        VoiceError::ProtocolViolation(e.to_string())
    }
}

#[derive(Debug)]
struct TrackerState {
    active: Option<ResponseStream>,
    generation: u64,
    history: VecDeque<ResponseStream>,
    history_limit: usize,
}

impl TrackerState {
    fn retire(&mut self, mut stream: ResponseStream, status: ResponseStatus) {
        stream.status = status;
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(stream);
    }
}

/// Cloneable handle; every clone sees the same state.
#[derive(Debug, Clone)]
pub struct ResponseTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl Default for ResponseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                active: None,
                generation: 0,
                history: VecDeque::with_capacity(history_limit),
                history_limit: history_limit.max(1),
            })),
        }
    }

    /// Make `response_id` the active response and return its generation.
    pub fn register_response(&self, response_id: &str) -> Result<u64, TrackerError> {
        let mut state = self.state.lock();

        let previous = match state.active.take() {
            Some(active) if active.response_id == response_id => {
                state.active = Some(active);
                return Err(TrackerError::AlreadyActive(response_id.to_string()));
            }
            other => other,
        };

        let superseded = previous.map(|old| {
            state.generation += 1;
            let id = old.response_id.clone();
            state.retire(old, ResponseStatus::Stale);
            id
        });

        let generation = state.generation;
        state.active = Some(ResponseStream {
            response_id: response_id.to_string(),
            session_generation: generation,
            status: ResponseStatus::Active,
        });

        match superseded {
            Some(previous) => {
                warn!(
                    previous = %previous,
                    response_id,
                    generation,
                    "Response created while another was active"
                );
                Err(TrackerError::Superseded {
                    previous,
                    incoming: response_id.to_string(),
                    generation,
                })
            }
            None => {
                debug!(response_id, generation, "Response registered");
                Ok(generation)
            }
        }
    }

    /// Cancel the active response. With nothing active this does nothing:
    /// the cancel lost a race with completion.
    pub fn cancel_active(&self) -> Option<ResponseStream> {
        let mut state = self.state.lock();
        let Some(active) = state.active.take() else {
            debug!(generation = state.generation, "Cancel with no active response");
            return None;
        };
        state.generation += 1;
        let generation = state.generation;
        state.retire(active.clone(), ResponseStatus::Cancelled);
        debug!(response_id = %active.response_id, generation, "Active response cancelled");
        Some(ResponseStream {
            status: ResponseStatus::Cancelled,
            ..active
        })
    }

    /// Mark `response_id` completed if it is the active response.
    pub fn complete(&self, response_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.active.take() {
            Some(active) if active.response_id == response_id => {
                state.retire(active, ResponseStatus::Completed);
                debug!(response_id, "Response completed");
                true
            }
            other => {
                state.active = other;
                debug!(response_id, "Completion for a response that is not active");
                false
            }
        }
    }

    /// True unless `response_id` is the active response and `generation`
    /// is the current generation.
    pub fn is_stale(&self, response_id: &str, generation: u64) -> bool {
        let state = self.state.lock();
        match &state.active {
            Some(active) => active.response_id != response_id || generation < state.generation,
            None => true,
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn active(&self) -> Option<ResponseStream> {
        self.state.lock().active.clone()
    }

    pub fn active_id(&self) -> Option<String> {
        self.state.lock().active.as_ref().map(|a| a.response_id.clone())
    }

    /// Generation a response was registered at, if it is active or still in history.
    pub fn generation_of(&self, response_id: &str) -> Option<u64> {
        let state = self.state.lock();
        if let Some(active) = state.active.as_ref().filter(|a| a.response_id == response_id) {
            return Some(active.session_generation);
        }
        state
            .history
            .iter()
            .rev()
            .find(|s| s.response_id == response_id)
            .map(|s| s.session_generation)
    }

    pub fn status_of(&self, response_id: &str) -> Option<ResponseStatus> {
        let state = self.state.lock();
        if let Some(active) = state.active.as_ref().filter(|a| a.response_id == response_id) {
            return Some(active.status);
        }
        state
            .history
            .iter()
            .rev()
            .find(|s| s.response_id == response_id)
            .map(|s| s.status)
    }

    /// Finished responses, oldest first.
    pub fn history(&self) -> Vec<ResponseStream> {
        self.state.lock().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_returns_current_generation() {
        let tracker = ResponseTracker::new();
        assert_eq!(tracker.register_response("r1").unwrap(), 0);
        assert_eq!(tracker.active_id().as_deref(), Some("r1"));
        assert!(!tracker.is_stale("r1", 0));
    }

    #[test]
    fn test_completion_does_not_move_generation() {
        let tracker = ResponseTracker::new();
        tracker.register_response("r1").unwrap();
        assert!(tracker.complete("r1"));
        assert_eq!(tracker.generation(), 0);
        assert_eq!(tracker.status_of("r1"), Some(ResponseStatus::Completed));

        assert_eq!(tracker.register_response("r2").unwrap(), 0);
    }

    #[test]
    fn test_cancel_increments_generation_once() {
        let tracker = ResponseTracker::new();
        tracker.register_response("r1").unwrap();
        let cancelled = tracker.cancel_active().unwrap();
        assert_eq!(cancelled.response_id, "r1");
        assert_eq!(cancelled.status, ResponseStatus::Cancelled);
        assert_eq!(tracker.generation(), 1);
        assert!(tracker.is_stale("r1", 0));
    }

    #[test]
    fn test_cancel_without_active_is_noop_for_any_count() {
        for calls in 0..5 {
            let tracker = ResponseTracker::new();
            for _ in 0..calls {
                assert!(tracker.cancel_active().is_none());
            }
            assert_eq!(tracker.generation(), 0);
            assert!(tracker.history().is_empty());
        }

        // Late cancel after completion
        let tracker = ResponseTracker::new();
        tracker.register_response("r1").unwrap();
        tracker.complete("r1");
        assert!(tracker.cancel_active().is_none());
        assert!(tracker.cancel_active().is_none());
        assert_eq!(tracker.generation(), 0);
        assert_eq!(tracker.status_of("r1"), Some(ResponseStatus::Completed));
    }

    #[test]
    fn test_register_while_active_supersedes() {
        let tracker = ResponseTracker::new();
        tracker.register_response("r1").unwrap();

        let err = tracker.register_response("r2").unwrap_err();
        assert_eq!(
            err,
            TrackerError::Superseded {
                previous: "r1".into(),
                incoming: "r2".into(),
                generation: 1,
            }
        );
        assert_eq!(tracker.active_id().as_deref(), Some("r2"));
        assert_eq!(tracker.status_of("r1"), Some(ResponseStatus::Stale));
        assert!(tracker.is_stale("r1", 0));
        assert!(!tracker.is_stale("r2", 1));
        assert_eq!(tracker.generation_of("r1"), Some(0));
        assert_eq!(tracker.generation_of("r2"), Some(1));
    }

    #[test]
    fn test_register_same_id_is_rejected_without_change() {
        let tracker = ResponseTracker::new();
        tracker.register_response("r1").unwrap();
        assert_eq!(
            tracker.register_response("r1").unwrap_err(),
            TrackerError::AlreadyActive("r1".into())
        );
        assert_eq!(tracker.generation(), 0);
        assert!(!tracker.is_stale("r1", 0));
    }

    #[test]
    fn test_is_stale_for_unknown_and_old_generation() {
        let tracker = ResponseTracker::new();
        assert!(tracker.is_stale("nobody", 0));

        tracker.register_response("r1").unwrap();
        tracker.cancel_active();
        tracker.register_response("r2").unwrap();
        assert!(!tracker.is_stale("r2", 1));
        assert!(tracker.is_stale("r2", 0));
        assert!(tracker.is_stale("r1", 1));
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = ResponseTracker::with_history_limit(2);
        for i in 0..4 {
            let id = format!("r{i}");
            tracker.register_response(&id).unwrap();
            tracker.complete(&id);
        }
        let ids: Vec<_> = tracker.history().into_iter().map(|s| s.response_id).collect();
        assert_eq!(ids, vec!["r2", "r3"]);
    }

    #[test]
    fn test_tracker_error_maps_to_protocol_violation() {
        let err: VoiceError = TrackerError::AlreadyActive("r1".into()).into();
        assert!(matches!(err, VoiceError::ProtocolViolation(_)));
    }
}
