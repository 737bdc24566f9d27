//! The session reactor.
//!
//! Every input (caller commands, server frames, synthesis results, tier
//! changes, timers) arrives on one queue and is handled to completion before
//! the next. Handlers never await; slow work is spawned and reports back as
//! another input.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use voxlane_core::config::{Config, ReconnectConfig, SessionConfig, VadConfig};
use voxlane_core::error::{Result, VoiceError};
use voxlane_core::metrics;
use voxlane_core::preferences::PreferenceStore;
use voxlane_core::protocol::{ClientFrame, DoneMessage, ServerFrame, server_error};
use voxlane_core::types::{AudioChunk, VoicePreferenceSnapshot};
use voxlane_media::{AcceptOutcome, PlaybackArbiter, ResponseTracker, TrackerError, VadEvent, VoiceActivityDetector};
use voxlane_network::{NetworkMonitor, NetworkTier, SubscriptionToken, TierChange};
use voxlane_tts::{AudioResult, TtsError, TtsRouter};

use crate::connection::{Connector, Link, LinkEvent, ServerHello};
use crate::events::{SessionEvent, SessionSnapshot};
use crate::reconnect::{connect_with_timeout, reconnect_with_backoff};
use crate::speech::ResponseSpeech;
use crate::state::{DetectionMode, SessionState, VoiceSession};

/// Idle and keepalive checks run on this period.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) enum Input {
    Open(oneshot::Sender<Result<()>>),
    SendAudio(Vec<u8>, oneshot::Sender<Result<()>>),
    SendText(String, oneshot::Sender<Result<()>>),
    /// Speech detected by a detector outside the session.
    SpeechStarted,
    UseRemoteDetection(oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Close(oneshot::Sender<()>),

    Connected {
        result: Result<Link>,
        preferences: VoicePreferenceSnapshot,
    },
    Reconnected(Result<Link>),
    Link {
        epoch: u64,
        event: LinkEvent,
    },
    Tier(TierChange),
    Preferences(VoicePreferenceSnapshot),
    Synthesized {
        response_id: String,
        generation: u64,
        result: std::result::Result<AudioResult, TtsError>,
    },
    CancelAckTimeout {
        response_id: String,
    },
}

/// Collaborators handed to the reactor by the builder.
pub(crate) struct Parts {
    pub config: Config,
    pub connector: Arc<dyn Connector>,
    pub tracker: ResponseTracker,
    pub arbiter: Arc<PlaybackArbiter>,
    pub tts: Option<Arc<TtsRouter>>,
    pub monitor: Option<NetworkMonitor>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub events: broadcast::Sender<SessionEvent>,
    /// Cancelled when the last handle is dropped.
    pub released: CancellationToken,
}

pub(crate) struct Reactor {
    session_cfg: SessionConfig,
    reconnect_cfg: ReconnectConfig,
    vad_cfg: VadConfig,
    probe_interval: Duration,
    health_endpoint: String,

    connector: Arc<dyn Connector>,
    tracker: ResponseTracker,
    arbiter: Arc<PlaybackArbiter>,
    tts: Option<Arc<TtsRouter>>,
    monitor: Option<NetworkMonitor>,
    monitor_sub: Option<SubscriptionToken>,
    store: Arc<dyn PreferenceStore>,
    events: broadcast::Sender<SessionEvent>,
    inputs: mpsc::UnboundedSender<Input>,
    /// Cancels every task this session spawned.
    shutdown: CancellationToken,
    released: CancellationToken,

    state: SessionState,
    session: Option<VoiceSession>,
    prefs: VoicePreferenceSnapshot,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    link_epoch: u64,
    open_waiter: Option<oneshot::Sender<Result<()>>>,
    send_buffer: VecDeque<ClientFrame>,

    detection: DetectionMode,
    tier: Option<NetworkTier>,
    remote_switch_pending: bool,
    vad: VoiceActivityDetector,

    speech: Option<ResponseSpeech>,
    awaiting_ack: Option<String>,
    reconnect_task: Option<CancellationToken>,

    last_activity: Instant,
    last_ping: Instant,
}

impl Reactor {
    pub(crate) fn new(parts: Parts, inputs: mpsc::UnboundedSender<Input>) -> Self {
        let Parts {
            config,
            connector,
            tracker,
            arbiter,
            tts,
            monitor,
            preferences,
            events,
            released,
        } = parts;
        let prefs = config.preferences();
        let vad_cfg = config.vad();
        let now = Instant::now();

        Self {
            session_cfg: config.session(),
            reconnect_cfg: config.reconnect(),
            probe_interval: config.network().probe_interval(),
            health_endpoint: config.health_endpoint(),
            vad: VoiceActivityDetector::from_config(&vad_cfg, prefs.vad_sensitivity),
            vad_cfg,
            connector,
            tracker,
            arbiter,
            tts,
            monitor,
            monitor_sub: None,
            store: preferences,
            events,
            inputs,
            shutdown: CancellationToken::new(),
            released,
            state: SessionState::Idle,
            session: None,
            prefs,
            outbound: None,
            link_epoch: 0,
            open_waiter: None,
            send_buffer: VecDeque::new(),
            detection: DetectionMode::Remote,
            tier: None,
            remote_switch_pending: false,
            speech: None,
            awaiting_ack: None,
            reconnect_task: None,
            last_activity: now,
            last_ping: now,
        }
    }

    pub(crate) async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let released = self.released.clone();
        loop {
            tokio::select! {
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    self.handle(input);
                }
                _ = housekeeping.tick() => self.housekeeping(),
                _ = released.cancelled() => break,
            }
            if self.state.is_terminal() {
                break;
            }
        }

        self.close_session("session dropped");
        debug!("Session loop exited");
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Open(reply) => self.on_open(reply),
            Input::SendAudio(frame, reply) => {
                let _ = reply.send(self.on_send_audio(frame));
            }
            Input::SendText(text, reply) => {
                let _ = reply.send(self.on_send_text(text));
            }
            Input::SpeechStarted => self.on_speech_started("local"),
            Input::UseRemoteDetection(reply) => {
                let _ = reply.send(self.on_use_remote_detection());
            }
            Input::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Input::Close(reply) => {
                self.close_session("closed by caller");
                let _ = reply.send(());
            }
            Input::Connected {
                result,
                preferences,
            } => self.on_connected(result, preferences),
            Input::Reconnected(result) => self.on_reconnected(result),
            Input::Link { epoch, event } => {
                if epoch != self.link_epoch {
                    trace!(epoch, current = self.link_epoch, "Ignoring event from old link");
                    return;
                }
                match event {
                    LinkEvent::Frame(frame) => self.on_frame(frame),
                    LinkEvent::Closed { reason } => self.on_transport_lost(&reason),
                }
            }
            Input::Tier(change) => self.on_tier(change),
            Input::Preferences(snapshot) => self.on_preferences(snapshot),
            Input::Synthesized {
                response_id,
                generation,
                result,
            } => self.on_synthesized(response_id, generation, result),
            Input::CancelAckTimeout { response_id } => self.on_cancel_ack_timeout(&response_id),
        }
    }

    // --- Lifecycle ---

    fn on_open(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.state {
            SessionState::Idle => {}
            SessionState::Closed => {
                let _ = reply.send(Err(VoiceError::Closed));
                return;
            }
            _ => {
                debug!(state = %self.state, "open() ignored, session already started");
                let _ = reply.send(Ok(()));
                return;
            }
        }

        self.transition(SessionState::Connecting);
        self.open_waiter = Some(reply);
        self.spawn_preference_listener();

        let connector = self.connector.clone();
        let store = self.store.clone();
        let fallback = self.prefs.clone();
        let timeout = self.reconnect_cfg.attempt_timeout();
        let inputs = self.inputs.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let preferences = match store.get().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(%e, "Failed to load voice preferences, using defaults");
                    fallback
                }
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connect_with_timeout(connector.as_ref(), timeout) => result,
            };
            let _ = inputs.send(Input::Connected {
                result,
                preferences,
            });
        });
    }

    fn on_connected(&mut self, result: Result<Link>, preferences: VoicePreferenceSnapshot) {
        if self.state != SessionState::Connecting {
            debug!(state = %self.state, "Discarding late handshake result");
            return;
        }
        let waiter = self.open_waiter.take();

        match result {
            Ok(link) => {
                let hello = self.install_link(link);
                self.apply_preferences(preferences);
                let mut session = VoiceSession::new(hello.client_id.clone(), self.prefs.clone());
                session.generation = self.tracker.generation();
                self.session = Some(session);
                self.subscribe_monitor();
                self.touch();

                info!(session_id = %hello.client_id, "Voice session opened");
                self.transition(SessionState::Listening);
                self.flush_buffer();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) if e.is_fatal() => {
                error!(%e, "Voice service rejected the session");
                self.fail(&e);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(e));
                }
            }
            Err(e) => {
                warn!(%e, "Handshake failed");
                metrics::record_error(e.kind());
                if !self.send_buffer.is_empty() {
                    debug!(dropped = self.send_buffer.len(), "Discarding frames buffered for failed open");
                    self.send_buffer.clear();
                }
                self.transition(SessionState::Idle);
                if let Some(waiter) = waiter {
                    let error = match e {
                        VoiceError::Connection(_) => e,
                        other => VoiceError::Connection(other.to_string()),
                    };
                    let _ = waiter.send(Err(error));
                }
            }
        }
    }

    fn install_link(&mut self, link: Link) -> ServerHello {
        self.link_epoch += 1;
        let epoch = self.link_epoch;
        let Link {
            hello,
            outbound,
            mut inbound,
        } = link;
        self.outbound = Some(outbound);
        self.last_ping = Instant::now();

        let inputs = self.inputs.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = inbound.recv() => event.unwrap_or_else(|| LinkEvent::Closed {
                        reason: "link dropped".into(),
                    }),
                };
                let closed = matches!(event, LinkEvent::Closed { .. });
                if inputs.send(Input::Link { epoch, event }).is_err() || closed {
                    break;
                }
            }
        });
        hello
    }

    fn on_transport_lost(&mut self, reason: &str) {
        self.outbound = None;
        if !self.state.is_connected() {
            return;
        }
        warn!(reason, state = %self.state, "Transport lost, reconnecting");
        if let Some(monitor) = &self.monitor {
            monitor.report_transport_offline();
        }
        self.transition(SessionState::Reconnecting);

        let token = self.shutdown.child_token();
        self.reconnect_task = Some(token.clone());
        let connector = self.connector.clone();
        let config = self.reconnect_cfg.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            if let Some(result) = reconnect_with_backoff(connector.as_ref(), &config, &token).await {
                let _ = inputs.send(Input::Reconnected(result));
            }
        });
    }

    fn on_reconnected(&mut self, result: Result<Link>) {
        self.reconnect_task = None;
        if self.state != SessionState::Reconnecting {
            return;
        }
        match result {
            Ok(link) => {
                let hello = self.install_link(link);
                if let Some(stream) = self.tracker.cancel_active() {
                    info!(response_id = %stream.response_id, "Dropping response interrupted by reconnect");
                    metrics::record_cancellation("reconnect");
                }
                self.arbiter.stop();
                self.speech = None;
                self.awaiting_ack = None;
                self.sync_session();
                self.touch();
                debug!(client_id = %hello.client_id, "Link re-established");
                self.transition(SessionState::Listening);
                self.flush_buffer();
            }
            Err(e) => {
                error!(%e, "Reconnection failed");
                self.fail(&e);
            }
        }
    }

    /// Surface a fatal error and close.
    fn fail(&mut self, error: &VoiceError) {
        metrics::record_error(error.kind());
        let _ = self.events.send(SessionEvent::from_error(error));
        self.close_session(&error.to_string());
    }

    fn close_session(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(task) = self.reconnect_task.take() {
            task.cancel();
        }
        self.shutdown.cancel();
        if let Some(monitor) = &self.monitor {
            if let Some(token) = self.monitor_sub.take() {
                monitor.unsubscribe(token);
            }
        }

        self.tracker.cancel_active();
        self.arbiter.stop();
        self.speech = None;
        self.awaiting_ack = None;
        self.outbound = None;
        if !self.send_buffer.is_empty() {
            debug!(dropped = self.send_buffer.len(), "Discarding buffered frames");
            self.send_buffer.clear();
        }
        if let Some(waiter) = self.open_waiter.take() {
            let _ = waiter.send(Err(VoiceError::Closed));
        }
        self.sync_session();

        info!(reason, "Voice session closed");
        self.transition(SessionState::Closed);
    }

    fn housekeeping(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_activity) >= self.session_cfg.idle_timeout() {
            info!(idle = ?self.session_cfg.idle_timeout(), "Closing idle session");
            self.close_session("idle timeout");
            return;
        }
        if now.duration_since(self.last_ping) >= self.session_cfg.ping_interval() {
            self.last_ping = now;
            self.send_frame(ClientFrame::Ping);
        }
    }

    // --- Caller commands ---

    fn on_send_audio(&mut self, frame: Vec<u8>) -> Result<()> {
        match self.state {
            SessionState::Idle => Err(self.invalid("send_audio")),
            SessionState::Closed => Err(VoiceError::Closed),
            SessionState::Connecting | SessionState::Reconnecting => {
                self.buffer_frame(ClientFrame::AudioChunk { audio: frame });
                Ok(())
            }
            SessionState::Listening | SessionState::Thinking => {
                self.touch();
                let events = self.detect_local(&frame);
                self.send_frame(ClientFrame::AudioChunk { audio: frame });
                self.apply_vad_events(events);
                Ok(())
            }
            SessionState::Speaking | SessionState::Interrupted => {
                // Not forwarded; only listened to for barge-in
                self.touch();
                let events = self.detect_local(&frame);
                self.apply_vad_events(events);
                Ok(())
            }
        }
    }

    fn on_send_text(&mut self, text: String) -> Result<()> {
        match self.state {
            SessionState::Idle => Err(self.invalid("send_text")),
            SessionState::Closed => Err(VoiceError::Closed),
            SessionState::Connecting | SessionState::Reconnecting => {
                self.buffer_frame(ClientFrame::Text { text });
                Ok(())
            }
            SessionState::Speaking => {
                self.touch();
                self.barge_in("text");
                self.send_frame(ClientFrame::Text { text });
                self.transition(SessionState::Thinking);
                Ok(())
            }
            SessionState::Listening | SessionState::Thinking | SessionState::Interrupted => {
                self.touch();
                self.send_frame(ClientFrame::Text { text });
                if self.state != SessionState::Thinking {
                    self.transition(SessionState::Thinking);
                }
                Ok(())
            }
        }
    }

    fn on_use_remote_detection(&mut self) -> Result<()> {
        if self.detection == DetectionMode::Remote {
            return Ok(());
        }
        if self.tier.is_some_and(NetworkTier::is_degraded) {
            return Err(VoiceError::InvalidState {
                operation: "use_remote_detection".into(),
                state: format!("network {}", self.tier.map(|t| t.as_str()).unwrap_or("unknown")),
            });
        }
        if self.state == SessionState::Speaking {
            // Applied once the utterance ends
            self.remote_switch_pending = true;
        } else {
            self.set_detection(DetectionMode::Remote);
        }
        Ok(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.as_ref().map(|s| s.session_id.clone()),
            state: self.state,
            active_response_id: self.tracker.active_id(),
            generation: self.tracker.generation(),
            detection_mode: self.detection,
            network_tier: self.tier,
            dropped_chunks: self.arbiter.stats().dropped_stale,
            buffered_frames: self.send_buffer.len(),
        }
    }

    // --- Server frames ---

    fn on_frame(&mut self, frame: ServerFrame) {
        trace!(kind = frame.kind(), "Server frame");
        if !matches!(frame, ServerFrame::Pong) {
            self.touch();
        }
        match frame {
            ServerFrame::Connected { client_id, .. } => {
                warn!(%client_id, "Unexpected connected frame mid-session");
                metrics::record_error("protocol_violation");
            }
            ServerFrame::ResponseCreated { response_id } => self.on_response_created(response_id),
            ServerFrame::Chunk {
                response_id,
                sequence,
                audio,
                text,
                is_final,
            } => self.on_chunk(response_id, sequence, audio, text, is_final),
            ServerFrame::MessageDone {
                response_id,
                message,
            } => self.on_message_done(response_id, message),
            ServerFrame::ResponseCancelled { response_id } => self.on_response_cancelled(&response_id),
            ServerFrame::Error {
                code,
                message,
                retry_after_ms,
            } => self.on_server_error(&code, &message, retry_after_ms),
            ServerFrame::Pong => debug!("pong"),
            ServerFrame::SpeechStarted => self.on_speech_started("remote"),
            ServerFrame::SpeechStopped => {
                if self.state == SessionState::Listening && self.detection == DetectionMode::Remote {
                    self.transition(SessionState::Thinking);
                }
            }
        }
    }

    fn on_response_created(&mut self, response_id: String) {
        match self.state {
            SessionState::Listening | SessionState::Thinking => {
                if self.state == SessionState::Listening {
                    // The service committed the turn on its own
                    self.transition(SessionState::Thinking);
                }
                if let Some(generation) = self.register(&response_id) {
                    self.begin_response(response_id, generation);
                    self.transition(SessionState::Speaking);
                }
            }
            SessionState::Speaking => {
                if let Some(generation) = self.register(&response_id) {
                    self.begin_response(response_id, generation);
                }
            }
            state => debug!(%state, %response_id, "Ignoring response.created"),
        }
    }

    /// Register with the tracker. A superseded response is a tolerated
    /// protocol violation; the old playback is stopped.
    fn register(&mut self, response_id: &str) -> Option<u64> {
        match self.tracker.register_response(response_id) {
            Ok(generation) => Some(generation),
            Err(TrackerError::Superseded {
                previous,
                incoming,
                generation,
            }) => {
                warn!(%previous, %incoming, generation, "Response created while another was active");
                metrics::record_error("protocol_violation");
                self.arbiter.stop();
                Some(generation)
            }
            Err(e @ TrackerError::AlreadyActive(_)) => {
                debug!(%e, "Duplicate response.created");
                None
            }
        }
    }

    fn begin_response(&mut self, response_id: String, generation: u64) {
        debug!(%response_id, generation, "Response started");
        self.speech = Some(ResponseSpeech::new(response_id, generation));
        self.vad.reset();
        self.sync_session();
    }

    fn on_chunk(
        &mut self,
        response_id: String,
        sequence: u64,
        audio: Option<Vec<u8>>,
        text: Option<String>,
        is_final: bool,
    ) {
        let generation = self
            .tracker
            .generation_of(&response_id)
            .unwrap_or_else(|| self.tracker.generation());

        if let Some(audio) = audio {
            if let Some(speech) = self.speech_for(&response_id) {
                if !speech.has_server_audio() {
                    speech.mark_server_audio();
                }
            }
            let mut chunk = AudioChunk::new(response_id.clone(), sequence, audio);
            chunk.is_final = is_final;
            match self.arbiter.accept(chunk, generation) {
                AcceptOutcome::DroppedStale => {
                    trace!(%response_id, sequence, "Stale audio chunk dropped");
                }
                AcceptOutcome::DroppedDuplicate => {
                    debug!(%response_id, sequence, "Duplicate audio chunk dropped");
                }
                AcceptOutcome::Played(_) | AcceptOutcome::Buffered => {}
            }
        }

        if let Some(text) = text {
            if self.tracker.is_stale(&response_id, generation) {
                trace!(%response_id, sequence, "Stale text chunk dropped");
                return;
            }
            let _ = self.events.send(SessionEvent::TextDelta {
                response_id: response_id.clone(),
                text: text.clone(),
            });
            if let Some(speech) = self.speech_for(&response_id) {
                speech.push_text(&text);
                if is_final {
                    speech.flush_text();
                }
            }
            self.pump_synthesis();
        }
    }

    fn on_message_done(&mut self, response_id: String, message: DoneMessage) {
        if self.tracker.active_id().as_deref() != Some(response_id.as_str()) {
            debug!(%response_id, "message.done for inactive response");
            return;
        }
        let _ = self.events.send(SessionEvent::MessageCompleted {
            response_id: response_id.clone(),
            content: message.content,
            citations: message.citations,
        });
        let tracked = self
            .speech
            .as_ref()
            .is_some_and(|speech| speech.response_id == response_id);
        if !tracked {
            self.speech = Some(ResponseSpeech::new(response_id, self.tracker.generation()));
        }
        if let Some(speech) = &mut self.speech {
            speech.mark_done();
        }
        self.pump_synthesis();
        self.maybe_finish_response();
    }

    fn on_response_cancelled(&mut self, response_id: &str) {
        if self.awaiting_ack.as_deref() == Some(response_id) {
            self.awaiting_ack = None;
            metrics::record_cancel_ack("acked");
            debug!(response_id, "Cancel acknowledged");
            return;
        }

        let is_active = self.tracker.active_id().as_deref() == Some(response_id);
        if is_active && self.state == SessionState::Speaking {
            info!(response_id, "Response cancelled by service");
            self.tracker.cancel_active();
            self.arbiter.stop();
            self.speech = None;
            metrics::record_cancellation("server");
            self.sync_session();
            self.transition(SessionState::Listening);
            return;
        }

        debug!(response_id, "Ignoring cancellation for inactive response");
    }

    fn on_server_error(&mut self, code: &str, message: &str, retry_after_ms: Option<u64>) {
        let error = server_error(code, message, retry_after_ms);
        match &error {
            VoiceError::CancellationRace(_) => {
                debug!(%error, "Benign cancellation race");
                if self.awaiting_ack.take().is_some() {
                    metrics::record_cancel_ack("race");
                }
            }
            e if e.is_fatal() => {
                error!(%error, "Fatal error from voice service");
                self.fail(&error);
            }
            _ => {
                warn!(code, message, "Voice service reported an error");
                metrics::record_error(error.kind());
            }
        }
    }

    // --- Barge-in and detection ---

    fn on_speech_started(&mut self, origin: &'static str) {
        if self.state == SessionState::Speaking {
            self.barge_in(origin);
        } else {
            trace!(origin, state = %self.state, "Speech started");
        }
    }

    /// Speaking -> Interrupted -> Listening. The local stop is authoritative;
    /// the upstream cancel is fire-and-forget.
    fn barge_in(&mut self, origin: &'static str) {
        if self.state != SessionState::Speaking {
            return;
        }
        self.transition(SessionState::Interrupted);

        let cancelled = self.tracker.cancel_active();
        self.arbiter.stop();
        self.speech = None;
        metrics::record_cancellation(origin);

        match cancelled {
            Some(stream) => {
                info!(
                    response_id = %stream.response_id,
                    generation = self.tracker.generation(),
                    origin,
                    "Barge-in"
                );
                self.send_frame(ClientFrame::ResponseCancel {
                    response_id: stream.response_id.clone(),
                });
                self.await_cancel_ack(stream.response_id);
            }
            None => debug!(origin, "Barge-in with no active response"),
        }

        self.sync_session();
        self.transition(SessionState::Listening);
    }

    fn await_cancel_ack(&mut self, response_id: String) {
        self.awaiting_ack = Some(response_id.clone());
        let wait = self.session_cfg.cancel_ack_timeout();
        let inputs = self.inputs.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let _ = inputs.send(Input::CancelAckTimeout { response_id });
                }
            }
        });
    }

    fn on_cancel_ack_timeout(&mut self, response_id: &str) {
        if self.awaiting_ack.as_deref() == Some(response_id) {
            self.awaiting_ack = None;
            metrics::record_cancel_ack("timeout");
            debug!(response_id, "No cancel acknowledgment; local stop already applied");
        }
    }

    /// Local detection runs while speaking (barge-in) and, in local mode,
    /// while listening (end of utterance).
    fn detect_local(&mut self, frame: &[u8]) -> Vec<VadEvent> {
        let listening_locally = self.detection == DetectionMode::Local;
        if self.state == SessionState::Speaking || listening_locally {
            self.vad.process_bytes(frame)
        } else {
            Vec::new()
        }
    }

    fn apply_vad_events(&mut self, events: Vec<VadEvent>) {
        for event in events {
            match event {
                VadEvent::SpeechStarted => self.on_speech_started("local"),
                VadEvent::SpeechEnded => {
                    if self.state == SessionState::Listening
                        && self.detection == DetectionMode::Local
                    {
                        self.transition(SessionState::Thinking);
                    }
                }
            }
        }
    }

    fn on_tier(&mut self, change: TierChange) {
        self.tier = Some(change.current);
        if !change.confirmed {
            debug!(tier = %change.current, "Provisional tier, no action");
            return;
        }
        if let Some(tts) = &self.tts {
            tts.set_network_tier(change.current);
        }

        if change.current.is_degraded() {
            self.remote_switch_pending = false;
            if self.detection == DetectionMode::Remote {
                info!(tier = %change.current, "Switching to local speech detection");
                self.set_detection(DetectionMode::Local);
            }
        } else if self.detection == DetectionMode::Local {
            info!(tier = %change.current, "Connectivity recovered, remote detection available");
            let _ = self.events.send(SessionEvent::RemoteDetectionAvailable {
                tier: change.current,
            });
        }
    }

    fn set_detection(&mut self, mode: DetectionMode) {
        if self.detection == mode {
            return;
        }
        self.detection = mode;
        self.vad.reset();
        let _ = self.events.send(SessionEvent::DetectionModeChanged {
            mode,
            tier: self.tier,
        });
    }

    fn on_preferences(&mut self, snapshot: VoicePreferenceSnapshot) {
        debug!(
            voice_id = %snapshot.voice_id,
            language = %snapshot.language,
            vad_sensitivity = snapshot.vad_sensitivity,
            "Voice preferences updated"
        );
        self.apply_preferences(snapshot);
    }

    fn apply_preferences(&mut self, snapshot: VoicePreferenceSnapshot) {
        self.vad.set_sensitivity(&self.vad_cfg, snapshot.vad_sensitivity);
        if let Some(session) = &mut self.session {
            session.apply_preferences(snapshot.clone());
        }
        self.prefs = snapshot;
    }

    // --- Local synthesis ---

    fn speech_for(&mut self, response_id: &str) -> Option<&mut ResponseSpeech> {
        self.speech
            .as_mut()
            .filter(|speech| speech.response_id == response_id)
    }

    /// Start the next synthesis request for the active response, if any.
    fn pump_synthesis(&mut self) {
        let Some(speech) = self.speech.as_mut() else {
            return;
        };
        let Some(tts) = self.tts.clone() else {
            // Text-only: nothing to voice
            while speech.next_request().is_some() {
                speech.finish_request(false);
            }
            return;
        };
        let Some(sentence) = speech.next_request() else {
            return;
        };

        let response_id = speech.response_id.clone();
        let generation = speech.generation;
        let prefs = self.prefs.clone();
        let inputs = self.inputs.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = tts.synthesize(&sentence, &prefs) => {
                    let _ = inputs.send(Input::Synthesized { response_id, generation, result });
                }
            }
        });
    }

    fn on_synthesized(
        &mut self,
        response_id: String,
        generation: u64,
        result: std::result::Result<AudioResult, TtsError>,
    ) {
        if self.tracker.is_stale(&response_id, generation) {
            debug!(%response_id, generation, "Discarding synthesis for stale response");
            return;
        }
        let Some(speech) = self
            .speech
            .as_mut()
            .filter(|speech| speech.response_id == response_id)
        else {
            return;
        };

        match result {
            Ok(audio) => {
                if audio.used_fallback {
                    info!(provider = %audio.provider, %response_id, "Synthesized with fallback provider");
                }
                if let Some(sequence) = speech.finish_request(!audio.audio.is_empty()) {
                    let chunk = AudioChunk::new(response_id.clone(), sequence, audio.audio);
                    self.arbiter.accept(chunk, generation);
                }
            }
            Err(e) => {
                speech.finish_request(false);
                warn!(%response_id, %e, "Voice unavailable, continuing with text");
                metrics::record_error("voice_unavailable");
                let _ = self.events.send(SessionEvent::VoiceUnavailable {
                    response_id: response_id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        self.pump_synthesis();
        self.maybe_finish_response();
    }

    /// Complete the active response once `message.done` arrived and all of
    /// its audio has been handed to the arbiter.
    fn maybe_finish_response(&mut self) {
        if !self.speech.as_ref().is_some_and(ResponseSpeech::is_complete) {
            return;
        }
        let Some(speech) = self.speech.take() else {
            return;
        };
        self.tracker.complete(&speech.response_id);
        self.arbiter.complete(&speech.response_id);
        self.sync_session();
        debug!(response_id = %speech.response_id, "Response complete");
        if self.state == SessionState::Speaking {
            self.transition(SessionState::Listening);
        }
    }

    // --- Plumbing ---

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, "Unexpected state transition");
        }
        self.state = to;
        if let Some(session) = &mut self.session {
            session.state = to;
        }
        metrics::record_state_transition(to.as_str());
        debug!(%from, %to, "Session state changed");
        let _ = self.events.send(SessionEvent::StateChanged { from, to });

        if to == SessionState::Listening && self.remote_switch_pending {
            self.remote_switch_pending = false;
            self.set_detection(DetectionMode::Remote);
        }
    }

    fn sync_session(&mut self) {
        let active = self.tracker.active_id();
        let generation = self.tracker.generation();
        if let Some(session) = &mut self.session {
            session.active_response_id = active;
            session.generation = generation;
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if let Some(session) = &mut self.session {
            session.touch();
        }
    }

    fn invalid(&self, operation: &str) -> VoiceError {
        VoiceError::InvalidState {
            operation: operation.into(),
            state: self.state.to_string(),
        }
    }

    fn send_frame(&mut self, frame: ClientFrame) {
        let Some(outbound) = &self.outbound else {
            self.buffer_frame(frame);
            return;
        };
        if let Err(mpsc::error::SendError(frame)) = outbound.send(frame) {
            debug!("Link writer gone, buffering frame");
            self.outbound = None;
            self.buffer_frame(frame);
        }
    }

    fn buffer_frame(&mut self, frame: ClientFrame) {
        let limit = self.session_cfg.send_buffer_limit;
        if limit == 0 {
            return;
        }
        if self.send_buffer.len() >= limit {
            self.send_buffer.pop_front();
            warn!(limit, "Send buffer full, dropping oldest frame");
        }
        self.send_buffer.push_back(frame);
    }

    fn flush_buffer(&mut self) {
        if self.send_buffer.is_empty() {
            return;
        }
        let frames: Vec<ClientFrame> = self.send_buffer.drain(..).collect();
        let sent_text = frames.iter().any(|f| matches!(f, ClientFrame::Text { .. }));
        debug!(frames = frames.len(), "Flushing buffered frames");
        for frame in frames {
            self.send_frame(frame);
        }
        if sent_text && self.state == SessionState::Listening {
            self.transition(SessionState::Thinking);
        }
    }

    fn subscribe_monitor(&mut self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        if self.monitor_sub.is_some() {
            return;
        }
        let inputs = self.inputs.clone();
        let token = monitor.subscribe(Arc::new(move |change: &TierChange| {
            let _ = inputs.send(Input::Tier(*change));
        }));
        monitor.start(self.probe_interval, self.health_endpoint.clone());
        self.monitor_sub = Some(token);
    }

    fn spawn_preference_listener(&mut self) {
        let mut changes = self.store.subscribe();
        let inputs = self.inputs.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = changes.recv() => received,
                };
                match snapshot {
                    Ok(snapshot) => {
                        if inputs.send(Input::Preferences(snapshot)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Preference listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
