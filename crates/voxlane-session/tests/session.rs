//! End-to-end session behavior against an in-process fake voice service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, timeout};

use voxlane_core::config::{Config, NetworkConfig, OverlapPolicy, ReconnectConfig, SessionConfig};
use voxlane_core::error::{Result, VoiceError};
use voxlane_core::protocol::{ClientFrame, DoneMessage, PROTOCOL_VERSION, ServerFrame};
use voxlane_core::types::VoicePreferenceSnapshot;
use voxlane_media::{ChannelSink, SinkEvent};
use voxlane_network::{HealthProbe, NetworkMonitor, NetworkQualitySample, ProbeError};
use voxlane_session::{
    Backoff, Connector, DetectionMode, Link, LinkEvent, ServerHello, SessionBuilder, SessionEvent,
    SessionHandle, SessionState,
};
use voxlane_tts::{ProviderError, ProviderRegistry, SynthesisRequest, TtsProvider, TtsRouter};

const WAIT: Duration = Duration::from_secs(5);

// --- Fake service ---

/// The service's end of one connection.
struct ServerSide {
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
}

impl ServerSide {
    fn send(&self, frame: ServerFrame) {
        self.to_client.send(LinkEvent::Frame(frame)).unwrap();
    }

    fn drop_connection(&self) {
        self.to_client
            .send(LinkEvent::Closed {
                reason: "reset by peer".into(),
            })
            .unwrap();
    }

    /// Next client frame, skipping keepalives.
    async fn next_frame(&mut self) -> ClientFrame {
        loop {
            let frame = timeout(WAIT, self.from_client.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("client link closed");
            if frame != ClientFrame::Ping {
                return frame;
            }
        }
    }
}

struct MockConnector {
    scripted_failures: Mutex<VecDeque<VoiceError>>,
    always_fail: AtomicBool,
    attempts: AtomicUsize,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl MockConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            scripted_failures: Mutex::new(VecDeque::new()),
            always_fail: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            servers,
        });
        (connector, rx)
    }

    fn fail_next(&self, error: VoiceError) {
        self.scripted_failures.lock().unwrap().push_back(error);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Link> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.scripted_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(VoiceError::Connection("service unreachable".into()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerSide {
            to_client,
            from_client,
        });
        Ok(Link {
            hello: ServerHello {
                client_id: format!("client-{attempt}"),
                protocol_version: PROTOCOL_VERSION,
                capabilities: vec!["audio".into()],
            },
            outbound,
            inbound,
        })
    }
}

/// Returns the sentence text as "audio", or fails every call.
struct EchoProvider {
    fail: bool,
}

#[async_trait]
impl TtsProvider for EchoProvider {
    fn id(&self) -> &str {
        "echo"
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> std::result::Result<Vec<u8>, ProviderError> {
        if self.fail {
            return Err(ProviderError::Unavailable("echo is down".into()));
        }
        Ok(request.text.clone().into_bytes())
    }
}

/// Never answers; tier changes in these tests are fed by hand.
struct SilentProbe;

#[async_trait]
impl HealthProbe for SilentProbe {
    async fn probe(&self, _endpoint: &str) -> std::result::Result<Duration, ProbeError> {
        std::future::pending().await
    }
}

// --- Helpers ---

fn test_config() -> Config {
    Config {
        session: Some(SessionConfig {
            overlap_policy: Some(OverlapPolicy::SelfHeal),
            ..Default::default()
        }),
        reconnect: Some(ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 400,
            max_attempts: 3,
            attempt_timeout_ms: 1_000,
            jitter: 0.0,
            seed: Some(7),
        }),
        ..Default::default()
    }
}

struct Harness {
    session: SessionHandle,
    events: broadcast::Receiver<SessionEvent>,
    audio: mpsc::UnboundedReceiver<SinkEvent>,
    connector: Arc<MockConnector>,
    servers: mpsc::UnboundedReceiver<ServerSide>,
}

impl Harness {
    fn build(config: Config, customize: impl FnOnce(SessionBuilder) -> SessionBuilder) -> Self {
        let (connector, servers) = MockConnector::new();
        let (sink, audio) = ChannelSink::new();
        let builder = SessionBuilder::new(config)
            .connector(connector.clone())
            .sink(Arc::new(sink));
        let session = customize(builder).spawn();
        let events = session.subscribe();
        Self {
            session,
            events,
            audio,
            connector,
            servers,
        }
    }

    fn new() -> Self {
        Self::build(test_config(), |b| b)
    }

    async fn open(&mut self) -> ServerSide {
        self.session.open().await.unwrap();
        self.next_server().await
    }

    async fn next_server(&mut self) -> ServerSide {
        timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("connector dropped")
    }

    async fn next_event(&mut self) -> SessionEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for_state(&mut self, state: SessionState) {
        loop {
            if let SessionEvent::StateChanged { to, .. } = self.next_event().await {
                if to == state {
                    return;
                }
            }
        }
    }

    /// First event matching `pick`, skipping the rest.
    async fn wait_for<T>(&mut self, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> T {
        loop {
            if let Some(found) = pick(self.next_event().await) {
                return found;
            }
        }
    }

    /// Transitions observed until `last` is reached.
    async fn transitions_until(&mut self, last: SessionState) -> Vec<SessionState> {
        let mut seen = Vec::new();
        loop {
            if let SessionEvent::StateChanged { to, .. } = self.next_event().await {
                seen.push(to);
                if to == last {
                    return seen;
                }
            }
        }
    }

    async fn next_audio(&mut self) -> SinkEvent {
        timeout(WAIT, self.audio.recv())
            .await
            .expect("timed out waiting for sink")
            .expect("sink closed")
    }

    async fn wait_for_snapshot(&self, mut ready: impl FnMut(&voxlane_session::SessionSnapshot) -> bool) {
        let deadline = Instant::now() + WAIT;
        loop {
            let snapshot = self.session.snapshot().await.unwrap();
            if ready(&snapshot) {
                return;
            }
            assert!(Instant::now() < deadline, "condition not reached: {snapshot:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn created(id: &str) -> ServerFrame {
    ServerFrame::ResponseCreated {
        response_id: id.into(),
    }
}

fn audio_chunk(id: &str, sequence: u64, bytes: &[u8]) -> ServerFrame {
    ServerFrame::Chunk {
        response_id: id.into(),
        sequence,
        audio: Some(bytes.to_vec()),
        text: None,
        is_final: false,
    }
}

fn text_chunk(id: &str, sequence: u64, text: &str, is_final: bool) -> ServerFrame {
    ServerFrame::Chunk {
        response_id: id.into(),
        sequence,
        audio: None,
        text: Some(text.into()),
        is_final,
    }
}

fn done(id: &str, content: &str) -> ServerFrame {
    ServerFrame::MessageDone {
        response_id: id.into(),
        message: DoneMessage {
            content: content.into(),
            citations: vec![],
        },
    }
}

/// Bring the session to Speaking with chunk 0 of `id` played.
async fn start_speaking(h: &mut Harness, server: &ServerSide, id: &str) -> u64 {
    server.send(created(id));
    server.send(audio_chunk(id, 0, b"first"));
    h.wait_for_state(SessionState::Speaking).await;
    match h.next_audio().await {
        SinkEvent::Audio {
            token,
            response_id,
            sequence,
            ..
        } => {
            assert_eq!(response_id, id);
            assert_eq!(sequence, 0);
            token
        }
        other => panic!("expected audio, got {other:?}"),
    }
}

// --- Lifecycle ---

#[tokio::test]
async fn test_open_reaches_listening() {
    let mut h = Harness::new();
    let _server = h.open().await;

    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Listening);
    assert_eq!(snapshot.session_id.as_deref(), Some("client-1"));
    assert_eq!(snapshot.detection_mode, DetectionMode::Remote);
    assert_eq!(
        h.transitions_until(SessionState::Listening).await,
        vec![SessionState::Connecting, SessionState::Listening]
    );

    // Second open is a no-op
    h.session.open().await.unwrap();
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test]
async fn test_commands_before_open_are_rejected() {
    let h = Harness::new();
    let err = h.session.send_text("hello").await.unwrap_err();
    assert!(matches!(err, VoiceError::InvalidState { .. }), "{err:?}");
    let err = h.session.send_audio(vec![0; 640]).await.unwrap_err();
    assert!(matches!(err, VoiceError::InvalidState { .. }), "{err:?}");
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let mut h = Harness::new();
    let _server = h.open().await;

    h.session.close().await.unwrap();
    h.session.close().await.unwrap();

    assert!(matches!(h.session.open().await, Err(VoiceError::Closed)));
    assert!(matches!(h.session.send_text("hi").await, Err(VoiceError::Closed)));
}

#[tokio::test]
async fn test_transient_handshake_failure_returns_to_idle() {
    let mut h = Harness::new();
    h.connector
        .fail_next(VoiceError::Connection("connection refused".into()));

    let err = h.session.open().await.unwrap_err();
    assert!(matches!(err, VoiceError::Connection(_)), "{err:?}");
    assert_eq!(h.session.snapshot().await.unwrap().state, SessionState::Idle);

    // A later open may succeed
    let _server = h.open().await;
    assert_eq!(h.session.snapshot().await.unwrap().state, SessionState::Listening);
}

#[tokio::test]
async fn test_auth_rejection_at_open_closes_session() {
    let mut h = Harness::new();
    h.connector.fail_next(VoiceError::Auth("invalid_token".into()));

    let err = h.session.open().await.unwrap_err();
    assert!(matches!(err, VoiceError::Auth(_)), "{err:?}");

    let (kind, fatal) = h
        .wait_for(|e| match e {
            SessionEvent::Error { kind, fatal, .. } => Some((kind, fatal)),
            _ => None,
        })
        .await;
    assert_eq!(kind, "auth");
    assert!(fatal);
    h.wait_for_state(SessionState::Closed).await;
}

#[tokio::test]
async fn test_auth_error_frame_closes_session() {
    let mut h = Harness::new();
    let server = h.open().await;

    server.send(ServerFrame::Error {
        code: "auth_failed".into(),
        message: "token revoked".into(),
        retry_after_ms: None,
    });

    let fatal = h
        .wait_for(|e| match e {
            SessionEvent::Error { fatal, .. } => Some(fatal),
            _ => None,
        })
        .await;
    assert!(fatal);
    h.wait_for_state(SessionState::Closed).await;
    assert!(matches!(h.session.send_text("hi").await, Err(VoiceError::Closed)));
}

#[tokio::test]
async fn test_quota_error_carries_retry_hint() {
    let mut h = Harness::new();
    let server = h.open().await;

    server.send(ServerFrame::Error {
        code: "quota_exceeded".into(),
        message: "monthly limit".into(),
        retry_after_ms: Some(30_000),
    });

    let retry_after = h
        .wait_for(|e| match e {
            SessionEvent::Error { retry_after, .. } => Some(retry_after),
            _ => None,
        })
        .await;
    assert_eq!(retry_after, Some(Duration::from_secs(30)));
    h.wait_for_state(SessionState::Closed).await;
}

#[tokio::test]
async fn test_non_fatal_server_error_keeps_session() {
    let mut h = Harness::new();
    let mut server = h.open().await;

    server.send(ServerFrame::Error {
        code: "internal".into(),
        message: "model overloaded".into(),
        retry_after_ms: None,
    });
    h.session.send_text("still there?").await.unwrap();

    assert_eq!(
        server.next_frame().await,
        ClientFrame::Text {
            text: "still there?".into()
        }
    );
    assert_eq!(h.session.snapshot().await.unwrap().state, SessionState::Thinking);
}

// --- Turns and barge-in ---

#[tokio::test]
async fn test_text_turn_moves_to_thinking() {
    let mut h = Harness::new();
    let mut server = h.open().await;

    h.session.send_text("What's the weather?").await.unwrap();
    assert_eq!(
        server.next_frame().await,
        ClientFrame::Text {
            text: "What's the weather?".into()
        }
    );
    h.wait_for_state(SessionState::Thinking).await;
}

#[tokio::test]
async fn test_audio_is_forwarded_while_listening() {
    let mut h = Harness::new();
    let mut server = h.open().await;

    h.session.send_audio(vec![1, 0, 2, 0]).await.unwrap();
    assert_eq!(
        server.next_frame().await,
        ClientFrame::AudioChunk {
            audio: vec![1, 0, 2, 0]
        }
    );
}

#[tokio::test]
async fn test_barge_in_by_text_stops_playback_and_cancels_upstream() {
    let mut h = Harness::new();
    let mut server = h.open().await;
    let token = start_speaking(&mut h, &server, "r1").await;
    let before = h.session.snapshot().await.unwrap();
    assert_eq!(before.active_response_id.as_deref(), Some("r1"));

    h.session.send_text("Actually, stop").await.unwrap();

    // Playback halted before anything else reaches the sink
    assert_eq!(h.next_audio().await, SinkEvent::Halt { token });
    assert_eq!(
        server.next_frame().await,
        ClientFrame::ResponseCancel {
            response_id: "r1".into()
        }
    );
    assert_eq!(
        server.next_frame().await,
        ClientFrame::Text {
            text: "Actually, stop".into()
        }
    );
    assert_eq!(
        h.transitions_until(SessionState::Thinking).await,
        vec![
            SessionState::Interrupted,
            SessionState::Listening,
            SessionState::Thinking
        ]
    );

    let after = h.session.snapshot().await.unwrap();
    assert_eq!(after.generation, before.generation + 1);
    assert_eq!(after.active_response_id, None);

    // Late audio for the cancelled response is dropped, never played
    server.send(audio_chunk("r1", 1, b"late"));
    h.wait_for_snapshot(|s| s.dropped_chunks == 1).await;
    assert!(h.audio.try_recv().is_err());
}

#[tokio::test]
async fn test_remote_speech_start_barges_in() {
    let mut h = Harness::new();
    let mut server = h.open().await;
    let token = start_speaking(&mut h, &server, "r1").await;

    server.send(ServerFrame::SpeechStarted);

    assert_eq!(h.next_audio().await, SinkEvent::Halt { token });
    assert_eq!(
        server.next_frame().await,
        ClientFrame::ResponseCancel {
            response_id: "r1".into()
        }
    );
    h.wait_for_state(SessionState::Listening).await;

    // The acknowledgment is absorbed quietly
    server.send(ServerFrame::ResponseCancelled {
        response_id: "r1".into(),
    });
    server.send(ServerFrame::Error {
        code: "no_active_response".into(),
        message: "nothing to cancel".into(),
        retry_after_ms: None,
    });
    h.session.send_text("next").await.unwrap();
    assert_eq!(
        server.next_frame().await,
        ClientFrame::Text {
            text: "next".into()
        }
    );
    assert_eq!(h.session.snapshot().await.unwrap().state, SessionState::Thinking);
}

#[tokio::test]
async fn test_external_speech_start_barges_in() {
    let mut h = Harness::new();
    let mut server = h.open().await;
    let token = start_speaking(&mut h, &server, "r1").await;

    h.session.speech_started();

    assert_eq!(h.next_audio().await, SinkEvent::Halt { token });
    assert!(matches!(
        server.next_frame().await,
        ClientFrame::ResponseCancel { .. }
    ));
    h.wait_for_state(SessionState::Listening).await;
}

#[tokio::test]
async fn test_loud_microphone_audio_barges_in_while_speaking() {
    let mut h = Harness::new();
    let mut server = h.open().await;
    let token = start_speaking(&mut h, &server, "r1").await;

    // 20ms at 16kHz of loud PCM
    let loud: Vec<u8> = std::iter::repeat_n(8_000i16.to_le_bytes(), 320)
        .flatten()
        .collect();
    h.session.send_audio(loud).await.unwrap();

    assert_eq!(h.next_audio().await, SinkEvent::Halt { token });
    assert!(matches!(
        server.next_frame().await,
        ClientFrame::ResponseCancel { .. }
    ));
}

#[tokio::test]
async fn test_server_cancel_returns_to_listening() {
    let mut h = Harness::new();
    let server = h.open().await;
    let token = start_speaking(&mut h, &server, "r1").await;

    server.send(ServerFrame::ResponseCancelled {
        response_id: "r1".into(),
    });

    assert_eq!(h.next_audio().await, SinkEvent::Halt { token });
    h.wait_for_state(SessionState::Listening).await;
    assert_eq!(h.session.snapshot().await.unwrap().active_response_id, None);
}

#[tokio::test]
async fn test_superseded_response_replaces_playback() {
    let mut h = Harness::new();
    let server = h.open().await;
    let old_token = start_speaking(&mut h, &server, "r1").await;

    server.send(created("r2"));
    server.send(audio_chunk("r2", 0, b"new"));
    server.send(audio_chunk("r1", 1, b"old"));

    assert_eq!(h.next_audio().await, SinkEvent::Halt { token: old_token });
    match h.next_audio().await {
        SinkEvent::Audio {
            token,
            response_id,
            sequence,
            ..
        } => {
            assert_ne!(token, old_token);
            assert_eq!(response_id, "r2");
            assert_eq!(sequence, 0);
        }
        other => panic!("expected r2 audio, got {other:?}"),
    }
    h.wait_for_snapshot(|s| s.dropped_chunks == 1).await;
    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.active_response_id.as_deref(), Some("r2"));
    assert_eq!(snapshot.state, SessionState::Speaking);
}

#[tokio::test]
async fn test_server_audio_response_completes() {
    let mut h = Harness::new();
    let server = h.open().await;
    let token = start_speaking(&mut h, &server, "r1").await;

    server.send(ServerFrame::Chunk {
        response_id: "r1".into(),
        sequence: 1,
        audio: Some(b"last".to_vec()),
        text: Some("All done.".into()),
        is_final: true,
    });
    server.send(done("r1", "All done."));

    assert!(matches!(h.next_audio().await, SinkEvent::Audio { sequence: 1, .. }));
    assert_eq!(h.next_audio().await, SinkEvent::Finish { token });
    let content = h
        .wait_for(|e| match e {
            SessionEvent::MessageCompleted { content, .. } => Some(content),
            _ => None,
        })
        .await;
    assert_eq!(content, "All done.");
    h.wait_for_state(SessionState::Listening).await;
}

// --- Local synthesis ---

#[tokio::test]
async fn test_text_only_response_is_voiced_locally() {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(EchoProvider { fail: false }));
    let router = Arc::new(TtsRouter::new(registry, &Default::default()));
    let mut h = Harness::build(test_config(), |b| b.tts(router));
    let server = h.open().await;

    server.send(created("r1"));
    server.send(text_chunk("r1", 0, "Hello there. How", false));
    server.send(text_chunk("r1", 1, " are you?", true));
    server.send(done("r1", "Hello there. How are you?"));

    let mut spoken = Vec::new();
    let mut token = None;
    loop {
        match h.next_audio().await {
            SinkEvent::Audio {
                token: t,
                sequence,
                payload,
                ..
            } => {
                assert_eq!(sequence, spoken.len() as u64);
                token = Some(t);
                spoken.push(String::from_utf8(payload).unwrap());
            }
            SinkEvent::Finish { token: t } => {
                assert_eq!(Some(t), token);
                break;
            }
            other => panic!("unexpected sink event {other:?}"),
        }
    }
    assert_eq!(spoken, vec!["Hello there.", "How are you?"]);
    h.wait_for_state(SessionState::Listening).await;
}

#[tokio::test]
async fn test_voice_unavailable_keeps_text_flowing() {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(EchoProvider { fail: true }));
    let router = Arc::new(TtsRouter::new(registry, &Default::default()));
    let mut h = Harness::build(test_config(), |b| b.tts(router));
    let server = h.open().await;

    server.send(created("r1"));
    server.send(text_chunk("r1", 0, "Sorry, no voice today.", true));
    server.send(done("r1", "Sorry, no voice today."));

    let response_id = h
        .wait_for(|e| match e {
            SessionEvent::VoiceUnavailable { response_id, .. } => Some(response_id),
            _ => None,
        })
        .await;
    assert_eq!(response_id, "r1");
    h.wait_for_state(SessionState::Listening).await;
    assert!(h.audio.try_recv().is_err());
}

#[tokio::test]
async fn test_text_deltas_are_published() {
    let mut h = Harness::new();
    let server = h.open().await;

    server.send(created("r1"));
    server.send(text_chunk("r1", 0, "Hi", false));

    let text = h
        .wait_for(|e| match e {
            SessionEvent::TextDelta { text, .. } => Some(text),
            _ => None,
        })
        .await;
    assert_eq!(text, "Hi");
}

// --- Reconnection ---

#[tokio::test]
async fn test_reconnect_flushes_buffered_text() {
    let mut h = Harness::new();
    let server = h.open().await;

    server.drop_connection();
    h.wait_for_state(SessionState::Reconnecting).await;

    h.session.send_text("are you back?").await.unwrap();
    assert_eq!(h.session.snapshot().await.unwrap().buffered_frames, 1);

    let mut server = h.next_server().await;
    assert_eq!(
        server.next_frame().await,
        ClientFrame::Text {
            text: "are you back?".into()
        }
    );
    h.wait_for_state(SessionState::Listening).await;
    h.wait_for_state(SessionState::Thinking).await;
    assert_eq!(h.connector.attempts(), 2);
}

#[tokio::test]
async fn test_reconnect_drops_interrupted_response() {
    let mut h = Harness::new();
    let server = h.open().await;
    let token = start_speaking(&mut h, &server, "r1").await;

    server.drop_connection();
    let _server = h.next_server().await;

    assert_eq!(h.next_audio().await, SinkEvent::Halt { token });
    h.wait_for_state(SessionState::Listening).await;
    assert_eq!(h.session.snapshot().await.unwrap().active_response_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_within_budget() {
    let mut h = Harness::new();
    let server = h.open().await;
    h.connector.always_fail.store(true, Ordering::SeqCst);

    let reconnect = test_config().reconnect();
    let bound = Backoff::from_config(&reconnect).upper_bound();

    let started = Instant::now();
    server.drop_connection();

    let (kind, fatal) = h
        .wait_for(|e| match e {
            SessionEvent::Error { kind, fatal, .. } => Some((kind, fatal)),
            _ => None,
        })
        .await;
    let elapsed = started.elapsed();

    assert_eq!(kind, "connection");
    assert!(fatal);
    // 100 + 200 + 400 ms with no jitter
    assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
    assert!(elapsed <= bound + Duration::from_millis(50), "elapsed {elapsed:?}");
    assert_eq!(h.connector.attempts(), 1 + 3);
    h.wait_for_state(SessionState::Closed).await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_closes() {
    let mut config = test_config();
    config.session = Some(SessionConfig {
        idle_timeout_ms: 3_000,
        overlap_policy: Some(OverlapPolicy::SelfHeal),
        ..Default::default()
    });
    let mut h = Harness::build(config, |b| b);
    let _server = h.open().await;

    h.wait_for_state(SessionState::Closed).await;
}

// --- Network tiers ---

#[tokio::test]
async fn test_degraded_network_switches_detection_mode() {
    let network = NetworkConfig {
        probe_interval_ms: 3_600_000,
        probe_timeout_ms: 3_600_000,
        demote_after: 1,
        promote_after: 1,
        ..Default::default()
    };
    let monitor = NetworkMonitor::new(&network, Arc::new(SilentProbe));
    let config = Config {
        network: Some(network),
        ..test_config()
    };
    let mut h = Harness::build(config, {
        let monitor = monitor.clone();
        move |b: SessionBuilder| b.monitor(monitor)
    });
    let _server = h.open().await;
    assert_eq!(monitor.subscriber_count(), 1);

    monitor.record_sample(NetworkQualitySample::failed());
    let mode = h
        .wait_for(|e| match e {
            SessionEvent::DetectionModeChanged { mode, .. } => Some(mode),
            _ => None,
        })
        .await;
    assert_eq!(mode, DetectionMode::Local);

    let err = h.session.use_remote_detection().await.unwrap_err();
    assert!(matches!(err, VoiceError::InvalidState { .. }), "{err:?}");

    monitor.record_sample(NetworkQualitySample::latency(40));
    h.wait_for(|e| match e {
        SessionEvent::RemoteDetectionAvailable { .. } => Some(()),
        _ => None,
    })
    .await;
    // Still local until the caller opts back in
    assert_eq!(
        h.session.snapshot().await.unwrap().detection_mode,
        DetectionMode::Local
    );

    h.session.use_remote_detection().await.unwrap();
    assert_eq!(
        h.session.snapshot().await.unwrap().detection_mode,
        DetectionMode::Remote
    );

    h.session.close().await.unwrap();
    assert_eq!(monitor.subscriber_count(), 0);
}

#[tokio::test]
async fn test_close_leaves_shared_monitor_probing() {
    let network = NetworkConfig {
        probe_interval_ms: 3_600_000,
        probe_timeout_ms: 3_600_000,
        ..Default::default()
    };
    let monitor = NetworkMonitor::new(&network, Arc::new(SilentProbe));
    let other = monitor.subscribe(Arc::new(|_: &voxlane_network::TierChange| {}));
    let config = Config {
        network: Some(network),
        ..test_config()
    };
    let mut h = Harness::build(config, {
        let monitor = monitor.clone();
        move |b: SessionBuilder| b.monitor(monitor)
    });
    let _server = h.open().await;
    assert_eq!(monitor.subscriber_count(), 2);
    assert!(monitor.is_probing());

    h.session.close().await.unwrap();
    assert_eq!(monitor.subscriber_count(), 1);
    assert!(monitor.is_probing());

    monitor.unsubscribe(other);
    assert!(!monitor.is_probing());
}

// --- Preferences ---

#[tokio::test]
async fn test_preference_changes_reach_session() {
    use voxlane_core::preferences::{InMemoryPreferenceStore, PreferenceStore};

    let store = Arc::new(InMemoryPreferenceStore::default());
    let mut h = Harness::build(test_config(), {
        let store = store.clone();
        move |b: SessionBuilder| b.preferences(store)
    });
    let server = h.open().await;

    // Sensitivity 100 makes quiet speech count as barge-in
    store
        .update(VoicePreferenceSnapshot {
            vad_sensitivity: 100,
            ..Default::default()
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let token = start_speaking(&mut h, &server, "r1").await;
    let quiet: Vec<u8> = std::iter::repeat_n(300i16.to_le_bytes(), 320)
        .flatten()
        .collect();
    h.session.send_audio(quiet).await.unwrap();
    assert_eq!(h.next_audio().await, SinkEvent::Halt { token });
}
