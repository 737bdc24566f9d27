//! Public entry point: build a session, then drive it through a handle.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use voxlane_core::config::Config;
use voxlane_core::error::{Result, VoiceError};
use voxlane_core::preferences::{InMemoryPreferenceStore, PreferenceStore};
use voxlane_media::{AudioSink, NullSink, PlaybackArbiter, ResponseTracker};
use voxlane_network::{HttpProbe, NetworkMonitor};
use voxlane_tts::TtsRouter;

use crate::connection::{Connector, WsConnector};
use crate::events::{SessionEvent, SessionSnapshot};
use crate::machine::{Input, Parts, Reactor};

const EVENT_CAPACITY: usize = 256;

/// Assembles a session from config plus optional overrides.
pub struct SessionBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    sink: Option<Arc<dyn AudioSink>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    tts: Option<Arc<TtsRouter>>,
    monitor: Option<NetworkMonitor>,
}

impl SessionBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connector: None,
            sink: None,
            preferences: None,
            tts: None,
            monitor: None,
        }
    }

    /// Defaults to a [`WsConnector`] for the configured server.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Defaults to discarding audio.
    pub fn sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Defaults to an in-memory store seeded from config.
    pub fn preferences(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(store);
        self
    }

    /// Local synthesis for text-only responses. Without a router, such
    /// responses are text only.
    pub fn tts(mut self, router: Arc<TtsRouter>) -> Self {
        self.tts = Some(router);
        self
    }

    pub fn monitor(mut self, monitor: NetworkMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Attach a monitor that probes the configured health endpoint over HTTP.
    pub fn probe_network(self) -> Self {
        let network = self.config.network();
        let probe = Arc::new(HttpProbe::new(network.probe_timeout()));
        let monitor = NetworkMonitor::new(&network, probe);
        self.monitor(monitor)
    }

    /// Start the session loop. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::from_config(&self.config.server())));
        let sink = self.sink.unwrap_or_else(|| Arc::new(NullSink));
        let preferences = self
            .preferences
            .unwrap_or_else(|| Arc::new(InMemoryPreferenceStore::new(self.config.preferences())));

        let tracker = ResponseTracker::new();
        let arbiter = Arc::new(PlaybackArbiter::new(
            tracker.clone(),
            sink,
            self.config.session().overlap_policy(),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let released = CancellationToken::new();

        let reactor = Reactor::new(
            Parts {
                config: self.config,
                connector,
                tracker: tracker.clone(),
                arbiter: arbiter.clone(),
                tts: self.tts,
                monitor: self.monitor,
                preferences,
                events: events.clone(),
                released: released.clone(),
            },
            inputs.clone(),
        );
        tokio::spawn(reactor.run(inputs_rx));
        debug!("Voice session spawned");

        SessionHandle {
            inputs,
            events,
            tracker,
            arbiter,
            _release: Arc::new(released.drop_guard()),
        }
    }
}

/// Cloneable control surface for one voice session. The session closes
/// when `close` is called or the last handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<SessionEvent>,
    tracker: ResponseTracker,
    arbiter: Arc<PlaybackArbiter>,
    _release: Arc<DropGuard>,
}

impl SessionHandle {
    /// Connect and wait for the handshake. A no-op once connected.
    pub async fn open(&self) -> Result<()> {
        self.request(Input::Open).await?
    }

    /// Forward one microphone frame (16-bit little-endian PCM).
    pub async fn send_audio(&self, frame: Vec<u8>) -> Result<()> {
        self.request(|reply| Input::SendAudio(frame, reply)).await?
    }

    /// Send a typed message. Interrupts the assistant if it is speaking.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Input::SendText(text, reply)).await?
    }

    /// Report speech from an external detector.
    pub fn speech_started(&self) {
        let _ = self.inputs.send(Input::SpeechStarted);
    }

    /// Return to server-side speech detection after a degraded period.
    pub async fn use_remote_detection(&self) -> Result<()> {
        self.request(Input::UseRemoteDetection).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(Input::Snapshot).await
    }

    /// Close the session. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let _ = self.request(Input::Close).await;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn arbiter(&self) -> &PlaybackArbiter {
        &self.arbiter
    }

    pub fn tracker(&self) -> &ResponseTracker {
        &self.tracker
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Input) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inputs.send(make(tx)).map_err(|_| VoiceError::Closed)?;
        rx.await.map_err(|_| VoiceError::Closed)
    }
}
