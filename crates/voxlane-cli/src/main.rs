use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::Instrument;

use voxlane_core::config::{Config, ServerConfig};
use voxlane_core::preferences::{InMemoryPreferenceStore, PreferenceStore};
use voxlane_media::{AudioSink, ChannelSink, NullSink, SinkEvent};
use voxlane_network::{HttpProbe, NetworkMonitor, TierChange};
use voxlane_session::{SessionBuilder, SessionEvent};
use voxlane_tts::TtsRouter;

mod logging;

#[derive(Parser)]
#[command(
    name = "voxlane",
    about = "Real-time voice sessions with barge-in, offline fallback and multi-provider TTS",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9464)
    #[arg(long, global = true)]
    metrics_addr: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a voice session; stdin lines are sent as text
    Connect {
        /// Voice service URL (overrides config)
        #[arg(long)]
        url: Option<String>,

        /// Append received audio to this file
        #[arg(long)]
        audio_out: Option<String>,
    },

    /// Probe the health endpoint and print network tier changes
    Probe {
        /// Endpoint to probe (default: derived from the server URL)
        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        interval_ms: Option<u64>,

        /// Number of probe intervals to run
        #[arg(long, default_value_t = 10)]
        count: u32,
    },

    /// Synthesize text through the TTS providers
    Speak {
        text: String,

        /// Output audio file
        #[arg(long)]
        out: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Voice preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// Check the configuration for problems
    Validate,
}

#[derive(Subcommand)]
enum PrefsAction {
    /// Show the effective preferences
    Show,
    /// Restore configured defaults
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .as_deref()
        .map(voxlane_core::config::expand_path)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose);

    let metrics_addr = cli
        .metrics_addr
        .or_else(|| config.metrics.as_ref().and_then(|m| m.prometheus_addr.clone()));
    if let Some(addr) = metrics_addr {
        install_metrics(&addr)?;
    }

    match cli.command {
        Commands::Connect { url, audio_out } => {
            let run_id = uuid::Uuid::new_v4();
            connect(config, url, audio_out.map(|p| voxlane_core::config::expand_path(&p)))
                .instrument(tracing::info_span!("connect", %run_id))
                .await?;
        }
        Commands::Probe {
            endpoint,
            interval_ms,
            count,
        } => probe(&config, endpoint, interval_ms, count).await,
        Commands::Speak { text, out } => {
            speak(&config, &text, voxlane_core::config::expand_path(&out)).await?;
        }
        Commands::Config { action } => config_command(config, &config_path, action)?,
        Commands::Prefs { action } => {
            let store = InMemoryPreferenceStore::new(config.preferences());
            let prefs = match action {
                PrefsAction::Show => store.get().await?,
                PrefsAction::Reset => store.reset().await?,
            };
            println!("{}", serde_json::to_string_pretty(&prefs)?);
        }
    }

    Ok(())
}

fn install_metrics(addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics address {addr}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing Prometheus exporter")?;
    tracing::info!(%addr, "Prometheus metrics enabled");
    Ok(())
}

async fn connect(mut config: Config, url: Option<String>, audio_out: Option<PathBuf>) -> anyhow::Result<()> {
    if let Some(url) = url {
        config.server = Some(ServerConfig {
            url,
            ..config.server()
        });
    }

    let sink: Arc<dyn AudioSink> = match audio_out {
        Some(path) => {
            let (sink, rx) = ChannelSink::new();
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            tokio::spawn(write_audio(file, rx));
            Arc::new(sink)
        }
        None => Arc::new(NullSink),
    };

    let tts = config.tts();
    let mut builder = SessionBuilder::new(config.clone()).sink(sink).probe_network();
    if !tts.providers.is_empty() {
        builder = builder.tts(Arc::new(TtsRouter::from_config(&tts)));
    }
    let session = builder.spawn();
    let mut events = session.subscribe();

    tracing::info!(url = %config.server().url, "Connecting");
    session.open().await?;

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = session.send_text(line).await {
                    eprintln!("error: {e}");
                    if matches!(e, voxlane_core::error::VoiceError::Closed) {
                        break;
                    }
                }
            }
        }
    }

    session.close().await?;
    printer.abort();
    Ok(())
}

async fn write_audio(mut file: tokio::fs::File, mut rx: tokio::sync::mpsc::UnboundedReceiver<SinkEvent>) {
    while let Some(event) = rx.recv().await {
        if let SinkEvent::Audio { payload, .. } = event {
            if let Err(e) = file.write_all(&payload).await {
                tracing::warn!(%e, "Failed to write audio");
                return;
            }
        }
    }
    let _ = file.flush().await;
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::TextDelta { text, .. } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::MessageCompleted { citations, .. } => {
            println!();
            for c in citations {
                let title = c.title.as_deref().unwrap_or("source");
                match &c.url {
                    Some(url) => println!("  [{title}] {url}"),
                    None => println!("  [{title}]"),
                }
            }
        }
        SessionEvent::StateChanged { from, to } => {
            tracing::info!(%from, %to, "State");
        }
        SessionEvent::VoiceUnavailable { reason, .. } => {
            eprintln!("(voice unavailable: {reason})");
        }
        SessionEvent::DetectionModeChanged { mode, tier } => {
            let tier = tier.map(|t| t.as_str()).unwrap_or("unknown");
            eprintln!("(speech detection: {}, network {tier})", mode.as_str());
        }
        SessionEvent::RemoteDetectionAvailable { tier } => {
            eprintln!("(network recovered: {tier}; server speech detection available)");
        }
        SessionEvent::Error {
            message,
            retry_after,
            fatal,
            ..
        } => {
            let prefix = if *fatal { "fatal" } else { "error" };
            match retry_after {
                Some(wait) => eprintln!("{prefix}: {message} (retry in {}s)", wait.as_secs()),
                None => eprintln!("{prefix}: {message}"),
            }
        }
    }
}

async fn probe(config: &Config, endpoint: Option<String>, interval_ms: Option<u64>, count: u32) {
    let network = config.network();
    let interval = interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| network.probe_interval());
    let endpoint = endpoint.unwrap_or_else(|| config.health_endpoint());

    let monitor = NetworkMonitor::new(&network, Arc::new(HttpProbe::new(network.probe_timeout())));
    let token = monitor.subscribe(Arc::new(|change: &TierChange| {
        let previous = change.previous.map(|t| t.as_str()).unwrap_or("unknown");
        let marker = if change.confirmed { "" } else { " (provisional)" };
        println!(
            "{} {previous} -> {}{marker}",
            change.at.format("%H:%M:%S%.3f"),
            change.current
        );
    }));

    println!("Probing {endpoint} every {}ms", interval.as_millis());
    monitor.start(interval, endpoint);
    tokio::select! {
        _ = tokio::time::sleep(interval * count) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    monitor.unsubscribe(token);
    monitor.stop();

    let tier = monitor
        .confirmed_tier()
        .map(|t| t.as_str())
        .unwrap_or("unknown");
    match monitor.average_latency_ms() {
        Some(avg) => println!("Tier: {tier}, average latency {avg:.0}ms over {} samples", monitor.recent_samples().len()),
        None => println!("Tier: {tier}, no successful probes"),
    }
}

async fn speak(config: &Config, text: &str, out: PathBuf) -> anyhow::Result<()> {
    let router = TtsRouter::from_config(&config.tts());
    let prefs = config.preferences();
    let result = router.synthesize(text, &prefs).await?;

    tokio::fs::write(&out, &result.audio)
        .await
        .with_context(|| format!("writing {}", out.display()))?;

    println!("Provider: {}", result.provider);
    println!("Fallback: {}", result.used_fallback);
    println!(
        "Style: {}",
        result.style.map(|s| s.as_str()).unwrap_or("none")
    );
    println!("Wrote {} bytes to {}", result.audio.len(), out.display());
    Ok(())
}

fn config_command(mut config: Config, path: &std::path::Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{json}");
        }
        ConfigAction::Get { key } => match config.get_path(&key) {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => anyhow::bail!("No config value at '{key}'"),
        },
        ConfigAction::Set { key, value } => {
            // Accept JSON literals, fall back to a plain string
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            config.set_path(&key, value)?;
            config.save(path)?;
            println!("Set {key} in {}", path.display());
        }
        ConfigAction::Validate => {
            let (warnings, errors) = config.validate();
            for w in &warnings {
                println!("warning: {w}");
            }
            for e in &errors {
                println!("error: {e}");
            }
            if !errors.is_empty() {
                anyhow::bail!("{} config error(s)", errors.len());
            }
            println!("Config OK ({} warning(s))", warnings.len());
        }
    }
    Ok(())
}
