use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use voice_capture::{
    AudioBackendFactory, AudioSource, BuiltinLoader, CaptureEvent, CaptureResult, CaptureSink,
    Config, DefaultPipelineFactory, DirectorySink, NatsSink, StrategyKind, VoiceSearch,
};

/// How long to wait for the final result after Ctrl-C
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "voice-capture", version, about = "Voice search audio capture")]
struct Cli {
    /// Config file (extension optional)
    #[arg(short, long, default_value = "config/voice-capture")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List audio input devices
    Devices,
    /// Report whether voice capture can run here
    Check,
    /// Record one voice query and hand it off
    Record {
        #[arg(long)]
        strategy: Option<StrategyKind>,
        /// Input device name
        #[arg(long)]
        device: Option<String>,
        /// Replay an audio file instead of using the microphone
        #[arg(long)]
        file: Option<PathBuf>,
        /// Directory for the finished capture
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also publish the capture to this NATS server
        #[arg(long)]
        nats: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::load(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.service.log_filter));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Devices => {
            let backend = AudioBackendFactory::create(AudioSource::Microphone);
            let devices = backend.input_devices().await?;
            if devices.is_empty() {
                println!("No input devices found");
            }
            for device in devices {
                let marker = if device.is_default { " (default)" } else { "" };
                println!("{}{}", device.label, marker);
            }
        }
        Command::Check => {
            let search = build_search(&cfg, AudioSource::Microphone);
            let microphone = search.check_microphone().await;
            let permission = search.request_permission().await;

            println!("supported:  {}", search.is_supported());
            println!(
                "microphone: {}{}",
                microphone.available,
                microphone.error.map(|e| format!(" ({e})")).unwrap_or_default()
            );
            println!(
                "permission: {}{}",
                permission.granted,
                permission.error.map(|e| format!(" ({e})")).unwrap_or_default()
            );
        }
        Command::Record {
            strategy,
            device,
            file,
            output,
            nats,
        } => {
            if let Some(strategy) = strategy {
                cfg.search.strategy = strategy;
            }
            if device.is_some() {
                cfg.capture.device.device_id = device;
            }
            if let Some(output) = output {
                cfg.handoff.output_dir = output.display().to_string();
            }
            if nats.is_some() {
                cfg.handoff.nats_url = nats;
            }

            let source = match file {
                Some(path) => AudioSource::File(path),
                None => AudioSource::Microphone,
            };
            record(&cfg, source).await?;
        }
    }

    Ok(())
}

fn build_search(cfg: &Config, source: AudioSource) -> VoiceSearch {
    VoiceSearch::new(
        cfg.search.clone(),
        cfg.capture.clone(),
        cfg.neural.clone(),
        AudioBackendFactory::create(source),
        Arc::new(DefaultPipelineFactory),
        Arc::new(BuiltinLoader::new(cfg.neural.model.clone())),
    )
}

enum Outcome {
    Complete(CaptureResult),
    Failed(String),
}

async fn record(cfg: &Config, source: AudioSource) -> Result<()> {
    let mut sinks: Vec<Box<dyn CaptureSink>> =
        vec![Box::new(DirectorySink::new(&cfg.handoff.output_dir))];
    if let Some(url) = &cfg.handoff.nats_url {
        sinks.push(Box::new(NatsSink::connect(url).await?));
    }

    let search = build_search(cfg, source);
    if !search.is_supported() {
        warn!("Voice capture may not be fully supported in this environment");
    }

    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let _events = search.events().subscribe(move |event| match event {
        CaptureEvent::RecordingStarted { session_id } => {
            info!("Listening (session {})... speak now, Ctrl-C to stop", session_id)
        }
        CaptureEvent::SpeechStarted { at_ms } => info!("Speech started at {}ms", at_ms),
        CaptureEvent::SpeechEnded { duration_ms } => info!("Speech ended ({}ms)", duration_ms),
        CaptureEvent::Misfire => info!("Too short, still listening"),
        CaptureEvent::AutoStopped { reason } => info!("Auto-stopped: {:?}", reason),
        CaptureEvent::RecordingComplete(result) => {
            let _ = tx.send(Outcome::Complete(result.clone()));
        }
        CaptureEvent::Error(e) => {
            let _ = tx.send(Outcome::Failed(e.to_string()));
        }
        CaptureEvent::LevelChanged { .. } | CaptureEvent::RecordingStopped => {}
    });

    if !search.start_recording().await {
        let reason = match outcomes.try_recv() {
            Ok(Outcome::Failed(reason)) => reason,
            _ => "unknown error".to_string(),
        };
        search.cleanup();
        bail!("Failed to start recording: {}", reason);
    }

    let outcome = tokio::select! {
        outcome = outcomes.recv() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping recording");
            search.stop_recording();
            tokio::time::timeout(STOP_GRACE, outcomes.recv()).await.ok().flatten()
        }
    };
    search.cleanup();

    match outcome {
        Some(Outcome::Complete(result)) => {
            info!(
                "Captured {} ({} bytes, {}ms, {})",
                result.file_name,
                result.size(),
                result.duration_ms,
                result.mime_type
            );
            for sink in &sinks {
                if let Err(e) = sink.deliver(&result).await {
                    error!("Failed to deliver capture via {}: {:#}", sink.name(), e);
                }
            }
            Ok(())
        }
        Some(Outcome::Failed(reason)) => bail!("Recording failed: {}", reason),
        None => bail!("Recording ended without a result"),
    }
}
