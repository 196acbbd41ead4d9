//! Vigil Agent - standalone headless capture agent.
//!
//! This binary runs one capture pipeline supervisor per requested channel
//! and publishes lifecycle events through the logging bus. It is designed
//! for field deployments where the Vigil capture service runs as a
//! background daemon; event storage, detectors and the control surface live
//! in separate processes.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use vigil_core::{
    ChannelConfig, LoggingEventBus, MetricsRegistry, PipelineSupervisor, SupervisorDeps,
};

/// Vigil Agent - headless multi-channel capture supervisor.
#[derive(Parser, Debug)]
#[command(name = "vigil-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Audio channel as `id=input` (input: `mic`, `pipe:0`, or a URI).
    /// Repeatable.
    #[arg(long = "audio", value_name = "ID=INPUT")]
    audio: Vec<String>,

    /// Video channel as `id=input` (input: an RTSP/HTTP URI).
    /// Repeatable.
    #[arg(long = "video", value_name = "ID=INPUT")]
    video: Vec<String>,

    /// Audio capture device, applied to every audio channel.
    #[arg(long, env = "VIGIL_AUDIO_DEVICE")]
    device: Option<String>,

    /// Audio input format (e.g. alsa, avfoundation, dshow).
    #[arg(long, env = "VIGIL_AUDIO_FORMAT")]
    input_format: Option<String>,

    /// Transport hint for RTSP video channels (e.g. tcp).
    #[arg(long, env = "VIGIL_VIDEO_TRANSPORT")]
    transport: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "VIGIL_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

/// Splits an `id=input` channel argument.
fn parse_channel(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((id, input)) if !id.is_empty() && !input.is_empty() => {
            Ok((id.to_string(), input.to_string()))
        }
        _ => bail!("channel argument must be id=input, got {raw:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Vigil Agent v{}", env!("CARGO_PKG_VERSION"));

    if args.audio.is_empty() && args.video.is_empty() {
        bail!("no channels requested; pass at least one --audio or --video");
    }

    let bus = Arc::new(LoggingEventBus);
    let metrics = Arc::new(MetricsRegistry::new());
    let deps = SupervisorDeps::system(bus, metrics.clone());

    let mut supervisors = Vec::new();
    for raw in &args.audio {
        let (id, input) = parse_channel(raw).context("invalid --audio argument")?;
        let mut config = ChannelConfig::audio(id, input);
        config.device = args.device.clone();
        config.input_format = args.input_format.clone();
        supervisors.push(build_supervisor(config, deps.clone())?);
    }
    for raw in &args.video {
        let (id, input) = parse_channel(raw).context("invalid --video argument")?;
        let mut config = ChannelConfig::video(id, input);
        config.transport = args.transport.clone();
        supervisors.push(build_supervisor(config, deps.clone())?);
    }

    for supervisor in &supervisors {
        log::info!(
            "Starting {} channel {}",
            supervisor.kind(),
            supervisor.channel_id()
        );
        supervisor.start();
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    for supervisor in &supervisors {
        supervisor.stop();
    }

    let snapshot = metrics.snapshot();
    log::info!(
        "Restart totals at shutdown: audio={}, video={}",
        snapshot.audio.total,
        snapshot.video.total
    );

    log::info!("Shutdown complete");
    Ok(())
}

fn build_supervisor(config: ChannelConfig, deps: SupervisorDeps) -> Result<PipelineSupervisor> {
    let id = config.id.clone();
    PipelineSupervisor::new(config, deps)
        .map_err(|message| anyhow::anyhow!("channel {id}: {message}"))
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
