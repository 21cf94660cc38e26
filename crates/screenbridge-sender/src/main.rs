//! ScreenBridge sender.
//!
//! Captures a display (or a synthetic test pattern) and relays every frame
//! to a consumer that stands in for the real-time transport.
//!
//! ```text
//! CaptureSession (synthetic | GStreamer)
//!   │ session thread
//!   ▼
//! FrameRelay ──► LoggingConsumer (FPS report)
//!   ▲
//! CaptureController ◄── Ctrl-C / --duration
//! ```
//!
//! # Usage
//!
//! ```text
//! screenbridge-sender --duration 10 --width 1280 --height 720 --fps 30
//! screenbridge-sender --config capture.json --format BGRA
//! screenbridge-sender --backend gstreamer --source "pipewiresrc fd=12 path=42"
//! ```

mod consumer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use screenbridge_capture::backends::SyntheticSession;
use screenbridge_capture::{CaptureController, CaptureSession, ChangeNotifier, LifecycleState};
use screenbridge_core::{CaptureConfiguration, PixelFormat, Resolution};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::consumer::LoggingConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Generated test pattern, no display required.
    Synthetic,
    /// GStreamer pipeline (build with `--features gstreamer`).
    Gstreamer,
}

#[derive(Debug, Parser)]
#[command(name = "screenbridge-sender")]
#[command(about = "Capture the screen and relay frames to a real-time consumer")]
#[command(version)]
struct Args {
    /// JSON capture configuration; flags below override its fields.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Backend::Synthetic)]
    backend: Backend,

    /// gst-launch source fragment for the GStreamer backend.
    #[arg(long)]
    source: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(short, long)]
    duration: Option<u64>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    /// Preferred pixel format: fourcc (420f, 420v, y420, BGRA) or name.
    #[arg(long)]
    format: Option<PixelFormat>,
}

impl Args {
    fn configuration(&self) -> Result<CaptureConfiguration> {
        let mut config = match &self.config {
            Some(path) => CaptureConfiguration::from_json_file(path)
                .with_context(|| format!("Loading capture configuration from {}", path.display()))?,
            None => CaptureConfiguration::default(),
        };
        if self.width.is_some() || self.height.is_some() {
            config.resolution = Resolution::new(
                self.width.unwrap_or(config.resolution.width),
                self.height.unwrap_or(config.resolution.height),
            );
        }
        if let Some(fps) = self.fps {
            config.frame_rate = fps;
        }
        if let Some(format) = self.format {
            config.preferred_format = Some(format);
        }
        config.validate().context("Invalid capture configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("ScreenBridge Sender v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    if args.backend == Backend::Synthetic && args.source.is_some() {
        warn!("--source only applies to the GStreamer backend; ignoring");
    }
    let config = args.configuration()?;
    let duration = args.duration.map(Duration::from_secs);
    let notifier = ChangeNotifier::new();
    let consumer = Arc::new(LoggingConsumer::new());

    match args.backend {
        Backend::Synthetic => {
            let controller = CaptureController::with_change_notifier(
                SyntheticSession::new(),
                consumer.clone(),
                config.clone(),
                &notifier,
            )
            .context("Creating capture controller")?;
            run(&controller, config, duration).await?;
        }
        Backend::Gstreamer => {
            #[cfg(feature = "gstreamer")]
            {
                use screenbridge_capture::backends::GstSession;

                let session = match &args.source {
                    Some(source) => GstSession::new(source.as_str()),
                    None => GstSession::default(),
                }
                .with_notifier(notifier.clone());
                let controller =
                    CaptureController::with_change_notifier(session, consumer.clone(), config.clone(), &notifier)
                        .context("Creating capture controller")?;
                run(&controller, config, duration).await?;
            }
            #[cfg(not(feature = "gstreamer"))]
            bail!("GStreamer backend not compiled in; rebuild with --features gstreamer");
        }
    }

    info!("Consumer received {} frames", consumer.frames());
    Ok(())
}

async fn run<S: CaptureSession>(
    controller: &CaptureController<S>,
    config: CaptureConfiguration,
    duration: Option<Duration>,
) -> Result<()> {
    info!(
        "Starting capture: display={} {} @{}fps preferred={}",
        config.display_index,
        config.resolution,
        config.frame_rate,
        config
            .preferred_format
            .map_or_else(|| "none".to_owned(), |f| f.to_string())
    );

    let state = controller.start(config).await;
    if state != LifecycleState::Running {
        bail!("Capture failed to start (state={state})");
    }
    info!(
        "Capture running: output={} (consumer prefers {})",
        controller
            .active_format()
            .map_or_else(|| "none".to_owned(), |f| f.to_string()),
        controller.preferred_output_pixel_format()
    );

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Listening for Ctrl-C")?;
            info!("Ctrl-C received, stopping capture");
        }
        _ = deadline => {
            info!("Capture duration elapsed, stopping capture");
        }
    }

    let state = controller.stop().await;
    if state != LifecycleState::Idle {
        warn!("Capture did not settle to idle (state={state})");
    }

    let stats = controller.stats().snapshot();
    info!(
        "Capture finished: forwarded={} dropped={}",
        stats.forwarded, stats.dropped
    );
    Ok(())
}
