//! stream_client - stream a camera to the redaction service and show the result.
//!
//! This client:
//! 1. Opens the configured capture source (camera, MJPEG stream, or stub)
//! 2. Connects to the processing service over WebSocket
//! 3. Sends ~15 JPEG frames per second and renders each processed frame
//! 4. Reports faces / documents / fps until Ctrl-C or the session ends

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use scannon_stream::{
    build_source, run, ControlEvent, FileSurface, MemorySurface, SessionEnd, StreamConfig,
    StreamController, Surface, WsConnector,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream a camera to the privacy-redaction service"
)]
struct Args {
    /// WebSocket endpoint of the processing service.
    #[arg(long, env = "SCANNON_ENDPOINT")]
    endpoint: Option<String>,

    /// Capture source: stub://name, a device path, or an http(s) MJPEG URL.
    #[arg(long, env = "SCANNON_SOURCE")]
    source: Option<String>,

    /// Write each processed frame over this image file (.png/.jpg).
    #[arg(long, env = "SCANNON_OUTPUT")]
    output: Option<PathBuf>,

    /// JPEG quality for outbound frames (1-100).
    #[arg(long, env = "SCANNON_JPEG_QUALITY")]
    jpeg_quality: Option<u8>,

    /// Pacing interval between sends, in milliseconds.
    #[arg(long, env = "SCANNON_PACE_MS")]
    pace_ms: Option<u64>,

    /// UI mode for stderr status (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = {
        let _stage = ui.stage("Load configuration");
        StreamConfig::load()?
    };
    if let Some(endpoint) = args.endpoint {
        cfg.endpoint = endpoint;
    }
    if let Some(source) = args.source {
        cfg.capture.url = source;
    }
    if let Some(quality) = args.jpeg_quality {
        cfg.jpeg_quality = quality;
    }
    if let Some(pace_ms) = args.pace_ms {
        cfg.pace_interval = Duration::from_millis(pace_ms);
    }
    if args.output.is_some() {
        cfg.output = args.output;
    }
    cfg.validate()?;

    let surface: Box<dyn Surface> = match &cfg.output {
        Some(path) => {
            log::info!("writing processed frames to {}", path.display());
            Box::new(FileSurface::new(path)?)
        }
        None => Box::new(MemorySurface::new()),
    };

    let (tx, rx) = mpsc::channel::<ControlEvent>();
    let stop_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(ControlEvent::Stop);
    })
    .expect("error setting Ctrl-C handler");

    let capture = cfg.capture.clone();
    let mut controller = StreamController::new(
        cfg.pipeline_settings(),
        Box::new(move || build_source(&capture)),
        Box::new(WsConnector::new()),
        surface,
        tx,
    )?;

    {
        let _stage = ui.stage("Open camera");
        if let Err(err) = controller.start(Instant::now()) {
            eprintln!("{}", err.banner());
            return Err(anyhow!(err));
        }
    }

    let mut display = ui.live(&cfg.endpoint);
    let exit = run(&mut controller, &rx, |controller| {
        display.update(
            controller.stats(),
            controller.is_streaming(),
            controller.banner(),
        );
    });
    log::debug!("event loop exited: {:?}", exit);

    let stats = controller.stats();
    let summary = match controller.last_end() {
        Some(end) => format!(
            "session {} (faces {}, documents {}, total {})",
            end, stats.faces, stats.documents, stats.total
        ),
        None => "session ended".to_string(),
    };
    display.finish(&summary);

    match controller.last_end() {
        Some(SessionEnd::Failed(err)) => {
            eprintln!("{}", err.banner());
            Err(anyhow!(err.clone()))
        }
        _ => Ok(()),
    }
}
