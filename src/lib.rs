//! Scannon real-time streaming client
//!
//! Captures live video, streams frames to a privacy-redaction service over a
//! persistent WebSocket, and renders the processed (redacted) frames as they
//! come back, while reporting render rate and detection counts.
//!
//! # Architecture
//!
//! Two self-paced cycles share one connection:
//!
//! 1. **Pacing**: every ~66 ms the newest captured frame is JPEG-encoded and
//!    handed to the transport, unless the transport is still busy, in which
//!    case the cycle is skipped. Nothing is queued.
//! 2. **Rendering**: every processed frame that arrives is decoded and drawn,
//!    replacing the previous one, and counted towards fps.
//!
//! Both run on one thread (`runner::run`) driven by typed `ControlEvent`s; the
//! socket itself lives on a helper thread owned by the transport.
//!
//! # Module Structure
//!
//! - `ingest`: Capture sources (synthetic, V4L2, MJPEG-over-HTTP)
//! - `frame`: Captured frames and the newest-frame slot
//! - `encode`: JPEG / data URI encoding
//! - `protocol`: Wire messages
//! - `transport`: Connection trait and the WebSocket implementation
//! - `session`: One streaming attempt and its pacing loop
//! - `render`: Render sink and surfaces
//! - `stats`: fps and detection statistics
//! - `controller`: Session lifecycle, event routing, single teardown path
//! - `runner`: The event loop
//! - `config`: File + environment configuration

pub mod config;
pub mod controller;
pub mod encode;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod protocol;
pub mod render;
pub mod runner;
pub mod session;
pub mod stats;
pub mod transport;

pub use config::StreamConfig;
pub use controller::{
    ControlEvent, PipelineSettings, SourceFactory, StartOutcome, StreamController,
    DEFAULT_ENDPOINT, DEFAULT_PACE_INTERVAL,
};
pub use encode::{FrameEncoder, DEFAULT_JPEG_QUALITY};
pub use error::{FatalError, SessionEnd, CONNECTION_BANNER, DEVICE_ACCESS_BANNER};
pub use frame::{FrameSlot, VideoFrame};
pub use ingest::{build_source, CaptureSettings, CaptureSource, SyntheticConfig, SyntheticSource};
pub use protocol::{ClientMessage, DataUri, DetectionStats, ServerMessage};
pub use render::{FileSurface, MemorySurface, RenderSink, Surface};
pub use runner::{run, RunExit};
pub use session::{PaceOutcome, Session, SessionId, SessionState};
pub use stats::{FpsCounter, StatsAggregator, StatsSnapshot};
pub use transport::{Connector, EventSink, StreamTransport, TransportEvent, WsConnector};
