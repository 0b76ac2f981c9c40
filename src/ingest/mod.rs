//! Capture sources.
//!
//! This module provides the sources the pacing loop pulls frames from:
//! - Synthetic source (`stub://name`) for tests and demos
//! - Local V4L2 cameras (feature: capture-v4l2)
//! - MJPEG-over-HTTP network cameras (feature: capture-mjpeg)
//!
//! Every source:
//! - Acquires its device exclusively in `open()` and releases it in `close()`
//! - Answers `frame_ready()` and `latest_frame()` without blocking
//! - Holds at most one frame (the newest); older frames are overwritten
//!
//! A source MUST NOT:
//! - Queue frames for later delivery
//! - Log frame content

#[cfg(feature = "capture-mjpeg")]
pub mod mjpeg;
#[cfg(feature = "capture-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

use crate::frame::VideoFrame;

#[cfg(feature = "capture-mjpeg")]
pub use mjpeg::{MjpegConfig, MjpegSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

const DEFAULT_CAPTURE_URL: &str = "stub://camera";
const DEFAULT_CAPTURE_WIDTH: u32 = 1280;
const DEFAULT_CAPTURE_HEIGHT: u32 = 720;
const DEFAULT_CAPTURE_FPS: u32 = 30;

/// A camera (or camera stand-in) that exposes its newest decoded frame.
pub trait CaptureSource {
    /// Acquire the device and start producing frames.
    fn open(&mut self) -> Result<()>;

    /// Whether a frame is currently available.
    fn frame_ready(&self) -> bool;

    /// Newest available frame, if any.
    fn latest_frame(&mut self) -> Option<VideoFrame>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Requested capture parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Source locator: `stub://name`, a device path such as `/dev/video0`,
    /// or an `http(s)://` MJPEG stream.
    pub url: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    /// Preferred device frame rate.
    pub fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CAPTURE_URL.to_string(),
            width: DEFAULT_CAPTURE_WIDTH,
            height: DEFAULT_CAPTURE_HEIGHT,
            fps: DEFAULT_CAPTURE_FPS,
        }
    }
}

/// Build (but do not open) the source named by `settings.url`.
pub fn build_source(settings: &CaptureSettings) -> Result<Box<dyn CaptureSource>> {
    let url = settings.url.trim();
    if let Some(name) = url.strip_prefix("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            name: name.to_string(),
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
        })));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        #[cfg(feature = "capture-mjpeg")]
        {
            return Ok(Box::new(MjpegSource::new(MjpegConfig {
                url: url.to_string(),
            })?));
        }
        #[cfg(not(feature = "capture-mjpeg"))]
        {
            return Err(anyhow!(
                "network camera sources require the capture-mjpeg feature"
            ));
        }
    }
    if url.contains("://") {
        return Err(anyhow!("unsupported capture source '{}'", url));
    }
    build_device_source(url, settings)
}

#[cfg(feature = "capture-v4l2")]
fn build_device_source(device: &str, settings: &CaptureSettings) -> Result<Box<dyn CaptureSource>> {
    Ok(Box::new(V4l2Source::new(V4l2Config {
        device: device.to_string(),
        width: settings.width,
        height: settings.height,
        fps: settings.fps,
    })))
}

#[cfg(not(feature = "capture-v4l2"))]
fn build_device_source(device: &str, _settings: &CaptureSettings) -> Result<Box<dyn CaptureSource>> {
    Err(anyhow!(
        "camera device '{}' requires the capture-v4l2 feature",
        device
    ))
}
