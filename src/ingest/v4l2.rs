//! V4L2 capture source.
//!
//! This module provides `V4l2Source` for local camera devices (e.g. /dev/video0).
//!
//! The V4L2 source is responsible for:
//! - Acquiring the device node exclusively on `open()`
//! - Running a capture thread that keeps only the newest frame
//! - Converting device pixel formats to RGB24
//! - Releasing the device on `close()` and on drop
//!
//! The V4L2 source MUST NOT:
//! - Store captured frames to disk
//! - Hold more than one frame

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::CaptureSource;
use crate::frame::{FrameSlot, VideoFrame};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const BUFFER_COUNT: u32 = 4;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    /// Preferred device frame rate.
    pub fps: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// Negotiated capture format reported by the capture thread.
#[derive(Clone, Copy, Debug)]
struct ActiveFormat {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
    format: ActiveFormat,
}

/// Local camera source backed by libv4l memory-mapped streaming.
pub struct V4l2Source {
    config: V4l2Config,
    slot: FrameSlot,
    worker: Option<CaptureWorker>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            config,
            slot: FrameSlot::new(),
            worker: None,
        }
    }
}

impl CaptureSource for V4l2Source {
    fn open(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.slot.clear();

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<ActiveFormat, String>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let config = self.config.clone();
        let slot = self.slot.clone();
        let stop_thread = stop.clone();
        let join = std::thread::Builder::new()
            .name("v4l2-capture".to_string())
            .spawn(move || capture_thread(config, slot, stop_thread, ready_tx))
            .map_err(|e| anyhow!("spawn v4l2 capture thread: {}", e))?;

        let format = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(format)) => format,
            Ok(Err(reason)) => {
                let _ = join.join();
                return Err(anyhow!("open v4l2 device {}: {}", self.config.device, reason));
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                return Err(anyhow!(
                    "open v4l2 device {}: no response within {:?}",
                    self.config.device,
                    OPEN_TIMEOUT
                ));
            }
        };

        log::info!(
            "V4l2Source: opened {} ({}x{} {:?})",
            self.config.device,
            format.width,
            format.height,
            format.pixel_format
        );
        self.worker = Some(CaptureWorker { stop, join, format });
        Ok(())
    }

    fn frame_ready(&self) -> bool {
        self.worker.is_some() && self.slot.has_frame()
    }

    fn latest_frame(&mut self) -> Option<VideoFrame> {
        if self.worker.is_none() {
            return None;
        }
        if let Some(reason) = self.slot.failure() {
            log::debug!("V4l2Source: capture stopped: {}", reason);
        }
        self.slot.latest()
    }

    fn close(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop.store(true, Ordering::SeqCst);
        worker
            .join
            .join()
            .map_err(|_| anyhow!("v4l2 capture thread panicked"))?;
        self.slot.clear();
        log::info!("V4l2Source: released {}", self.config.device);
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.worker {
            Some(worker) => format!(
                "{} ({}x{} {:?})",
                self.config.device,
                worker.format.width,
                worker.format.height,
                worker.format.pixel_format
            ),
            None => self.config.device.clone(),
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("V4l2Source: release on drop failed: {}", err);
        }
    }
}

fn capture_thread(
    config: V4l2Config,
    slot: FrameSlot,
    stop: Arc<AtomicBool>,
    ready: mpsc::SyncSender<Result<ActiveFormat, String>>,
) {
    use v4l::buffer::Type;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;

    let mut device = match v4l::Device::with_path(&config.device) {
        Ok(device) => device,
        Err(err) => {
            let _ = ready.send(Err(err.to_string()));
            return;
        }
    };

    let format = match negotiate_format(&mut device, &config) {
        Ok(format) => format,
        Err(err) => {
            let _ = ready.send(Err(err.to_string()));
            return;
        }
    };

    if config.fps > 0 {
        let params = v4l::video::capture::Parameters::with_fps(config.fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!(
                "V4l2Source: failed to set fps on {}: {}",
                config.device,
                err
            );
        }
    }

    let mut stream =
        match v4l::prelude::MmapStream::with_buffers(&mut device, Type::VideoCapture, BUFFER_COUNT) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = ready.send(Err(format!("create buffer stream: {}", err)));
                return;
            }
        };

    if ready.send(Ok(format)).is_err() {
        return;
    }

    let mut sequence = 0u64;
    while !stop.load(Ordering::SeqCst) {
        let (buf, _meta) = match stream.next() {
            Ok(next) => next,
            Err(err) => {
                log::error!("V4l2Source: capture failed on {}: {}", config.device, err);
                slot.fail(err.to_string());
                return;
            }
        };
        let rgb = match normalize_to_rgb(buf, format.width, format.height, format.pixel_format) {
            Ok(rgb) => rgb,
            Err(err) => {
                log::warn!("V4l2Source: dropping frame: {}", err);
                continue;
            }
        };
        sequence += 1;
        match VideoFrame::from_rgb(rgb, format.width, format.height, sequence) {
            Ok(frame) => slot.publish(frame),
            Err(err) => log::warn!("V4l2Source: dropping frame: {}", err),
        }
    }
}

fn negotiate_format(device: &mut v4l::Device, config: &V4l2Config) -> Result<ActiveFormat> {
    use v4l::video::Capture;

    let mut requested = device
        .format()
        .map_err(|e| anyhow!("read v4l2 format: {}", e))?;
    requested.width = config.width;
    requested.height = config.height;
    requested.fourcc = v4l::FourCC::new(b"YUYV");

    let active = match device.set_format(&requested) {
        Ok(format) => format,
        Err(err) => {
            log::warn!(
                "V4l2Source: failed to set format on {}: {}",
                config.device,
                err
            );
            device
                .format()
                .map_err(|e| anyhow!("read v4l2 format after set failure: {}", e))?
        }
    };

    let pixel_format = PixelFormat::from_fourcc(&active.fourcc.repr).ok_or_else(|| {
        anyhow!(
            "unsupported pixel format {} (expected RGB3, YUYV or NV12)",
            active.fourcc
        )
    })?;

    Ok(ActiveFormat {
        width: active.width,
        height: active.height,
        pixel_format,
    })
}
