//! MJPEG-over-HTTP capture source.
//!
//! This module provides `MjpegSource` for network cameras that serve a
//! `multipart/x-mixed-replace` MJPEG stream (or a single JPEG snapshot).
//!
//! The MJPEG source is responsible for:
//! - Connecting to the stream on `open()` (connection failure is a device-access failure)
//! - Splitting the byte stream into JPEG images and decoding them in-memory
//! - Keeping only the newest decoded frame
//!
//! The MJPEG source MUST NOT:
//! - Store decoded frames to disk
//! - Hold more than one frame

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use url::Url;

use super::CaptureSource;
use crate::frame::{FrameSlot, VideoFrame};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for an MJPEG source.
#[derive(Clone, Debug)]
pub struct MjpegConfig {
    /// Stream URL (http or https).
    pub url: String,
}

struct ReaderWorker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Network camera source.
pub struct MjpegSource {
    config: MjpegConfig,
    slot: FrameSlot,
    worker: Option<ReaderWorker>,
}

impl MjpegSource {
    pub fn new(config: MjpegConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse mjpeg url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported mjpeg scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        Ok(Self {
            config,
            slot: FrameSlot::new(),
            worker: None,
        })
    }
}

impl CaptureSource for MjpegSource {
    fn open(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.slot.clear();

        let agent = ureq::AgentBuilder::new().timeout_read(READ_TIMEOUT).build();
        let response = agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to camera stream {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let slot = self.slot.clone();
        let url = self.config.url.clone();
        let join = if content_type.contains("multipart") {
            let reader = response.into_reader();
            std::thread::Builder::new()
                .name("mjpeg-reader".to_string())
                .spawn(move || read_stream(MjpegStream::new(reader), slot, stop_thread))
        } else {
            std::thread::Builder::new()
                .name("jpeg-snapshots".to_string())
                .spawn(move || poll_snapshots(agent, url, slot, stop_thread))
        }
        .map_err(|e| anyhow!("spawn mjpeg reader thread: {}", e))?;

        log::info!("MjpegSource: connected to {}", self.config.url);
        self.worker = Some(ReaderWorker { stop, join });
        Ok(())
    }

    fn frame_ready(&self) -> bool {
        self.worker.is_some() && self.slot.has_frame()
    }

    fn latest_frame(&mut self) -> Option<VideoFrame> {
        if self.worker.is_none() {
            return None;
        }
        self.slot.latest()
    }

    fn close(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // The reader thread notices the flag after its current read returns
        // (bounded by READ_TIMEOUT); it owns only the socket and the slot.
        worker.stop.store(true, Ordering::SeqCst);
        drop(worker.join);
        self.slot.clear();
        log::info!("MjpegSource: released {}", self.config.url);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} (mjpeg)", self.config.url)
    }
}

impl Drop for MjpegSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn read_stream(mut stream: MjpegStream, slot: FrameSlot, stop: Arc<AtomicBool>) {
    let mut sequence = 0u64;
    while !stop.load(Ordering::SeqCst) {
        let jpeg = match stream.read_next_jpeg() {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::error!("MjpegSource: stream ended: {}", err);
                slot.fail(err.to_string());
                return;
            }
        };
        sequence += 1;
        publish_jpeg(&slot, &jpeg, sequence);
    }
}

fn poll_snapshots(agent: ureq::Agent, url: String, slot: FrameSlot, stop: Arc<AtomicBool>) {
    let mut sequence = 0u64;
    while !stop.load(Ordering::SeqCst) {
        match fetch_single_jpeg(&agent, &url) {
            Ok(jpeg) => {
                sequence += 1;
                publish_jpeg(&slot, &jpeg, sequence);
            }
            Err(err) => {
                log::error!("MjpegSource: snapshot failed: {}", err);
                slot.fail(err.to_string());
                return;
            }
        }
        std::thread::sleep(SNAPSHOT_INTERVAL);
    }
}

fn publish_jpeg(slot: &FrameSlot, jpeg: &[u8], sequence: u64) {
    match decode_jpeg(jpeg)
        .and_then(|(pixels, width, height)| VideoFrame::from_rgb(pixels, width, height, sequence))
    {
        Ok(frame) => slot.publish(frame),
        Err(err) => log::warn!("MjpegSource: dropping frame: {}", err),
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Ok((image.into_rgb8().into_raw(), width, height))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
