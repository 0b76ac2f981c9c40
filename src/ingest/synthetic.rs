//! Synthetic capture source.
//!
//! `stub://` URLs resolve to `SyntheticSource`, which stands in for a camera in
//! tests and demos. Frames are generated lazily: each query computes which
//! frame the "device" would be showing at the configured rate and renders it
//! only if it is newer than the one already held.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::CaptureSource;
use crate::frame::VideoFrame;

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Name after `stub://`, used only for logging.
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Simulated device frame rate. Zero produces a single still frame.
    pub fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "camera".to_string(),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// Camera stand-in producing a moving test pattern.
pub struct SyntheticSource {
    config: SyntheticConfig,
    opened_at: Option<Instant>,
    latest: Option<VideoFrame>,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            opened_at: None,
            latest: None,
            frame_count: 0,
        }
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn device_frame_index(&self, opened_at: Instant) -> u64 {
        if self.config.fps == 0 {
            return 1;
        }
        let period = Duration::from_secs(1) / self.config.fps;
        (opened_at.elapsed().as_nanos() / period.as_nanos().max(1)) as u64 + 1
    }

    /// Vertical bar sweeping across a gradient; the bar position follows the
    /// frame index so consecutive frames differ.
    fn generate_pixels(&self, index: u64) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let bar_width = (width / 16).max(1);
        let bar_start = (index as usize * 4) % width;

        let mut pixels = vec![0u8; width * height * 3];
        for (row, line) in pixels.chunks_exact_mut(width * 3).enumerate() {
            for (col, px) in line.chunks_exact_mut(3).enumerate() {
                let in_bar = col >= bar_start && col < bar_start + bar_width;
                if in_bar {
                    px.copy_from_slice(&[240, 240, 240]);
                } else {
                    px[0] = ((col * 255) / width.max(1)) as u8;
                    px[1] = ((row * 255) / height.max(1)) as u8;
                    px[2] = (index % 256) as u8;
                }
            }
        }
        pixels
    }
}

impl CaptureSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(anyhow!(
                "synthetic source {} has zero-sized frames",
                self.config.name
            ));
        }
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
            log::info!(
                "SyntheticSource: opened stub://{} ({}x{} @ {} fps)",
                self.config.name,
                self.config.width,
                self.config.height,
                self.config.fps
            );
        }
        Ok(())
    }

    fn frame_ready(&self) -> bool {
        self.opened_at.is_some()
    }

    fn latest_frame(&mut self) -> Option<VideoFrame> {
        let opened_at = self.opened_at?;
        let index = self.device_frame_index(opened_at);
        let stale = self
            .latest
            .as_ref()
            .map(|frame| frame.sequence < index)
            .unwrap_or(true);
        if stale {
            let pixels = self.generate_pixels(index);
            match VideoFrame::from_rgb(pixels, self.config.width, self.config.height, index) {
                Ok(frame) => {
                    self.frame_count += 1;
                    self.latest = Some(frame);
                }
                Err(err) => {
                    log::warn!("SyntheticSource: failed to build frame: {}", err);
                    return None;
                }
            }
        }
        self.latest.clone()
    }

    fn close(&mut self) -> Result<()> {
        if self.opened_at.take().is_some() {
            log::info!("SyntheticSource: closed stub://{}", self.config.name);
        }
        self.latest = None;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "stub://{} ({}x{} synthetic)",
            self.config.name, self.config.width, self.config.height
        )
    }
}
