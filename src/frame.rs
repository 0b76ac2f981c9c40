//! Captured video frames and the latest-value handoff between a capture
//! thread and the pacing loop.
//!
//! - `VideoFrame`: one decoded RGB24 frame. Cheap to clone (shared pixels).
//! - `FrameSlot`: single-slot mailbox holding only the newest frame. Publishing
//!   replaces whatever was there; nothing is ever queued.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A decoded RGB24 frame from a capture source.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Capture counter assigned by the source (1-based, monotonic per open).
    pub sequence: u64,
    captured_at: Instant,
}

impl VideoFrame {
    /// Wrap tightly packed RGB24 pixels. The buffer length must be `width * height * 3`.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

#[derive(Default)]
struct SlotState {
    latest: Option<VideoFrame>,
    failure: Option<String>,
}

/// Newest-frame mailbox shared between a capture thread and its source handle.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<Mutex<SlotState>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the held frame with a newer one.
    pub fn publish(&self, frame: VideoFrame) {
        self.state().latest = Some(frame);
    }

    /// Record that the producer stopped; the last good frame is discarded.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.state();
        state.latest = None;
        state.failure = Some(reason.into());
    }

    pub fn has_frame(&self) -> bool {
        self.state().latest.is_some()
    }

    /// Newest frame, left in place so the next query still sees it.
    pub fn latest(&self) -> Option<VideoFrame> {
        self.state().latest.clone()
    }

    pub fn failure(&self) -> Option<String> {
        self.state().failure.clone()
    }

    pub fn clear(&self) {
        *self.state() = SlotState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(VideoFrame::from_rgb(vec![0u8; 11], 2, 2, 1).is_err());
        assert!(VideoFrame::from_rgb(Vec::new(), 0, 2, 1).is_err());
        assert!(VideoFrame::from_rgb(vec![0u8; 12], 2, 2, 1).is_ok());
    }

    #[test]
    fn slot_keeps_only_newest_frame() -> Result<()> {
        let slot = FrameSlot::new();
        assert!(!slot.has_frame());
        for seq in 1..=5 {
            slot.publish(VideoFrame::from_rgb(vec![seq as u8; 12], 2, 2, seq)?);
        }
        let latest = slot.latest().expect("frame published");
        assert_eq!(latest.sequence, 5);
        // Reading does not consume.
        assert_eq!(slot.latest().map(|f| f.sequence), Some(5));
        Ok(())
    }

    #[test]
    fn failure_drops_latest_frame() -> Result<()> {
        let slot = FrameSlot::new();
        slot.publish(VideoFrame::from_rgb(vec![0u8; 12], 2, 2, 1)?);
        slot.fail("device unplugged");
        assert!(!slot.has_frame());
        assert_eq!(slot.failure().as_deref(), Some("device unplugged"));
        slot.clear();
        assert!(slot.failure().is_none());
        Ok(())
    }

    #[test]
    fn slot_survives_a_panicked_producer() -> Result<()> {
        let slot = FrameSlot::new();
        let producer = slot.clone();
        let crashed = std::thread::spawn(move || {
            let _guard = producer.inner.lock().expect("lock");
            panic!("capture thread died");
        })
        .join();
        assert!(crashed.is_err());
        assert!(slot.inner.is_poisoned());

        slot.publish(VideoFrame::from_rgb(vec![0u8; 12], 2, 2, 1)?);
        assert!(slot.has_frame());
        assert_eq!(slot.latest().map(|f| f.sequence), Some(1));
        Ok(())
    }
}
