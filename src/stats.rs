//! Throughput and detection statistics.
//!
//! Two independent measurements feed one snapshot:
//! - `fps`: frames rendered per wall-clock second, counted client-side
//! - `faces` / `documents` / `total`: copied verbatim from the latest server message
//!
//! They are deliberately not coordinated; one is the client's render rate and
//! the other is what the server detected.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::protocol::DetectionStats;

pub const FPS_WINDOW: Duration = Duration::from_millis(1000);

/// Latest values shown to the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub faces: u32,
    pub documents: u32,
    pub total: u32,
    pub fps: u32,
}

/// Counts render events and publishes the count once per window.
#[derive(Clone, Debug)]
pub struct FpsCounter {
    frames: u32,
    window_start: Instant,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
        }
    }

    /// Record one rendered frame. Returns the published rate when at least
    /// `FPS_WINDOW` has elapsed since the last reset; counter and window
    /// restart at `now`.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;
        if now.saturating_duration_since(self.window_start) >= FPS_WINDOW {
            let fps = self.frames;
            self.frames = 0;
            self.window_start = now;
            return Some(fps);
        }
        None
    }

    /// Frames counted in the current, unpublished window.
    pub fn pending(&self) -> u32 {
        self.frames
    }

    pub fn reset(&mut self, now: Instant) {
        self.frames = 0;
        self.window_start = now;
    }
}

/// Owns the snapshot and the render counter.
#[derive(Clone, Debug)]
pub struct StatsAggregator {
    snapshot: StatsSnapshot,
    fps: FpsCounter,
}

impl StatsAggregator {
    pub fn new(now: Instant) -> Self {
        Self {
            snapshot: StatsSnapshot::default(),
            fps: FpsCounter::new(now),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot
    }

    /// Overwrite detection counts with the server's latest report.
    pub fn apply_detections(&mut self, stats: &DetectionStats) {
        self.snapshot.faces = stats.faces;
        self.snapshot.documents = stats.documents;
        self.snapshot.total = stats.total;
    }

    pub fn record_render(&mut self, now: Instant) {
        if let Some(fps) = self.fps.record(now) {
            self.snapshot.fps = fps;
            log::debug!("render rate {} fps", fps);
        }
    }

    /// Start a fresh measurement window, e.g. when a new session opens.
    pub fn restart_window(&mut self, now: Instant) {
        self.fps.reset(now);
    }

    /// Session ended: rate drops to zero, detection counts keep their last values.
    pub fn session_ended(&mut self, now: Instant) {
        self.snapshot.fps = 0;
        self.fps.reset(now);
    }

    pub fn pending_renders(&self) -> u32 {
        self.fps.pending()
    }
}
