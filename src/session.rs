//! One streaming attempt.
//!
//! A `Session` owns everything a single attempt acquires: the opened capture
//! source, the transport handle, the running flag and the pacing deadline.
//! It is created on start and dropped on stop or on a fatal error; a restart
//! always builds a new one with a new id.
//!
//! The session is responsible for:
//! - Tracking the connection state machine
//! - Running pacing cycles when their deadline is due
//! - Releasing its resources exactly once (`shutdown`, with `Drop` as a net)
//!
//! The session MUST NOT:
//! - Retry or reconnect on its own
//! - Buffer frames for a later cycle

use std::fmt;
use std::time::{Duration, Instant};

use crate::encode::FrameEncoder;
use crate::ingest::CaptureSource;
use crate::protocol::ClientMessage;
use crate::transport::StreamTransport;

/// Generation number of a session. Events carrying an older id are stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Failed)
                | (Open, Closing)
                | (Open, Failed)
                | (Closing, Closed)
                | (Closing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Terminal state requested from `Session::shutdown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ending {
    Closed,
    Failed,
}

/// What one pacing cycle did.
#[derive(Debug)]
pub enum PaceOutcome {
    /// Session not open or no longer running; nothing rescheduled.
    Halted,
    /// The capture source had no frame yet.
    NoFrame,
    /// The transport was still busy; the cycle was skipped.
    NotReady,
    Sent,
    EncodeFailed,
    /// The transport refused the frame. The loop is stopped.
    SendFailed(anyhow::Error),
}

pub struct Session {
    id: SessionId,
    state: SessionState,
    running: bool,
    started_at: Instant,
    pace_interval: Duration,
    next_pace_at: Option<Instant>,
    source: Box<dyn CaptureSource>,
    transport: Option<Box<dyn StreamTransport>>,
    frames_sent: u64,
    cycles_skipped: u64,
    cycles_without_frame: u64,
    released: bool,
}

impl Session {
    /// Wrap an already opened capture source.
    pub fn new(
        id: SessionId,
        source: Box<dyn CaptureSource>,
        pace_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            running: false,
            started_at: now,
            pace_interval,
            next_pace_at: None,
            source,
            transport: None,
            frames_sent: 0,
            cycles_skipped: 0,
            cycles_without_frame: 0,
            released: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn next_pace_at(&self) -> Option<Instant> {
        self.next_pace_at
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn cycles_skipped(&self) -> u64 {
        self.cycles_skipped
    }

    pub fn cycles_without_frame(&self) -> u64 {
        self.cycles_without_frame
    }

    pub fn source_description(&self) -> String {
        self.source.describe()
    }

    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "session {}: ignoring invalid transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
            return false;
        }
        log::debug!("session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        true
    }

    pub fn begin_connecting(&mut self) -> bool {
        self.transition(SessionState::Connecting)
    }

    pub fn attach_transport(&mut self, transport: Box<dyn StreamTransport>) {
        self.transport = Some(transport);
    }

    /// Handshake finished: start pacing, first cycle due immediately.
    pub fn on_opened(&mut self, now: Instant) -> bool {
        if !self.transition(SessionState::Open) {
            return false;
        }
        self.running = true;
        self.next_pace_at = Some(now);
        true
    }

    /// Run one pacing cycle if its deadline has passed.
    pub fn poll_pacing(&mut self, now: Instant, encoder: &FrameEncoder) -> Option<PaceOutcome> {
        let due = self.next_pace_at?;
        if now < due {
            return None;
        }
        Some(self.pace(now, encoder))
    }

    fn pace(&mut self, now: Instant, encoder: &FrameEncoder) -> PaceOutcome {
        if !self.running || self.state != SessionState::Open {
            self.next_pace_at = None;
            return PaceOutcome::Halted;
        }
        self.next_pace_at = Some(now + self.pace_interval);

        if !self.source.frame_ready() {
            self.cycles_without_frame += 1;
            log::debug!("session {}: video not ready", self.id);
            return PaceOutcome::NoFrame;
        }
        let Some(transport) = self.transport.as_mut() else {
            self.next_pace_at = None;
            return PaceOutcome::Halted;
        };
        if !transport.is_ready() {
            self.cycles_skipped += 1;
            log::debug!("session {}: transport busy, skipping cycle", self.id);
            return PaceOutcome::NotReady;
        }
        let Some(frame) = self.source.latest_frame() else {
            self.cycles_without_frame += 1;
            return PaceOutcome::NoFrame;
        };

        let message = match encoder
            .encode_data_uri(&frame)
            .and_then(|data| ClientMessage::Frame { data }.to_json())
        {
            Ok(message) => message,
            Err(err) => {
                log::warn!("session {}: frame {} not encoded: {:#}", self.id, frame.sequence, err);
                return PaceOutcome::EncodeFailed;
            }
        };

        if let Err(err) = transport.send_text(message) {
            log::error!("session {}: send failed: {:#}", self.id, err);
            self.running = false;
            self.next_pace_at = None;
            return PaceOutcome::SendFailed(err);
        }
        self.frames_sent += 1;
        log::debug!(
            "session {}: sent frame {} ({}x{})",
            self.id,
            frame.sequence,
            frame.width,
            frame.height
        );
        PaceOutcome::Sent
    }

    /// Tear the session down. Every step runs even if an earlier one fails:
    /// clear the running flag, cancel the pacing deadline, release the camera,
    /// then send `farewell` (if any) and close the transport.
    ///
    /// Returns false when the session was already released.
    pub fn shutdown(&mut self, farewell: Option<String>, ending: Ending) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        self.running = false;
        self.next_pace_at = None;

        if let Err(err) = self.source.close() {
            log::error!("session {}: camera release failed: {:#}", self.id, err);
        }

        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close(farewell) {
                log::error!("session {}: transport close failed: {:#}", self.id, err);
            }
        }

        self.finish_state(ending);
        log::info!(
            "session {}: ended {:?} after {:.1}s ({} frames sent, {} cycles skipped)",
            self.id,
            self.state,
            self.started_at.elapsed().as_secs_f64(),
            self.frames_sent,
            self.cycles_skipped
        );
        true
    }

    fn finish_state(&mut self, ending: Ending) {
        match ending {
            Ending::Failed => {
                if !self.transition(SessionState::Failed) {
                    self.state = SessionState::Failed;
                }
            }
            Ending::Closed => {
                if matches!(self.state, SessionState::Connecting | SessionState::Open) {
                    self.transition(SessionState::Closing);
                }
                if !self.transition(SessionState::Closed) {
                    self.state = SessionState::Closed;
                }
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("session {}: dropped without shutdown; releasing", self.id);
            self.shutdown(None, Ending::Closed);
        }
    }
}
