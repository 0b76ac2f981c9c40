//! Single-threaded event loop driving a `StreamController`.
//!
//! The loop blocks on the control channel until either an event arrives or
//! the next pacing deadline passes, so pacing and inbound handling never run
//! concurrently. It returns when the session ends or the channel closes.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::controller::{ControlEvent, StreamController};
use crate::render::Surface;

/// Upper bound on one wait when no pacing deadline is pending.
pub const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Why `run` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// The session ended (stopped, closed, or failed).
    SessionEnded,
    /// Every sender was dropped.
    Disconnected,
}

/// Drive `controller` until its session ends. `on_turn` runs after every
/// wake-up (event or deadline) and is where callers refresh their display.
pub fn run<S, F>(
    controller: &mut StreamController<S>,
    events: &Receiver<ControlEvent>,
    mut on_turn: F,
) -> RunExit
where
    S: Surface,
    F: FnMut(&StreamController<S>),
{
    loop {
        if !controller.is_active() {
            return RunExit::SessionEnded;
        }

        let now = Instant::now();
        let wait = controller
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);

        match events.recv_timeout(wait) {
            Ok(event) => controller.handle_event(event, Instant::now()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                controller.stop(Instant::now());
                on_turn(controller);
                return RunExit::Disconnected;
            }
        }

        controller.poll_pacing(Instant::now());
        on_turn(controller);
    }
}
