//! Transport layer for the processing service connection.
//!
//! A transport is a duplex, message-oriented channel. The controller never
//! blocks on it: outbound frames are handed over through a single slot, and
//! everything the connection reports (open, messages, errors, close) comes
//! back as a `TransportEvent` on the controller's event channel, tagged with
//! the session that created the connection.
//!
//! Transports are responsible for:
//! - Establishing the connection without blocking the caller
//! - Delivering inbound text messages in arrival order
//! - Sending at most one pending outbound frame (newer replaces older)
//! - Performing the close handshake after an optional farewell message
//!
//! Transports MUST NOT:
//! - Queue outbound frames
//! - Report events for a session other than the one that created them

use anyhow::Result;
use std::sync::mpsc::Sender;

use crate::controller::ControlEvent;
use crate::session::SessionId;

pub mod ws;

pub use ws::{WsConnector, WsTransport};

/// Something the connection reports back to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    MessageReceived(String),
    TransportError(String),
    Closed,
}

/// Session-tagged sender for transport events.
#[derive(Clone, Debug)]
pub struct EventSink {
    session: SessionId,
    tx: Sender<ControlEvent>,
}

impl EventSink {
    pub fn new(session: SessionId, tx: Sender<ControlEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns false once the controller is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(ControlEvent::Transport {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// An established (or establishing) connection owned by one session.
pub trait StreamTransport {
    /// True when the connection is open and the previous outbound frame has
    /// been handed to the socket.
    fn is_ready(&self) -> bool;

    /// Queue `text` as the next outbound message, replacing any unsent one.
    fn send_text(&mut self, text: String) -> Result<()>;

    /// Send `farewell` (if any) and start the close handshake. Idempotent.
    fn close(&mut self, farewell: Option<String>) -> Result<()>;
}

/// Opens transports. Establishment outcome is reported through `events`.
pub trait Connector {
    fn connect(&mut self, endpoint: &str, events: EventSink) -> Result<Box<dyn StreamTransport>>;
}
