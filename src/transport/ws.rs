//! WebSocket transport backed by `tungstenite`.
//!
//! Each connection runs on its own IO thread. The thread owns the socket and
//! polls it with a short read timeout so it can interleave:
//! - writing the pending outbound frame (if any)
//! - reading inbound messages and forwarding them as events
//! - honouring a close request from the session
//!
//! The `WsTransport` handle shared with the session only touches the outbox
//! and two flags; it never blocks on the network.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Error as WsError, Message, WebSocket};
use url::Url;

use super::{Connector, EventSink, StreamTransport, TransportEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Outbox {
    frame: Option<String>,
    close: Option<CloseRequest>,
}

struct CloseRequest {
    farewell: Option<String>,
}

#[derive(Default)]
struct Shared {
    outbox: Mutex<Outbox>,
    open: AtomicBool,
    alive: AtomicBool,
}

impl Shared {
    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Opens WebSocket connections on background IO threads.
#[derive(Clone, Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&mut self, endpoint: &str, events: EventSink) -> Result<Box<dyn StreamTransport>> {
        let url = Url::parse(endpoint).with_context(|| format!("parse endpoint {}", endpoint))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(anyhow!("unsupported endpoint scheme '{}'", other)),
        }

        let shared = Arc::new(Shared::default());
        shared.alive.store(true, Ordering::SeqCst);
        let thread_shared = shared.clone();
        let endpoint = url.to_string();
        std::thread::Builder::new()
            .name(format!("ws-{}", events.session()))
            .spawn(move || io_thread(endpoint, thread_shared, events))
            .map_err(|e| anyhow!("spawn websocket thread: {}", e))?;

        Ok(Box::new(WsTransport { shared }))
    }
}

/// Session-side handle for one WebSocket connection.
pub struct WsTransport {
    shared: Arc<Shared>,
}

impl StreamTransport for WsTransport {
    fn is_ready(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
            && self.shared.alive.load(Ordering::SeqCst)
            && self.shared.outbox().frame.is_none()
    }

    fn send_text(&mut self, text: String) -> Result<()> {
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(anyhow!("websocket connection is gone"));
        }
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(anyhow!("websocket connection is not open"));
        }
        let mut outbox = self.shared.outbox();
        if outbox.close.is_some() {
            return Err(anyhow!("websocket connection is closing"));
        }
        outbox.frame = Some(text);
        Ok(())
    }

    fn close(&mut self, farewell: Option<String>) -> Result<()> {
        let mut outbox = self.shared.outbox();
        if outbox.close.is_none() {
            outbox.frame = None;
            outbox.close = Some(CloseRequest { farewell });
        }
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.close(None);
    }
}

// ----------------------------------------------------------------------------
// IO thread
// ----------------------------------------------------------------------------

fn io_thread(endpoint: String, shared: Arc<Shared>, events: EventSink) {
    let mut socket = match tungstenite::connect(endpoint.as_str()) {
        Ok((socket, _response)) => socket,
        Err(err) => {
            shared.alive.store(false, Ordering::SeqCst);
            if shared.outbox().close.is_none() {
                log::warn!("WsTransport: connect to {} failed: {}", endpoint, err);
                events.emit(TransportEvent::TransportError(err.to_string()));
            }
            return;
        }
    };
    if let Err(err) = set_read_timeout(&socket, POLL_INTERVAL) {
        log::warn!("WsTransport: {}", err);
    }

    shared.open.store(true, Ordering::SeqCst);
    log::info!("WsTransport: connected to {}", endpoint);
    if !events.emit(TransportEvent::Opened) {
        let _ = socket.close(None);
        shared.open.store(false, Ordering::SeqCst);
        shared.alive.store(false, Ordering::SeqCst);
        return;
    }

    let outcome = pump(&mut socket, &shared, &events);
    shared.open.store(false, Ordering::SeqCst);
    shared.alive.store(false, Ordering::SeqCst);
    match outcome {
        Pump::ClosedLocally => log::info!("WsTransport: closed {}", endpoint),
        Pump::ClosedByPeer => {
            log::info!("WsTransport: {} closed the connection", endpoint);
            events.emit(TransportEvent::Closed);
        }
        Pump::Failed(reason) => {
            log::warn!("WsTransport: {} failed: {}", endpoint, reason);
            events.emit(TransportEvent::TransportError(reason));
        }
    }
}

enum Pump {
    ClosedLocally,
    ClosedByPeer,
    Failed(String),
}

fn pump(socket: &mut Socket, shared: &Shared, events: &EventSink) -> Pump {
    let mut closing_since: Option<Instant> = None;
    let mut peer_closing_since: Option<Instant> = None;
    loop {
        if let Some(since) = peer_closing_since {
            shared.outbox().frame = None;
            if since.elapsed() >= CLOSE_TIMEOUT {
                log::debug!("WsTransport: peer kept the socket open after closing");
                return Pump::ClosedByPeer;
            }
        } else if let Some(since) = closing_since {
            if since.elapsed() >= CLOSE_TIMEOUT {
                log::debug!("WsTransport: close handshake timed out");
                return Pump::ClosedLocally;
            }
        } else {
            let (frame, close) = {
                let mut outbox = shared.outbox();
                (outbox.frame.take(), outbox.close.take())
            };
            if let Some(close) = close {
                shared.open.store(false, Ordering::SeqCst);
                if let Some(farewell) = close.farewell {
                    if let Err(err) = socket.send(Message::Text(farewell)) {
                        log::debug!("WsTransport: farewell not delivered: {}", err);
                    }
                }
                if let Err(err) = socket.close(None) {
                    log::debug!("WsTransport: close frame not delivered: {}", err);
                    return Pump::ClosedLocally;
                }
                closing_since = Some(Instant::now());
            } else if let Some(frame) = frame {
                if let Err(err) = socket.send(Message::Text(frame)) {
                    return Pump::Failed(err.to_string());
                }
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                if closing_since.is_none() && !events.emit(TransportEvent::MessageReceived(text)) {
                    shared.outbox().close.get_or_insert(CloseRequest { farewell: None });
                }
            }
            Ok(Message::Close(_)) => {
                shared.open.store(false, Ordering::SeqCst);
                peer_closing_since.get_or_insert_with(Instant::now);
            }
            Ok(_) => {}
            Err(WsError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                if let Err(err) = socket.flush() {
                    if !matches!(err, WsError::Io(ref io) if io.kind() == ErrorKind::WouldBlock) {
                        return finish(closing_since, Some(err.to_string()));
                    }
                }
            }
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                return finish(closing_since, None);
            }
            Err(err) => return finish(closing_since, Some(err.to_string())),
        }
    }
}

fn finish(closing_since: Option<Instant>, error: Option<String>) -> Pump {
    match (closing_since, error) {
        (Some(_), _) => Pump::ClosedLocally,
        (None, None) => Pump::ClosedByPeer,
        (None, Some(reason)) => Pump::Failed(reason),
    }
}

fn set_read_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
    let stream: &TcpStream = match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => stream,
        #[cfg(feature = "tls")]
        MaybeTlsStream::Rustls(stream) => stream.get_ref(),
        _ => return Err(anyhow!("unsupported websocket stream type")),
    };
    stream
        .set_read_timeout(Some(timeout))
        .context("set websocket read timeout")
}
