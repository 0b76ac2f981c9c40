//! Stream controller: the single owner of pipeline state.
//!
//! The controller is driven from one thread. It receives `ControlEvent`s
//! (transport lifecycle and inbound messages, user stop requests) and pacing
//! ticks, and it is the only place a session is created or torn down.
//!
//! The controller is responsible for:
//! - Enforcing at most one active session
//! - Opening the camera before any connection attempt
//! - Routing inbound processed frames to the render sink and statistics
//! - Funnelling every fatal condition through one teardown path
//! - Holding the error banner and the end status of the last session
//!
//! The controller MUST NOT:
//! - Reconnect automatically
//! - Act on events from a session that is no longer current

use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::encode::{FrameEncoder, DEFAULT_JPEG_QUALITY};
use crate::error::{FatalError, SessionEnd};
use crate::ingest::CaptureSource;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::render::{RenderSink, Surface};
use crate::session::{Ending, PaceOutcome, Session, SessionId, SessionState};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::transport::{Connector, EventSink, TransportEvent};

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/realtime";
pub const DEFAULT_PACE_INTERVAL: Duration = Duration::from_millis(66);

/// Everything the event loop reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    Transport {
        session: SessionId,
        event: TransportEvent,
    },
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSettings {
    pub endpoint: String,
    pub pace_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            pace_interval: DEFAULT_PACE_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Produces a fresh, unopened capture source for each session.
pub trait SourceFactory {
    fn create(&mut self) -> Result<Box<dyn CaptureSource>>;
}

impl<F> SourceFactory for F
where
    F: FnMut() -> Result<Box<dyn CaptureSource>>,
{
    fn create(&mut self) -> Result<Box<dyn CaptureSource>> {
        self()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started(SessionId),
    /// A session was already running; nothing was acquired.
    AlreadyActive(SessionId),
}

pub struct StreamController<S: Surface> {
    settings: PipelineSettings,
    encoder: FrameEncoder,
    sources: Box<dyn SourceFactory>,
    connector: Box<dyn Connector>,
    render: RenderSink<S>,
    stats: StatsAggregator,
    events: Sender<ControlEvent>,
    session: Option<Session>,
    last_session: u64,
    last_state: SessionState,
    banner: Option<&'static str>,
    last_end: Option<SessionEnd>,
    decode_failures: u64,
    stale_events: u64,
}

impl<S: Surface> StreamController<S> {
    pub fn new(
        settings: PipelineSettings,
        sources: Box<dyn SourceFactory>,
        connector: Box<dyn Connector>,
        surface: S,
        events: Sender<ControlEvent>,
    ) -> Result<Self> {
        let encoder = FrameEncoder::new(settings.jpeg_quality)?;
        Ok(Self {
            settings,
            encoder,
            sources,
            connector,
            render: RenderSink::new(surface),
            stats: StatsAggregator::new(Instant::now()),
            events,
            session: None,
            last_session: 0,
            last_state: SessionState::Idle,
            banner: None,
            last_end: None,
            decode_failures: 0,
            stale_events: 0,
        })
    }

    // ------------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------------

    /// Open the camera, then start connecting. A second call while a session
    /// is active is a no-op.
    pub fn start(&mut self, now: Instant) -> Result<StartOutcome, FatalError> {
        if let Some(session) = &self.session {
            log::info!("session {} already active", session.id());
            return Ok(StartOutcome::AlreadyActive(session.id()));
        }
        self.banner = None;
        self.last_end = None;

        let source = match self.open_source() {
            Ok(source) => source,
            Err(err) => {
                let fatal = FatalError::DeviceAccess(format!("{:#}", err));
                self.record_failure(&fatal);
                self.last_state = SessionState::Idle;
                return Err(fatal);
            }
        };

        self.last_session += 1;
        let id = SessionId(self.last_session);
        let mut session = Session::new(id, source, self.settings.pace_interval, now);
        log::info!(
            "session {}: capturing from {}, connecting to {}",
            id,
            session.source_description(),
            self.settings.endpoint
        );
        session.begin_connecting();

        let sink = EventSink::new(id, self.events.clone());
        match self.connector.connect(&self.settings.endpoint, sink) {
            Ok(transport) => session.attach_transport(transport),
            Err(err) => {
                let fatal = FatalError::TransportEstablishment(format!("{:#}", err));
                session.shutdown(None, Ending::Failed);
                self.finish(session, SessionEnd::Failed(fatal.clone()), now);
                return Err(fatal);
            }
        }

        self.last_state = session.state();
        self.session = Some(session);
        Ok(StartOutcome::Started(id))
    }

    fn open_source(&mut self) -> Result<Box<dyn CaptureSource>> {
        let mut source = self.sources.create()?;
        source.open()?;
        Ok(source)
    }

    /// Voluntary stop. Returns false when nothing was running.
    pub fn stop(&mut self, now: Instant) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        let farewell = if session.state() == SessionState::Open {
            match ClientMessage::Close.to_json() {
                Ok(text) => Some(text),
                Err(err) => {
                    log::warn!("close message not built: {:#}", err);
                    None
                }
            }
        } else {
            None
        };
        session.shutdown(farewell, Ending::Closed);
        self.finish(session, SessionEnd::Stopped, now);
        true
    }

    fn fail(&mut self, fatal: FatalError, now: Instant) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.shutdown(None, Ending::Failed);
        self.finish(session, SessionEnd::Failed(fatal), now);
    }

    fn finish(&mut self, session: Session, end: SessionEnd, now: Instant) {
        self.last_state = session.state();
        self.stats.session_ended(now);
        if let SessionEnd::Failed(fatal) = &end {
            self.record_failure(fatal);
        } else {
            log::info!("session {}: {}", session.id(), end);
        }
        self.last_end = Some(end);
    }

    fn record_failure(&mut self, fatal: &FatalError) {
        log::error!("{}", fatal);
        self.banner = Some(fatal.banner());
        self.last_end = Some(SessionEnd::Failed(fatal.clone()));
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn handle_event(&mut self, event: ControlEvent, now: Instant) {
        match event {
            ControlEvent::Stop => {
                self.stop(now);
            }
            ControlEvent::Transport { session, event } => {
                self.handle_transport_event(session, event, now)
            }
        }
    }

    fn handle_transport_event(&mut self, id: SessionId, event: TransportEvent, now: Instant) {
        let Some(session) = self.session.as_mut().filter(|s| s.id() == id) else {
            self.stale_events += 1;
            log::debug!("ignoring event from stale session {}", id);
            return;
        };

        match event {
            TransportEvent::Opened => {
                if session.on_opened(now) {
                    self.last_state = SessionState::Open;
                    self.stats.restart_window(now);
                    log::info!("session {}: streaming", id);
                    self.poll_pacing(now);
                }
            }
            TransportEvent::MessageReceived(text) => {
                if session.state() != SessionState::Open {
                    log::debug!("session {}: message outside open state dropped", id);
                    return;
                }
                self.on_message(&text, now);
            }
            TransportEvent::TransportError(reason) => {
                let fatal = if session.state() == SessionState::Connecting {
                    FatalError::TransportEstablishment(reason)
                } else {
                    FatalError::TransportRuntime(reason)
                };
                self.fail(fatal, now);
            }
            TransportEvent::Closed => {
                if session.state() == SessionState::Connecting {
                    self.fail(
                        FatalError::TransportEstablishment(
                            "connection closed during handshake".to_string(),
                        ),
                        now,
                    );
                } else if let Some(mut session) = self.session.take() {
                    session.shutdown(None, Ending::Closed);
                    self.finish(session, SessionEnd::ServerClosed, now);
                }
            }
        }
    }

    fn on_message(&mut self, text: &str, now: Instant) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                self.decode_failures += 1;
                log::warn!("dropping server message: {:#}", err);
                return;
            }
        };
        match message {
            ServerMessage::ProcessedFrame { data, stats } => {
                match self.render.render(&data) {
                    Ok(()) => {
                        if let Some(stats) = stats {
                            self.stats.apply_detections(&stats);
                        }
                        self.stats.record_render(now);
                    }
                    Err(err) => {
                        self.decode_failures += 1;
                        log::warn!("dropping processed frame: {:#}", err);
                    }
                }
            }
            ServerMessage::Unknown => log::debug!("ignoring unknown server message type"),
        }
    }

    /// Run the pacing cycle if it is due.
    pub fn poll_pacing(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(PaceOutcome::SendFailed(err)) = session.poll_pacing(now, &self.encoder) {
            self.fail(FatalError::TransportRuntime(format!("{:#}", err)), now);
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// When the event loop must wake for the next pacing cycle.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.session.as_ref().and_then(Session::next_pace_at)
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(Session::state)
            .unwrap_or(self.last_state)
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// The LIVE indicator: a session is open and pacing.
    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(Session::id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn banner(&self) -> Option<&'static str> {
        self.banner
    }

    pub fn last_end(&self) -> Option<&SessionEnd> {
        self.last_end.as_ref()
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    pub fn stale_events(&self) -> u64 {
        self.stale_events
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn render_sink(&self) -> &RenderSink<S> {
        &self.render
    }

    pub fn surface(&self) -> &S {
        self.render.surface()
    }
}
