use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::GenericImageView;

use scannon_stream::protocol::decode_data_uri;
use scannon_stream::{
    run, CaptureSource, ClientMessage, Connector, ControlEvent, EventSink, FatalError,
    FrameEncoder, MemorySurface, PipelineSettings, RunExit, SessionEnd, SessionId, SessionState,
    StartOutcome, StreamController, StreamTransport, Surface, TransportEvent, VideoFrame,
    CONNECTION_BANNER, DEVICE_ACCESS_BANNER,
};

// Long enough that the runner test never hits a second pacing cycle.
const SLOW_PACE: Duration = Duration::from_secs(60);

// ----------------------------------------------------------------------------
// Fakes
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Camera {
    fail_open: bool,
    frame: Option<VideoFrame>,
    created: u32,
    opens: u32,
    closes: u32,
}

struct FakeCamera(Rc<RefCell<Camera>>);

impl CaptureSource for FakeCamera {
    fn open(&mut self) -> Result<()> {
        let mut camera = self.0.borrow_mut();
        if camera.fail_open {
            return Err(anyhow!("permission denied"));
        }
        camera.opens += 1;
        Ok(())
    }

    fn frame_ready(&self) -> bool {
        self.0.borrow().frame.is_some()
    }

    fn latest_frame(&mut self) -> Option<VideoFrame> {
        self.0.borrow().frame.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.0.borrow_mut().closes += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "fake camera".to_string()
    }
}

#[derive(Default)]
struct Wire {
    ready: bool,
    fail_send: bool,
    sent: Vec<String>,
    closes: Vec<Option<String>>,
}

struct FakeTransport(Rc<RefCell<Wire>>);

impl StreamTransport for FakeTransport {
    fn is_ready(&self) -> bool {
        self.0.borrow().ready
    }

    fn send_text(&mut self, text: String) -> Result<()> {
        let mut wire = self.0.borrow_mut();
        if wire.fail_send {
            return Err(anyhow!("broken pipe"));
        }
        wire.sent.push(text);
        Ok(())
    }

    fn close(&mut self, farewell: Option<String>) -> Result<()> {
        self.0.borrow_mut().closes.push(farewell);
        Ok(())
    }
}

#[derive(Default)]
struct Dialer {
    refuse: bool,
    endpoints: Vec<String>,
    sessions: Vec<SessionId>,
    wires: Vec<Rc<RefCell<Wire>>>,
}

struct FakeConnector(Rc<RefCell<Dialer>>);

impl Connector for FakeConnector {
    fn connect(&mut self, endpoint: &str, events: EventSink) -> Result<Box<dyn StreamTransport>> {
        let mut dialer = self.0.borrow_mut();
        dialer.endpoints.push(endpoint.to_string());
        if dialer.refuse {
            return Err(anyhow!("connection refused"));
        }
        dialer.sessions.push(events.session());
        let wire = Rc::new(RefCell::new(Wire {
            ready: true,
            ..Wire::default()
        }));
        dialer.wires.push(wire.clone());
        Ok(Box::new(FakeTransport(wire)))
    }
}

struct Harness {
    controller: StreamController<MemorySurface>,
    camera: Rc<RefCell<Camera>>,
    dialer: Rc<RefCell<Dialer>>,
    _events: mpsc::Receiver<ControlEvent>,
    t0: Instant,
}

impl Harness {
    fn new() -> Self {
        let camera = Rc::new(RefCell::new(Camera::default()));
        let dialer = Rc::new(RefCell::new(Dialer::default()));
        let (tx, rx) = mpsc::channel();
        let factory_camera = camera.clone();
        let controller = StreamController::new(
            PipelineSettings::default(),
            Box::new(move || -> Result<Box<dyn CaptureSource>> {
                factory_camera.borrow_mut().created += 1;
                Ok(Box::new(FakeCamera(factory_camera.clone())))
            }),
            Box::new(FakeConnector(dialer.clone())),
            MemorySurface::new(),
            tx,
        )
        .expect("controller");
        Self {
            controller,
            camera,
            dialer,
            _events: rx,
            t0: Instant::now(),
        }
    }

    fn at(&self, millis: u64) -> Instant {
        self.t0 + Duration::from_millis(millis)
    }

    fn wire(&self) -> Rc<RefCell<Wire>> {
        self.dialer
            .borrow()
            .wires
            .last()
            .cloned()
            .expect("a transport was created")
    }

    fn set_frame(&self, frame: Option<VideoFrame>) {
        self.camera.borrow_mut().frame = frame;
    }

    fn start(&mut self, millis: u64) -> SessionId {
        let now = self.at(millis);
        match self.controller.start(now).expect("start") {
            StartOutcome::Started(id) => id,
            other => panic!("unexpected start outcome {:?}", other),
        }
    }

    fn deliver(&mut self, session: SessionId, event: TransportEvent, millis: u64) {
        let now = self.at(millis);
        self.controller
            .handle_event(ControlEvent::Transport { session, event }, now);
    }

    fn start_open(&mut self) -> SessionId {
        let id = self.start(0);
        self.deliver(id, TransportEvent::Opened, 0);
        id
    }
}

fn solid_frame(width: u32, height: u32, sequence: u64) -> VideoFrame {
    let pixels = vec![90u8; (width * height * 3) as usize];
    VideoFrame::from_rgb(pixels, width, height, sequence).expect("frame")
}

fn processed(width: u32, height: u32, stats: Option<(u32, u32, u32)>) -> String {
    let data = FrameEncoder::default()
        .encode_data_uri(&solid_frame(width, height, 1))
        .expect("encode");
    let mut message = serde_json::json!({ "type": "processed_frame", "data": data });
    if let Some((faces, documents, total)) = stats {
        message["stats"] = serde_json::json!({
            "faces": faces,
            "documents": documents,
            "total": total,
        });
    }
    message.to_string()
}

fn sent_frame_width(message: &str) -> u32 {
    let value: serde_json::Value = serde_json::from_str(message).expect("json");
    assert_eq!(value["type"], "frame");
    let uri = decode_data_uri(value["data"].as_str().expect("data")).expect("data uri");
    image::load_from_memory(&uri.payload)
        .expect("jpeg")
        .dimensions()
        .0
}

// ----------------------------------------------------------------------------
// Start
// ----------------------------------------------------------------------------

#[test]
fn second_start_is_a_noop() {
    let mut h = Harness::new();
    let id = h.start(0);
    assert_eq!(h.controller.state(), SessionState::Connecting);

    let again = h.controller.start(h.at(10)).expect("second start");
    assert_eq!(again, StartOutcome::AlreadyActive(id));
    h.deliver(id, TransportEvent::Opened, 20);
    assert_eq!(
        h.controller.start(h.at(30)).expect("third start"),
        StartOutcome::AlreadyActive(id)
    );

    let camera = h.camera.borrow();
    assert_eq!((camera.created, camera.opens), (1, 1));
    assert_eq!(h.dialer.borrow().endpoints.len(), 1);
    assert_eq!(
        h.dialer.borrow().endpoints[0],
        "ws://localhost:8000/ws/realtime"
    );
}

#[test]
fn camera_failure_prevents_connection() {
    let mut h = Harness::new();
    h.camera.borrow_mut().fail_open = true;

    let err = h.controller.start(h.at(0)).expect_err("device failure");
    assert!(matches!(err, FatalError::DeviceAccess(_)));
    assert_eq!(h.controller.banner(), Some(DEVICE_ACCESS_BANNER));
    assert!(!h.controller.is_active());
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(h.dialer.borrow().endpoints.is_empty());
    assert_eq!(h.controller.next_deadline(), None);
}

#[test]
fn refused_connection_releases_camera() {
    let mut h = Harness::new();
    h.dialer.borrow_mut().refuse = true;

    let err = h.controller.start(h.at(0)).expect_err("connect failure");
    assert!(matches!(err, FatalError::TransportEstablishment(_)));
    assert_eq!(h.controller.banner(), Some(CONNECTION_BANNER));
    assert_eq!(h.controller.state(), SessionState::Failed);
    assert!(!h.controller.is_active());
    assert_eq!(h.camera.borrow().closes, 1);
}

#[test]
fn handshake_error_is_an_establishment_failure() {
    let mut h = Harness::new();
    let id = h.start(0);
    h.deliver(
        id,
        TransportEvent::TransportError("connection refused".to_string()),
        5,
    );

    assert!(matches!(
        h.controller.last_end(),
        Some(SessionEnd::Failed(FatalError::TransportEstablishment(_)))
    ));
    assert_eq!(h.controller.banner(), Some(CONNECTION_BANNER));
    assert_eq!(h.camera.borrow().closes, 1);
    assert_eq!(h.wire().borrow().closes, vec![None]);
}

#[test]
fn close_during_handshake_is_an_establishment_failure() {
    let mut h = Harness::new();
    let id = h.start(0);
    h.deliver(id, TransportEvent::Closed, 5);
    assert!(matches!(
        h.controller.last_end(),
        Some(SessionEnd::Failed(FatalError::TransportEstablishment(_)))
    ));
    assert_eq!(h.controller.state(), SessionState::Failed);
}

#[test]
fn restart_clears_banner_and_uses_new_session() {
    let mut h = Harness::new();
    let first = h.start_open();
    h.deliver(first, TransportEvent::TransportError("reset".into()), 100);
    assert_eq!(h.controller.banner(), Some(CONNECTION_BANNER));

    let second = h.start(200);
    assert_ne!(first, second);
    assert_eq!(h.controller.banner(), None);
    assert_eq!(h.controller.last_end(), None);
    assert_eq!(h.dialer.borrow().sessions, vec![first, second]);
}

// ----------------------------------------------------------------------------
// Pacing
// ----------------------------------------------------------------------------

#[test]
fn first_cycle_sends_immediately_on_open() {
    let mut h = Harness::new();
    h.set_frame(Some(solid_frame(16, 8, 1)));
    h.start_open();

    assert!(h.controller.is_streaming());
    assert_eq!(h.wire().borrow().sent.len(), 1);
    assert_eq!(h.controller.next_deadline(), Some(h.at(66)));

    h.controller.poll_pacing(h.at(40));
    assert_eq!(h.wire().borrow().sent.len(), 1, "not due yet");
    h.controller.poll_pacing(h.at(66));
    assert_eq!(h.wire().borrow().sent.len(), 2);
}

#[test]
fn no_frame_cycles_send_nothing_and_keep_pacing() {
    let mut h = Harness::new();
    h.start_open();

    for cycle in 1..=5u64 {
        h.controller.poll_pacing(h.at(cycle * 66));
        assert!(h.controller.next_deadline().is_some());
    }

    assert!(h.wire().borrow().sent.is_empty());
    let session = h.controller.session().expect("session");
    assert_eq!(session.cycles_without_frame(), 6);
    assert_eq!(session.frames_sent(), 0);
    assert_eq!(h.controller.next_deadline(), Some(h.at(5 * 66 + 66)));
}

#[test]
fn busy_transport_skips_cycles_then_sends_newest_frame() {
    let mut h = Harness::new();
    h.set_frame(Some(solid_frame(8, 8, 1)));
    h.start_open();
    assert_eq!(h.wire().borrow().sent.len(), 1);

    h.wire().borrow_mut().ready = false;
    for (cycle, width) in (1..=4u64).zip([10u32, 12, 14, 16]) {
        h.set_frame(Some(solid_frame(width, 8, cycle + 1)));
        h.controller.poll_pacing(h.at(cycle * 66));
    }
    assert_eq!(h.wire().borrow().sent.len(), 1, "nothing queued while busy");
    assert_eq!(h.controller.session().expect("session").cycles_skipped(), 4);

    h.wire().borrow_mut().ready = true;
    h.controller.poll_pacing(h.at(5 * 66));
    let wire = h.wire();
    let wire = wire.borrow();
    assert_eq!(wire.sent.len(), 2);
    assert_eq!(sent_frame_width(&wire.sent[1]), 16);
}

#[test]
fn send_failure_tears_down_as_runtime_error() {
    let mut h = Harness::new();
    h.set_frame(Some(solid_frame(8, 8, 1)));
    let id = h.start(0);
    h.wire().borrow_mut().fail_send = true;
    h.deliver(id, TransportEvent::Opened, 0);

    assert!(matches!(
        h.controller.last_end(),
        Some(SessionEnd::Failed(FatalError::TransportRuntime(_)))
    ));
    assert!(!h.controller.is_active());
    assert_eq!(h.controller.next_deadline(), None);
    assert_eq!(h.camera.borrow().closes, 1);
    assert_eq!(h.wire().borrow().closes.len(), 1);
}

// ----------------------------------------------------------------------------
// Rendering and statistics
// ----------------------------------------------------------------------------

#[test]
fn processed_frames_render_and_report_stats() {
    let mut h = Harness::new();
    let id = h.start_open();

    h.deliver(
        id,
        TransportEvent::MessageReceived(processed(12, 6, Some((2, 1, 3)))),
        50,
    );
    assert_eq!(h.controller.surface().presented(), 1);
    assert_eq!(h.controller.surface().size(), Some((12, 6)));
    let stats = h.controller.stats();
    assert_eq!((stats.faces, stats.documents, stats.total), (2, 1, 3));

    h.deliver(
        id,
        TransportEvent::MessageReceived(processed(12, 6, Some((0, 4, 4)))),
        90,
    );
    let stats = h.controller.stats();
    assert_eq!((stats.faces, stats.documents, stats.total), (0, 4, 4));

    h.deliver(id, TransportEvent::MessageReceived(processed(12, 6, None)), 120);
    assert_eq!(h.controller.stats().total, 4, "absent stats keep the snapshot");
    assert_eq!(h.controller.surface().presented(), 3);
    assert_eq!(h.controller.surface().resizes(), 1);
}

#[test]
fn fps_counts_renders_per_second() {
    let mut h = Harness::new();
    let id = h.start_open();
    let message = processed(4, 4, None);

    for i in 1..=12u64 {
        h.deliver(id, TransportEvent::MessageReceived(message.clone()), i * 90);
    }
    // Twelfth render lands at 1080 ms, the first one past the window edge.
    assert_eq!(h.controller.stats().fps, 12);
}

#[test]
fn bad_frame_then_good_frame() {
    let mut h = Harness::new();
    let id = h.start_open();

    h.deliver(
        id,
        TransportEvent::MessageReceived(processed(8, 8, Some((1, 0, 1)))),
        5,
    );
    assert_eq!(h.controller.surface().presented(), 1);

    let broken = serde_json::json!({
        "type": "processed_frame",
        "data": "data:image/jpeg;base64,AAAA",
        "stats": {"faces": 9, "documents": 9, "total": 18},
    })
    .to_string();
    h.deliver(id, TransportEvent::MessageReceived(broken), 10);
    h.deliver(id, TransportEvent::MessageReceived("{not json".into()), 20);
    assert!(h.controller.is_streaming(), "decode failures are not fatal");
    assert_eq!(h.controller.surface().presented(), 1);
    let stats = h.controller.stats();
    assert_eq!(
        (stats.faces, stats.documents, stats.total),
        (1, 0, 1),
        "counts from an undecodable frame are discarded"
    );

    h.deliver(id, TransportEvent::MessageReceived(processed(8, 8, None)), 30);
    assert_eq!(h.controller.surface().presented(), 2);
    assert_eq!(h.controller.decode_failures(), 2);
    let stats = h.controller.stats();
    assert_eq!((stats.faces, stats.documents, stats.total), (1, 0, 1));
}

#[test]
fn unknown_message_types_are_ignored() {
    let mut h = Harness::new();
    let id = h.start_open();
    h.deliver(
        id,
        TransportEvent::MessageReceived(r#"{"type":"status","queue":3}"#.into()),
        10,
    );
    assert!(h.controller.is_streaming());
    assert_eq!(h.controller.decode_failures(), 0);
    assert_eq!(h.controller.surface().presented(), 0);
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

#[test]
fn stop_sends_close_message_then_releases_once() {
    let mut h = Harness::new();
    h.set_frame(Some(solid_frame(8, 8, 1)));
    h.start_open();
    for i in 1..=11u64 {
        h.deliver(
            h.controller.session_id().expect("id"),
            TransportEvent::MessageReceived(processed(4, 4, None)),
            i * 100,
        );
    }
    assert_eq!(h.controller.stats().fps, 10);

    assert!(h.controller.stop(h.at(1200)));
    assert!(!h.controller.stop(h.at(1300)));

    let close = ClientMessage::Close.to_json().expect("close json");
    assert_eq!(close, r#"{"type":"close"}"#);
    assert_eq!(h.wire().borrow().closes, vec![Some(close)]);
    assert_eq!(h.camera.borrow().closes, 1);
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.controller.last_end(), Some(&SessionEnd::Stopped));
    assert_eq!(h.controller.banner(), None);
    assert_eq!(h.controller.stats().fps, 0);
    assert_eq!(h.controller.next_deadline(), None);
}

#[test]
fn stop_while_connecting_skips_close_message() {
    let mut h = Harness::new();
    h.start(0);
    assert!(h.controller.stop(h.at(10)));
    assert_eq!(h.wire().borrow().closes, vec![None]);
    assert_eq!(h.controller.state(), SessionState::Closed);
}

#[test]
fn stop_after_failure_is_harmless() {
    let mut h = Harness::new();
    let id = h.start_open();
    h.deliver(id, TransportEvent::TransportError("reset by peer".into()), 100);
    assert!(!h.controller.stop(h.at(200)));
    h.controller.handle_event(ControlEvent::Stop, h.at(300));

    assert_eq!(h.camera.borrow().closes, 1);
    assert_eq!(h.wire().borrow().closes.len(), 1);
    assert!(matches!(
        h.controller.last_end(),
        Some(SessionEnd::Failed(FatalError::TransportRuntime(_)))
    ));
}

#[test]
fn server_close_ends_session_without_banner() {
    let mut h = Harness::new();
    let id = h.start_open();
    h.deliver(id, TransportEvent::Closed, 100);

    assert_eq!(h.controller.last_end(), Some(&SessionEnd::ServerClosed));
    assert_eq!(h.controller.banner(), None);
    assert!(!h.controller.is_streaming());
    assert_eq!(h.camera.borrow().closes, 1);
    assert_eq!(h.wire().borrow().closes, vec![None]);
}

#[test]
fn messages_after_failure_are_not_processed() {
    let mut h = Harness::new();
    let id = h.start_open();
    h.deliver(id, TransportEvent::TransportError("reset".into()), 100);
    h.deliver(
        id,
        TransportEvent::MessageReceived(processed(8, 8, Some((5, 5, 10)))),
        110,
    );

    assert_eq!(h.controller.surface().presented(), 0);
    assert_eq!(h.controller.stats().total, 0);
    assert_eq!(h.controller.stale_events(), 1);
}

#[test]
fn events_from_previous_session_are_discarded() {
    let mut h = Harness::new();
    let first = h.start_open();
    h.controller.stop(h.at(100));
    let second = h.start(200);

    h.deliver(first, TransportEvent::Opened, 210);
    assert_eq!(h.controller.state(), SessionState::Connecting);
    h.deliver(first, TransportEvent::TransportError("late".into()), 220);
    assert!(h.controller.is_active());

    h.deliver(second, TransportEvent::Opened, 230);
    assert!(h.controller.is_streaming());
    assert_eq!(h.controller.stale_events(), 2);
}

// ----------------------------------------------------------------------------
// Event loop
// ----------------------------------------------------------------------------

#[test]
fn runner_processes_queued_events_until_stop() {
    let mut h = Harness::new();
    h.set_frame(Some(solid_frame(8, 8, 1)));
    let (tx, rx) = mpsc::channel();
    let camera = h.camera.clone();
    let mut controller = StreamController::new(
        PipelineSettings {
            pace_interval: SLOW_PACE,
            ..PipelineSettings::default()
        },
        Box::new(move || -> Result<Box<dyn CaptureSource>> {
            Ok(Box::new(FakeCamera(camera.clone())))
        }),
        Box::new(FakeConnector(h.dialer.clone())),
        MemorySurface::new(),
        tx.clone(),
    )
    .expect("controller");

    let id = match controller.start(Instant::now()).expect("start") {
        StartOutcome::Started(id) => id,
        other => panic!("unexpected {:?}", other),
    };
    tx.send(ControlEvent::Transport {
        session: id,
        event: TransportEvent::Opened,
    })
    .expect("queue opened");
    tx.send(ControlEvent::Transport {
        session: id,
        event: TransportEvent::MessageReceived(processed(4, 4, Some((1, 1, 2)))),
    })
    .expect("queue frame");
    tx.send(ControlEvent::Stop).expect("queue stop");

    let mut turns = 0;
    let exit = run(&mut controller, &rx, |_| turns += 1);

    assert_eq!(exit, RunExit::SessionEnded);
    assert_eq!(turns, 3);
    assert_eq!(controller.surface().presented(), 1);
    assert_eq!(controller.stats().total, 2);
    assert_eq!(controller.last_end(), Some(&SessionEnd::Stopped));
    let wire = h.wire();
    let wire = wire.borrow();
    assert_eq!(wire.sent.len(), 1);
    assert_eq!(wire.closes, vec![Some(r#"{"type":"close"}"#.to_string())]);
}
