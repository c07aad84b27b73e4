//! # Session Stream Controller
//!
//! Owns the one connection to the simulation server, classifies every inbound
//! frame and routes it to the playback queue or the view store.
//!
//! ## Connection lifecycle:
//! ```text
//! Disconnected ──connect──► Connecting ──open──► Open ──close/error──► Closed
//!        ▲                      │                                        │
//!        └────── open failed ───┘                  connect ◄─────────────┘
//! ```
//!
//! ## Start handshake:
//! `start_session` may be called before the socket is open. The start message is
//! then remembered as a pending intent and sent exactly once, at the moment the
//! connection opens.
//!
//! ## Generations:
//! Every connection attempt gets a new generation number. Callbacks from an
//! attempt that has since been superseded (by `disconnect` or a newer `connect`)
//! see a mismatched generation and leave state alone.
//!
//! ## Rust Concepts:
//! - **tokio::sync::Mutex**: Held across `.await` while the link is inspected and updated
//! - **Arc<Inner>**: The controller is a cheap handle; clones share one connection
//! - **Exhaustive match**: Adding a [`StreamEvent`] variant fails to compile until it is routed

use super::event::{parse_event, EventKind, StreamEvent};
use super::transport::{Connection, Frame, Transport, TransportError};
use crate::audio::PlaybackQueue;
use crate::view::{DiagnosisCandidate, QuestionCandidate, ViewLimits, ViewStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATUS_CONNECTING: &str = "Connecting to server...";
const STATUS_CONNECTED: &str = "Connected to secure server";
const STATUS_DISCONNECTED: &str = "Disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

/// Result of a `connect` call. Only `Started` creates a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    Started,
    AlreadyConnecting,
    AlreadyOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    /// The start message went out on the open connection
    Sent,
    /// This connection already started a session; nothing was sent
    AlreadyActive,
    /// Waiting for the connection to open
    Pending,
    /// The connection attempt failed before the message could be sent
    NotConnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub connection: ConnectOutcome,
    pub start: StartOutcome,
    pub audio_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_error: Option<String>,
}

/// Where to connect and what to send to begin the interview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub url: String,
    pub start_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub state: ConnectionState,
    pub connection_id: Option<Uuid>,
    pub pending_start: bool,
    pub connection_attempts: u64,
    pub starts_sent: u64,
    /// Parsed events per wire type
    pub events: BTreeMap<&'static str, u64>,
    pub malformed: u64,
    pub ignored_frames: u64,
}

#[derive(Debug, Default)]
struct StreamCounters {
    events: [AtomicU64; 5],
    malformed: AtomicU64,
    ignored_frames: AtomicU64,
    connection_attempts: AtomicU64,
    starts_sent: AtomicU64,
}

/// Mutable connection bookkeeping, always accessed under one lock.
struct Link {
    state: ConnectionState,
    generation: u64,
    connection_id: Option<Uuid>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending_start: bool,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    settings: RwLock<StreamSettings>,
    transport: Arc<dyn Transport>,
    playback: Arc<PlaybackQueue>,
    view: ViewStore,
    link: Mutex<Link>,
    counters: StreamCounters,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        settings: StreamSettings,
        transport: Arc<dyn Transport>,
        playback: Arc<PlaybackQueue>,
        view: ViewStore,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: RwLock::new(settings),
                transport,
                playback,
                view,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    connection_id: None,
                    outbound: None,
                    pending_start: false,
                    task: None,
                }),
                counters: StreamCounters::default(),
            }),
        }
    }

    pub fn view(&self) -> &ViewStore {
        &self.inner.view
    }

    pub fn playback(&self) -> &Arc<PlaybackQueue> {
        &self.inner.playback
    }

    pub fn settings(&self) -> StreamSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes effect on the next connection attempt.
    pub fn set_stream_settings(&self, settings: StreamSettings) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Takes effect on the next diagnosis or question snapshot.
    pub fn set_view_limits(&self, limits: ViewLimits) {
        self.inner.view.set_limits(limits);
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.link.lock().await.state
    }

    /// Open a connection unless one is already opening or open.
    ///
    /// Returns as soon as the attempt is underway; the open (or failure) is
    /// observed through [`state`](Self::state) and the view status.
    pub async fn connect(&self) -> ConnectOutcome {
        let generation = {
            let mut link = self.inner.link.lock().await;
            match link.state {
                ConnectionState::Connecting => return ConnectOutcome::AlreadyConnecting,
                ConnectionState::Open => return ConnectOutcome::AlreadyOpen,
                ConnectionState::Disconnected | ConnectionState::Closed => {}
            }
            link.state = ConnectionState::Connecting;
            link.generation += 1;
            link.generation
        };

        self.inner
            .counters
            .connection_attempts
            .fetch_add(1, Ordering::SeqCst);
        self.inner.view.set_status(STATUS_CONNECTING);

        let url = self.settings().url;
        info!(generation, url = %url, "Connecting to simulation server");

        let controller = self.clone();
        let handle = tokio::spawn(async move { controller.run_connection(generation, url).await });

        let mut link = self.inner.link.lock().await;
        if link.generation == generation {
            link.task = Some(handle);
        } else {
            // Superseded before the handle could be recorded
            handle.abort();
        }
        ConnectOutcome::Started
    }

    /// The user's start trigger.
    ///
    /// Ensures a connection attempt is underway, acquires the audio output, then
    /// sends the start message if the connection is open or leaves it pending
    /// until it is. Audio failure never blocks the start.
    ///
    /// The start message goes out at most once per connection: a repeat call on
    /// a session that is already running reports `AlreadyActive`.
    pub async fn start_session(&self) -> StartReport {
        let connection = self.connect().await;

        let (audio_ready, audio_error) = match self.inner.playback.init().await {
            Ok(_) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        };

        let mut link = self.inner.link.lock().await;
        let start = match link.state {
            ConnectionState::Open if self.inner.view.session_active() => {
                debug!(connection_id = ?link.connection_id, "Session already running, start not resent");
                StartOutcome::AlreadyActive
            }
            ConnectionState::Open => {
                if self.send_start(&mut link) {
                    StartOutcome::Sent
                } else {
                    StartOutcome::NotConnected
                }
            }
            ConnectionState::Connecting => {
                if !link.pending_start {
                    debug!("Connection not open yet, start message pending");
                }
                link.pending_start = true;
                StartOutcome::Pending
            }
            ConnectionState::Disconnected | ConnectionState::Closed => StartOutcome::NotConnected,
        };

        StartReport {
            connection,
            start,
            audio_ready,
            audio_error,
        }
    }

    /// Caller-initiated teardown. Returns `false` when there was nothing to close.
    ///
    /// Queued audio is left alone and keeps playing.
    pub async fn disconnect(&self) -> bool {
        let mut link = self.inner.link.lock().await;
        let live = matches!(
            link.state,
            ConnectionState::Connecting | ConnectionState::Open
        );
        if !live {
            return false;
        }

        link.generation += 1;
        if let Some(task) = link.task.take() {
            task.abort();
        }
        link.outbound = None;
        link.pending_start = false;
        link.state = ConnectionState::Closed;
        if let Some(id) = link.connection_id.take() {
            info!(connection_id = %id, "Connection closed by request");
        }
        self.inner.view.mark_disconnected(STATUS_DISCONNECTED);
        true
    }

    /// Classify one inbound text frame and apply it.
    ///
    /// Frames that do not parse into a [`StreamEvent`] are logged and counted
    /// and change nothing.
    pub fn handle_message(&self, raw: &str) {
        let event = match parse_event(raw) {
            Ok(event) => event,
            Err(err) => {
                self.inner.counters.malformed.fetch_add(1, Ordering::SeqCst);
                warn!(error = %err, "Ignoring unusable stream frame");
                return;
            }
        };
        self.inner.counters.events[event.kind() as usize].fetch_add(1, Ordering::SeqCst);

        let view = &self.inner.view;
        match event {
            StreamEvent::Audio { speaker, data } => {
                self.inner.playback.enqueue(&speaker, data);
            }
            StreamEvent::Transcript { speaker, text } => {
                let id = view.append_transcript(&speaker, &text);
                debug!(chat_id = id, speaker = %speaker, "Transcript line");
            }
            StreamEvent::Diagnosis { data } => {
                debug!(candidates = data.len(), "Diagnosis snapshot");
                view.replace_diagnoses(data.into_iter().map(DiagnosisCandidate::from).collect());
            }
            StreamEvent::Questions { data } => {
                debug!(candidates = data.len(), "Question snapshot");
                view.replace_questions(data.into_iter().map(QuestionCandidate::from).collect());
            }
            StreamEvent::System { message } => {
                info!(message = %message, "System notice");
                view.set_status(&message);
            }
        }
    }

    pub async fn stats(&self) -> StreamStats {
        let (state, connection_id, pending_start) = {
            let link = self.inner.link.lock().await;
            (link.state, link.connection_id, link.pending_start)
        };
        let counters = &self.inner.counters;

        StreamStats {
            state,
            connection_id,
            pending_start,
            connection_attempts: counters.connection_attempts.load(Ordering::SeqCst),
            starts_sent: counters.starts_sent.load(Ordering::SeqCst),
            events: EventKind::ALL
                .iter()
                .map(|kind| {
                    (
                        kind.as_str(),
                        counters.events[*kind as usize].load(Ordering::SeqCst),
                    )
                })
                .collect(),
            malformed: counters.malformed.load(Ordering::SeqCst),
            ignored_frames: counters.ignored_frames.load(Ordering::SeqCst),
        }
    }

    async fn run_connection(self, generation: u64, url: String) {
        let connection = match self.inner.transport.connect(&url).await {
            Ok(connection) => connection,
            Err(err) => {
                self.on_open_failed(generation, err).await;
                return;
            }
        };

        let Connection {
            id,
            outbound,
            mut inbound,
        } = connection;
        if !self.on_open(generation, id, outbound).await {
            debug!(connection_id = %id, "Dropping superseded connection");
            return;
        }

        // One frame at a time, in receipt order
        let failure = loop {
            match inbound.recv().await {
                Some(Ok(Frame::Text(text))) => self.handle_message(&text),
                Some(Ok(Frame::Binary(data))) => {
                    self.inner
                        .counters
                        .ignored_frames
                        .fetch_add(1, Ordering::SeqCst);
                    debug!(connection_id = %id, bytes = data.len(), "Ignoring binary frame");
                }
                Some(Err(err)) => break Some(err),
                None => break None,
            }
        };

        match failure {
            Some(err) => self.on_error(generation, err).await,
            None => self.on_close(generation).await,
        }
    }

    async fn on_open(
        &self,
        generation: u64,
        id: Uuid,
        outbound: mpsc::UnboundedSender<String>,
    ) -> bool {
        let mut link = self.inner.link.lock().await;
        if link.generation != generation || link.state != ConnectionState::Connecting {
            return false;
        }

        link.state = ConnectionState::Open;
        link.connection_id = Some(id);
        link.outbound = Some(outbound);
        self.inner.view.mark_connected(STATUS_CONNECTED);
        info!(connection_id = %id, "Connected to simulation server");

        if link.pending_start {
            link.pending_start = false;
            self.send_start(&mut link);
        }
        true
    }

    async fn on_open_failed(&self, generation: u64, err: TransportError) {
        let mut link = self.inner.link.lock().await;
        if link.generation != generation {
            return;
        }
        warn!(error = %err, "Could not connect to simulation server");
        link.state = ConnectionState::Disconnected;
        link.pending_start = false;
        link.task = None;
        self.inner
            .view
            .mark_disconnected(&format!("Connection failed: {}", err));
    }

    async fn on_close(&self, generation: u64) {
        let mut link = self.inner.link.lock().await;
        if link.generation != generation {
            return;
        }
        info!(connection_id = ?link.connection_id, "Connection closed");
        Self::release(&mut link);
        self.inner.view.mark_disconnected(STATUS_DISCONNECTED);
    }

    async fn on_error(&self, generation: u64, err: TransportError) {
        let mut link = self.inner.link.lock().await;
        if link.generation != generation {
            return;
        }
        warn!(connection_id = ?link.connection_id, error = %err, "Connection lost");
        Self::release(&mut link);
        self.inner
            .view
            .mark_disconnected(&format!("Connection lost: {}", err));
    }

    /// Forget the finished connection. The reader task is the caller, so its
    /// handle is dropped rather than aborted.
    fn release(link: &mut Link) {
        link.state = ConnectionState::Closed;
        link.connection_id = None;
        link.outbound = None;
        link.pending_start = false;
        link.task = None;
    }

    fn send_start(&self, link: &mut Link) -> bool {
        let message = self.settings().start_message;
        let sent = link
            .outbound
            .as_ref()
            .map(|tx| tx.send(message).is_ok())
            .unwrap_or(false);

        if sent {
            self.inner.counters.starts_sent.fetch_add(1, Ordering::SeqCst);
            self.inner.view.set_session_active(true);
            info!(connection_id = ?link.connection_id, "Start message sent");
        } else {
            warn!("Start message could not be sent, connection writer is gone");
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        AudioOutput, DecodedClip, DisabledOutput, OutputInfo, PayloadDecoder, PlaybackError,
        QueueState,
    };
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Server side of one fake connection.
    struct FakeServer {
        received: mpsc::UnboundedReceiver<String>,
        push: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    }

    struct FakeTransport {
        open_delay: Duration,
        refuse: bool,
        attempts: AtomicUsize,
        servers: std::sync::Mutex<Vec<FakeServer>>,
    }

    impl FakeTransport {
        fn new(open_delay_ms: u64) -> Self {
            Self {
                open_delay: Duration::from_millis(open_delay_ms),
                refuse: false,
                attempts: AtomicUsize::new(0),
                servers: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn take_server(&self) -> FakeServer {
            self.servers.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.open_delay).await;
            if self.refuse {
                return Err(TransportError::Connect {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.servers.lock().unwrap().push(FakeServer {
                received: out_rx,
                push: in_tx,
            });
            Ok(Connection {
                id: Uuid::new_v4(),
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    /// Plays each clip for a fixed time and records its first sample as an
    /// integer, so a unit built by `audio_frame(n)` is recorded as `n`.
    struct SlowOutput {
        clip_ms: u64,
        played: std::sync::Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl AudioOutput for SlowOutput {
        async fn acquire(&self) -> Result<OutputInfo, PlaybackError> {
            Ok(OutputInfo {
                device: "test".to_string(),
                sample_rate: 24000,
                channels: 1,
            })
        }

        async fn play(&self, clip: DecodedClip) -> Result<(), PlaybackError> {
            tokio::time::sleep(Duration::from_millis(self.clip_ms)).await;
            let value = (clip.samples[0] * 32768.0).round() as i64;
            self.played.lock().unwrap().push(value);
            Ok(())
        }
    }

    /// One audio event carrying a single PCM16 sample of value `n`.
    fn audio_frame(n: u8) -> String {
        format!(
            r#"{{"type":"audio","speaker":"PATIENT","data":"{}"}}"#,
            STANDARD.encode([n, 0])
        )
    }

    fn controller_with(transport: Arc<FakeTransport>) -> SessionController {
        controller_with_output(transport, Arc::new(DisabledOutput))
    }

    fn controller_with_output(
        transport: Arc<FakeTransport>,
        output: Arc<dyn AudioOutput>,
    ) -> SessionController {
        let playback = Arc::new(PlaybackQueue::spawn(
            Arc::new(PayloadDecoder::default()),
            output,
        ));
        SessionController::new(
            StreamSettings {
                url: "ws://simulation.test/ws".to_string(),
                start_message: "start".to_string(),
            },
            transport,
            playback,
            ViewStore::new(ViewLimits::default()),
        )
    }

    async fn wait_for_state(controller: &SessionController, expected: ConnectionState) {
        for _ in 0..400 {
            if controller.state().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller never reached {:?}", expected);
    }

    #[tokio::test]
    async fn test_back_to_back_connects_open_one_connection() {
        let transport = Arc::new(FakeTransport::new(20));
        let controller = controller_with(Arc::clone(&transport));

        assert_eq!(controller.connect().await, ConnectOutcome::Started);
        assert_eq!(controller.connect().await, ConnectOutcome::AlreadyConnecting);
        wait_for_state(&controller, ConnectionState::Open).await;
        assert_eq!(controller.connect().await, ConnectOutcome::AlreadyOpen);

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        let view = controller.view().snapshot();
        assert!(view.connected);
        assert_eq!(view.status, STATUS_CONNECTED);
    }

    #[tokio::test]
    async fn test_start_before_open_is_sent_once_on_open() {
        let transport = Arc::new(FakeTransport::new(30));
        let controller = controller_with(Arc::clone(&transport));

        let report = controller.start_session().await;
        assert_eq!(report.connection, ConnectOutcome::Started);
        assert_eq!(report.start, StartOutcome::Pending);
        assert!(!report.audio_ready);
        assert!(report.audio_error.is_some());

        // A second click while still connecting must not queue a second start
        let again = controller.start_session().await;
        assert_eq!(again.start, StartOutcome::Pending);

        wait_for_state(&controller, ConnectionState::Open).await;
        let mut server = transport.take_server();
        assert_eq!(server.received.recv().await.as_deref(), Some("start"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(server.received.try_recv().is_err());

        assert!(controller.view().snapshot().session_active);
        assert_eq!(controller.stats().await.starts_sent, 1);
    }

    #[tokio::test]
    async fn test_start_on_open_connection_sends_immediately() {
        let transport = Arc::new(FakeTransport::new(0));
        let controller = controller_with(Arc::clone(&transport));
        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;

        let report = controller.start_session().await;
        assert_eq!(report.connection, ConnectOutcome::AlreadyOpen);
        assert_eq!(report.start, StartOutcome::Sent);

        let mut server = transport.take_server();
        assert_eq!(server.received.recv().await.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn test_repeat_start_on_running_session_sends_nothing() {
        let transport = Arc::new(FakeTransport::new(0));
        let controller = controller_with(Arc::clone(&transport));
        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;

        assert_eq!(controller.start_session().await.start, StartOutcome::Sent);
        assert_eq!(
            controller.start_session().await.start,
            StartOutcome::AlreadyActive
        );

        let mut server = transport.take_server();
        assert_eq!(server.received.recv().await.as_deref(), Some("start"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(server.received.try_recv().is_err());
        assert_eq!(controller.stats().await.starts_sent, 1);
    }

    #[tokio::test]
    async fn test_new_connection_can_start_again() {
        let transport = Arc::new(FakeTransport::new(0));
        let controller = controller_with(Arc::clone(&transport));
        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;
        assert_eq!(controller.start_session().await.start, StartOutcome::Sent);

        controller.disconnect().await;
        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;
        assert_eq!(controller.start_session().await.start, StartOutcome::Sent);
        assert_eq!(controller.stats().await.starts_sent, 2);
    }

    #[tokio::test]
    async fn test_events_route_to_their_views() {
        let controller = controller_with(Arc::new(FakeTransport::new(0)));

        controller.handle_message(r#"{"type":"transcript","speaker":"NURSE","text":"Where does it hurt?"}"#);
        controller.handle_message(r#"{"type":"system","message":"Patient is thinking"}"#);
        controller.handle_message(
            r#"{"type":"diagnosis","data":[
                {"did":"D1","diagnosis":"Gallstones","probability":"Low","indicators_count":1},
                {"did":"D2","diagnosis":"Hepatitis B","probability":"High","indicators_count":5}
            ]}"#,
        );
        controller.handle_message(
            r#"{"type":"questions","data":[
                {"qid":"Q1","content":"Any recent travel?","rank":2},
                {"qid":"Q2","content":"Do you drink alcohol?","rank":1,"status":"deleted"}
            ]}"#,
        );
        controller.handle_message(r#"{"type":"audio","speaker":"PATIENT","data":"AAAA"}"#);

        let view = controller.view().snapshot();
        assert_eq!(view.chat.len(), 1);
        assert_eq!(view.chat[0].speaker, "NURSE");
        assert_eq!(view.status, "Patient is thinking");
        assert_eq!(view.diagnoses[0].id, "D2");
        assert_eq!(view.active_questions.len(), 1);
        assert_eq!(view.asked_questions[0].id, "Q2");

        // No output acquired yet, so the unit waits in the backlog
        let playback = controller.playback().status();
        assert_eq!(playback.state, QueueState::Draining);

        let stats = controller.stats().await;
        assert_eq!(stats.events["transcript"], 1);
        assert_eq!(stats.events["audio"], 1);
        assert_eq!(stats.malformed, 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_leave_view_untouched() {
        let controller = controller_with(Arc::new(FakeTransport::new(0)));
        controller.handle_message(r#"{"type":"transcript","speaker":"PATIENT","text":"I feel tired"}"#);
        let before = controller.view().snapshot();

        controller.handle_message("{not json");
        controller.handle_message(r#"{"type":"heartbeat","seq":4}"#);
        controller.handle_message(r#"{"type":"diagnosis","data":"oops"}"#);
        controller.handle_message(r#"{"speaker":"NURSE"}"#);

        let after = controller.view().snapshot();
        assert_eq!(before, after);
        assert_eq!(
            serde_json::to_string(&before).unwrap(),
            serde_json::to_string(&after).unwrap()
        );
        assert_eq!(controller.stats().await.malformed, 4);
    }

    #[tokio::test]
    async fn test_server_close_clears_flags() {
        let transport = Arc::new(FakeTransport::new(0));
        let controller = controller_with(Arc::clone(&transport));
        controller.start_session().await;
        wait_for_state(&controller, ConnectionState::Open).await;
        assert!(controller.view().snapshot().session_active);

        drop(transport.take_server());
        wait_for_state(&controller, ConnectionState::Closed).await;

        let view = controller.view().snapshot();
        assert!(!view.connected);
        assert!(!view.session_active);
        assert_eq!(view.status, STATUS_DISCONNECTED);
    }

    #[tokio::test]
    async fn test_transport_error_reports_connection_lost() {
        let transport = Arc::new(FakeTransport::new(0));
        let controller = controller_with(Arc::clone(&transport));
        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;

        let server = transport.take_server();
        server
            .push
            .send(Err(TransportError::Receive("connection reset".to_string())))
            .unwrap();
        wait_for_state(&controller, ConnectionState::Closed).await;

        let status = controller.view().snapshot().status;
        assert!(status.starts_with("Connection lost"), "status was {}", status);
    }

    #[tokio::test]
    async fn test_frames_from_server_are_processed_in_order() {
        let transport = Arc::new(FakeTransport::new(0));
        let controller = controller_with(Arc::clone(&transport));
        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;

        let server = transport.take_server();
        for n in 0..20 {
            let frame = format!(r#"{{"type":"transcript","speaker":"PATIENT","text":"line {}"}}"#, n);
            server.push.send(Ok(Frame::Text(frame))).unwrap();
        }
        server.push.send(Ok(Frame::Binary(vec![1, 2, 3]))).unwrap();

        for _ in 0..200 {
            if controller.stats().await.ignored_frames == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let texts: Vec<String> = controller
            .view()
            .snapshot()
            .chat
            .into_iter()
            .map(|entry| entry.text)
            .collect();
        let expected: Vec<String> = (0..20).map(|n| format!("line {}", n)).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn test_failed_open_returns_to_disconnected() {
        let transport = Arc::new(FakeTransport {
            refuse: true,
            ..FakeTransport::new(0)
        });
        let controller = controller_with(Arc::clone(&transport));

        let report = controller.start_session().await;
        assert_eq!(report.connection, ConnectOutcome::Started);
        for _ in 0..200 {
            if controller.view().snapshot().status.starts_with("Connection failed") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(controller.state().await, ConnectionState::Disconnected);
        let view = controller.view().snapshot();
        assert!(view.status.starts_with("Connection failed"));
        assert!(!view.session_active);
        assert_eq!(controller.stats().await.starts_sent, 0);
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let transport = Arc::new(FakeTransport::new(0));
        let controller = controller_with(Arc::clone(&transport));
        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;

        assert!(controller.disconnect().await);
        assert!(!controller.disconnect().await);
        assert_eq!(controller.state().await, ConnectionState::Closed);

        let mut first = transport.take_server();
        assert_eq!(first.received.recv().await, None);

        assert_eq!(controller.connect().await, ConnectOutcome::Started);
        wait_for_state(&controller, ConnectionState::Open).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
        assert!(controller.view().snapshot().connected);
    }

    /// Open a session, push four audio units from the server and wait until
    /// all four are in the playback queue.
    async fn session_with_queued_audio(
        transport: &Arc<FakeTransport>,
        output: &Arc<SlowOutput>,
    ) -> (SessionController, FakeServer) {
        let controller = controller_with_output(
            Arc::clone(transport),
            Arc::clone(output) as Arc<dyn AudioOutput>,
        );
        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;
        assert!(controller.start_session().await.audio_ready);

        let server = transport.take_server();
        for n in 1..=4 {
            server.push.send(Ok(Frame::Text(audio_frame(n)))).unwrap();
        }
        for _ in 0..200 {
            if controller.stats().await.events["audio"] == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(controller.stats().await.events["audio"], 4);
        (controller, server)
    }

    async fn wait_played(controller: &SessionController, count: u64) {
        for _ in 0..400 {
            let status = controller.playback().status();
            if status.played >= count && status.state == QueueState::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("playback stalled: {:?}", controller.playback().status());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_queued_audio_playing() {
        let transport = Arc::new(FakeTransport::new(0));
        let output = Arc::new(SlowOutput {
            clip_ms: 25,
            played: std::sync::Mutex::new(Vec::new()),
        });
        let (controller, _server) = session_with_queued_audio(&transport, &output).await;

        assert!(controller.disconnect().await);
        let status = controller.playback().status();
        assert_eq!(status.state, QueueState::Draining);
        assert!(status.played < 4);

        wait_played(&controller, 4).await;
        assert_eq!(*output.played.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(controller.playback().status().failed, 0);
    }

    #[tokio::test]
    async fn test_server_close_leaves_queued_audio_playing() {
        let transport = Arc::new(FakeTransport::new(0));
        let output = Arc::new(SlowOutput {
            clip_ms: 25,
            played: std::sync::Mutex::new(Vec::new()),
        });
        let (controller, server) = session_with_queued_audio(&transport, &output).await;

        drop(server);
        wait_for_state(&controller, ConnectionState::Closed).await;
        assert_eq!(controller.playback().state(), QueueState::Draining);

        wait_played(&controller, 4).await;
        assert_eq!(*output.played.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_settings_apply_to_next_connection() {
        let transport = Arc::new(FakeTransport::new(0));
        let controller = controller_with(Arc::clone(&transport));
        controller.set_stream_settings(StreamSettings {
            url: "ws://other.test/ws".to_string(),
            start_message: "begin".to_string(),
        });

        controller.connect().await;
        wait_for_state(&controller, ConnectionState::Open).await;
        controller.start_session().await;

        let mut server = transport.take_server();
        assert_eq!(server.received.recv().await.as_deref(), Some("begin"));
    }
}
