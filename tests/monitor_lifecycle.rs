//! End-to-end monitor lifecycle over a scripted transport.
//!
//! These tests verify that:
//! 1. Realtime update frames turn into deduplicated event deliveries
//! 2. Dropped connections reconnect; repeated failures escalate to one
//!    reauth request
//! 3. The monitor degrades to polling when the channel cannot be held
//! 4. Startup and shutdown edge cases behave

use biowatch::{
    backoff_delay, AccessResult, AttendanceEvent, AuthContext, Credentials, CredentialsHint,
    EventSink, InstanceId, Monitor, MonitorConfig, MonitorError, MonitorStatus, Result,
    SessionProvider, SnapshotSource, SubscriptionToken, Transport, WireEvent, WireSocket,
};
use chrono::{TimeZone, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const UPDATE_FRAME: &str = r#"{"M":[{"H":"BioHub","M":"update","A":[]}]}"#;

// =============================================================================
// SCRIPTED COLLABORATORS
// =============================================================================

struct FakeWire {
    incoming: Receiver<WireEvent>,
    sent: Sender<String>,
}

impl WireSocket for FakeWire {
    fn send(&mut self, frame: &str) -> Result<()> {
        let _ = self.sent.send(frame.to_string());
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<WireEvent>> {
        match self.incoming.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(MonitorError::Transport("wire gone".to_string()))
            }
        }
    }

    fn close(&mut self) {}
}

/// Scripted transport: each `open` consumes the next entry; `None` entries
/// fail the open. Every negotiation mints a distinct token and every open
/// records the token it was given, so tests can tell the cheap reconnect
/// path (token reuse) from a renegotiation.
struct FakeTransport {
    sockets: Mutex<VecDeque<Option<FakeWire>>>,
    negotiate_ok: bool,
    negotiates: AtomicUsize,
    opens: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn new(negotiate_ok: bool) -> Self {
        Self {
            sockets: Mutex::new(VecDeque::new()),
            negotiate_ok,
            negotiates: AtomicUsize::new(0),
            opens: Mutex::new(Vec::new()),
        }
    }

    /// Queue a working socket; returns the sender feeding its inbound side.
    fn push_socket(&self) -> Sender<WireEvent> {
        let (wire_tx, wire_rx) = unbounded();
        let (sent_tx, _sent_rx) = unbounded();
        self.sockets.lock().push_back(Some(FakeWire {
            incoming: wire_rx,
            sent: sent_tx,
        }));
        wire_tx
    }

    fn push_failure(&self) {
        self.sockets.lock().push_back(None);
    }
}

impl Transport for FakeTransport {
    fn negotiate(&self, _auth: &AuthContext) -> Result<SubscriptionToken> {
        let n = self.negotiates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.negotiate_ok {
            Ok(SubscriptionToken::new(format!("token-{n}")))
        } else {
            Err(MonitorError::Negotiation("endpoint down".to_string()))
        }
    }

    fn open(
        &self,
        _auth: &AuthContext,
        token: &SubscriptionToken,
        _timeout: Duration,
    ) -> Result<Box<dyn WireSocket>> {
        self.opens.lock().push(token.as_str().to_string());
        match self.sockets.lock().pop_front() {
            Some(Some(wire)) => Ok(Box::new(wire)),
            _ => Err(MonitorError::Transport("open refused".to_string())),
        }
    }
}

struct CountingSession {
    logins: Arc<AtomicUsize>,
}

impl SessionProvider for CountingSession {
    fn login(&mut self, _credentials: &Credentials) -> Result<AuthContext> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(AuthContext::new("https://example.test").with_cookie("ASP.NET_SessionId", "abc"))
    }
}

struct FailingSession;

impl SessionProvider for FailingSession {
    fn login(&mut self, _credentials: &Credentials) -> Result<AuthContext> {
        Err(MonitorError::AuthFailed("bad credentials".to_string()))
    }
}

/// Snapshot source backed by a shared, test-mutable event list. Flipping
/// `expired` makes every fetch fail like a rejected session.
struct SharedSource {
    events: Arc<Mutex<Vec<AttendanceEvent>>>,
    expired: Arc<AtomicBool>,
}

impl SnapshotSource for SharedSource {
    fn fetch_snapshot(&mut self, _auth: &AuthContext) -> Result<Vec<AttendanceEvent>> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(MonitorError::AuthExpired);
        }
        Ok(self.events.lock().clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AttendanceEvent>>,
    reauths: Mutex<Vec<InstanceId>>,
    terminals: Mutex<Vec<String>>,
}

impl EventSink for RecordingSink {
    fn on_new_events(&self, events: &[AttendanceEvent]) {
        self.events.lock().extend_from_slice(events);
    }

    fn on_reauth_required(&self, instance: InstanceId, _hint: &CredentialsHint) {
        self.reauths.lock().push(instance);
    }

    fn on_terminal_failure(&self, error: &MonitorError) {
        self.terminals.lock().push(error.to_string());
    }
}

// =============================================================================
// HARNESS
// =============================================================================

fn event(millis: i64) -> AttendanceEvent {
    AttendanceEvent {
        timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
        employee_id: "20-1234".to_string(),
        employee_name: "Test User".to_string(),
        temperature: Some(36.6),
        device_id: "GATE-1".to_string(),
        result: AccessResult::Granted,
    }
}

fn test_config(dir: &TempDir) -> MonitorConfig {
    MonitorConfig {
        state_dir: dir.path().to_path_buf(),
        // Keep reconnect delays short; the cap bounds every attempt.
        max_backoff: Duration::from_millis(50),
        open_timeout: Duration::from_millis(500),
        idle_threshold: Duration::from_secs(30),
        ping_after: Duration::from_secs(20),
        keepalive_tick: Duration::from_millis(100),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn credentials() -> Credentials {
    Credentials {
        employee_id: "20-1234".to_string(),
        password: "pw".to_string(),
    }
}

struct Harness {
    monitor: Monitor,
    transport: Arc<FakeTransport>,
    source_events: Arc<Mutex<Vec<AttendanceEvent>>>,
    source_expired: Arc<AtomicBool>,
    sink: Arc<RecordingSink>,
    logins: Arc<AtomicUsize>,
    _dir: TempDir,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn harness_in(dir: TempDir, negotiate_ok: bool) -> Harness {
    init_tracing();
    let transport = Arc::new(FakeTransport::new(negotiate_ok));
    let source_events = Arc::new(Mutex::new(Vec::new()));
    let source_expired = Arc::new(AtomicBool::new(false));
    let sink = Arc::new(RecordingSink::default());
    let logins = Arc::new(AtomicUsize::new(0));

    let monitor = Monitor::with_transport(
        test_config(&dir),
        transport.clone(),
        Box::new(CountingSession {
            logins: Arc::clone(&logins),
        }),
        Box::new(SharedSource {
            events: Arc::clone(&source_events),
            expired: Arc::clone(&source_expired),
        }),
        sink.clone(),
    );

    Harness {
        monitor,
        transport,
        source_events,
        source_expired,
        sink,
        logins,
        _dir: dir,
    }
}

fn harness(negotiate_ok: bool) -> Harness {
    harness_in(TempDir::new().unwrap(), negotiate_ok)
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// REALTIME DELIVERY
// =============================================================================

#[test]
fn test_update_frame_delivers_new_events() {
    let mut h = harness(true);
    h.source_events.lock().push(event(1_000));
    let wire = h.transport.push_socket();

    h.monitor.start(credentials()).unwrap();
    wait_for("connection", || h.monitor.status() == MonitorStatus::Connected);
    // The catch-up refresh on open delivers the backlog.
    wait_for("backlog delivery", || h.sink.events.lock().len() == 1);

    h.source_events.lock().push(event(2_000));
    wire.send(WireEvent::Text(UPDATE_FRAME.to_string())).unwrap();
    wait_for("realtime delivery", || h.sink.events.lock().len() == 2);

    assert_eq!(h.sink.events.lock().clone(), vec![event(1_000), event(2_000)]);
    assert!(h.sink.reauths.lock().is_empty());
    assert!(h.sink.terminals.lock().is_empty());
    h.monitor.stop();
    assert_eq!(h.monitor.status(), MonitorStatus::Stopped);
}

#[test]
fn test_update_frame_with_no_change_delivers_nothing() {
    let mut h = harness(true);
    h.source_events.lock().push(event(1_000));
    let wire = h.transport.push_socket();

    h.monitor.start(credentials()).unwrap();
    wait_for("backlog delivery", || h.sink.events.lock().len() == 1);

    // Same snapshot announced again.
    wire.send(WireEvent::Text(UPDATE_FRAME.to_string())).unwrap();
    wire.send(WireEvent::Text(UPDATE_FRAME.to_string())).unwrap();
    thread::sleep(Duration::from_millis(300));

    assert_eq!(h.sink.events.lock().len(), 1);
    h.monitor.stop();
}

#[test]
fn test_restart_does_not_replay_old_events() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let run = |events: Vec<AttendanceEvent>| -> Vec<AttendanceEvent> {
        let transport = Arc::new(FakeTransport::new(true));
        let sink = Arc::new(RecordingSink::default());
        let mut monitor = Monitor::with_transport(
            test_config(&dir),
            transport.clone(),
            Box::new(CountingSession {
                logins: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(SharedSource {
                events: Arc::new(Mutex::new(events)),
                expired: Arc::new(AtomicBool::new(false)),
            }),
            sink.clone(),
        );
        let _wire = transport.push_socket();
        monitor.start(credentials()).unwrap();
        wait_for("connection", || monitor.status() == MonitorStatus::Connected);
        // Give the catch-up refresh time to land before stopping.
        thread::sleep(Duration::from_millis(300));
        monitor.stop();
        let delivered = sink.events.lock().clone();
        delivered
    };

    let first = run(vec![event(1_000), event(2_000)]);
    assert_eq!(first, vec![event(1_000), event(2_000)]);

    // Same snapshot plus one new scan: only the new scan is reported.
    let second = run(vec![event(1_000), event(2_000), event(3_000)]);
    assert_eq!(second, vec![event(3_000)]);
}

// =============================================================================
// RECONNECTION
// =============================================================================

#[test]
fn test_dropped_connection_reconnects_without_reauth() {
    let mut h = harness(true);
    let wire = h.transport.push_socket();

    h.monitor.start(credentials()).unwrap();
    wait_for("connection", || h.monitor.status() == MonitorStatus::Connected);

    // Queue the replacement, then kill the live wire.
    let wire2 = h.transport.push_socket();
    h.source_events.lock().push(event(1_000));
    drop(wire);

    wire2.send(WireEvent::Text(UPDATE_FRAME.to_string())).unwrap();
    wait_for("delivery after reconnect", || h.sink.events.lock().len() == 1);

    assert_eq!(h.logins.load(Ordering::SeqCst), 1);
    assert!(h.sink.reauths.lock().is_empty());
    // The cheap reconnect reuses the token from startup; no renegotiation.
    assert_eq!(h.transport.negotiates.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.transport.opens.lock().clone(),
        vec!["token-1".to_string(), "token-1".to_string()]
    );
    h.monitor.stop();
}

#[test]
fn test_second_consecutive_failure_requests_reauth_once() {
    let mut h = harness(true);
    let wire = h.transport.push_socket();

    h.monitor.start(credentials()).unwrap();
    wait_for("connection", || h.monitor.status() == MonitorStatus::Connected);

    // First failure: the wire dies. Second: the reconnect open is refused.
    // That pair escalates to a full reauth, which gets the third socket.
    h.transport.push_failure();
    let wire3 = h.transport.push_socket();
    drop(wire);

    wait_for("reauth request", || h.sink.reauths.lock().len() == 1);
    wait_for("second login", || h.logins.load(Ordering::SeqCst) == 2);
    wait_for("reconnection", || h.monitor.status() == MonitorStatus::Connected);

    // Still exactly one reauth request, and the new channel works. The
    // refused open reused the startup token; only the reauth negotiated.
    assert_eq!(h.sink.reauths.lock().len(), 1);
    assert_eq!(h.transport.negotiates.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.transport.opens.lock().clone(),
        vec![
            "token-1".to_string(),
            "token-1".to_string(),
            "token-2".to_string(),
        ]
    );
    h.source_events.lock().push(event(1_000));
    wire3.send(WireEvent::Text(UPDATE_FRAME.to_string())).unwrap();
    wait_for("delivery after reauth", || h.sink.events.lock().len() == 1);
    h.monitor.stop();
}

// =============================================================================
// POLLING FALLBACK
// =============================================================================

#[test]
fn test_negotiation_failure_falls_back_to_polling() {
    let mut h = harness(false);
    h.monitor.start(credentials()).unwrap();
    wait_for("polling fallback", || {
        h.monitor.status() == MonitorStatus::PollingActive
    });

    h.source_events.lock().push(event(1_000));
    wait_for("polled delivery", || h.sink.events.lock().len() == 1);

    h.source_events.lock().push(event(2_000));
    wait_for("second polled delivery", || h.sink.events.lock().len() == 2);
    h.monitor.stop();
}

#[test]
fn test_polling_session_expiry_triggers_relogin_and_recovers() {
    let mut h = harness(false);
    h.monitor.start(credentials()).unwrap();
    wait_for("polling fallback", || {
        h.monitor.status() == MonitorStatus::PollingActive
    });
    h.source_events.lock().push(event(1_000));
    wait_for("polled delivery", || h.sink.events.lock().len() == 1);
    assert_eq!(h.logins.load(Ordering::SeqCst), 1);

    // The backend starts rejecting the session mid-poll; the loop must not
    // keep fetching against it, it must hand the failure back for a fresh
    // login.
    h.source_expired.store(true, Ordering::SeqCst);
    wait_for("relogin after poll rejection", || {
        h.logins.load(Ordering::SeqCst) >= 2
    });

    // Once the refreshed session holds, polling resumes delivering.
    h.source_expired.store(false, Ordering::SeqCst);
    wait_for("polling resumes", || {
        h.monitor.status() == MonitorStatus::PollingActive
    });
    h.source_events.lock().push(event(2_000));
    wait_for("delivery after relogin", || h.sink.events.lock().len() == 2);
    h.monitor.stop();
}

#[test]
fn test_exhausted_reconnects_report_terminal_and_poll() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(FakeTransport::new(true));
    let source_events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(RecordingSink::default());
    let logins = Arc::new(AtomicUsize::new(0));

    let mut config = test_config(&dir);
    config.max_reconnect_attempts = 2;

    let mut monitor = Monitor::with_transport(
        config,
        transport.clone(),
        Box::new(CountingSession {
            logins: Arc::clone(&logins),
        }),
        Box::new(SharedSource {
            events: Arc::clone(&source_events),
            expired: Arc::new(AtomicBool::new(false)),
        }),
        sink.clone(),
    );

    let wire = transport.push_socket();
    monitor.start(credentials()).unwrap();
    wait_for("connection", || monitor.status() == MonitorStatus::Connected);

    // Every reconnect open is refused from here on.
    drop(wire);
    wait_for("terminal failure", || sink.terminals.lock().len() == 1);
    wait_for("polling fallback", || {
        monitor.status() == MonitorStatus::PollingActive
    });

    // Terminal is reported once, and polling still delivers.
    source_events.lock().push(event(1_000));
    wait_for("polled delivery", || sink.events.lock().len() == 1);
    assert_eq!(sink.terminals.lock().len(), 1);
    monitor.stop();
}

// =============================================================================
// STARTUP AND SHUTDOWN EDGES
// =============================================================================

#[test]
fn test_login_failure_is_terminal() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let mut monitor = Monitor::with_transport(
        test_config(&dir),
        Arc::new(FakeTransport::new(true)),
        Box::new(FailingSession),
        Box::new(SharedSource {
            events: Arc::new(Mutex::new(Vec::new())),
            expired: Arc::new(AtomicBool::new(false)),
        }),
        sink.clone(),
    );

    monitor.start(credentials()).unwrap();
    wait_for("terminal failure", || sink.terminals.lock().len() == 1);
    wait_for("stopped", || monitor.status() == MonitorStatus::Stopped);
    assert!(sink.terminals.lock()[0].contains("bad credentials"));
}

#[test]
fn test_stop_is_idempotent_and_restart_is_rejected() {
    let mut h = harness(true);
    h.transport.push_socket();
    h.monitor.start(credentials()).unwrap();
    wait_for("connection", || h.monitor.status() == MonitorStatus::Connected);

    h.monitor.stop();
    h.monitor.stop();
    assert_eq!(h.monitor.status(), MonitorStatus::Stopped);

    let err = h.monitor.start(credentials()).unwrap_err();
    assert!(matches!(err, MonitorError::InvalidState(_)));
}

#[test]
fn test_concurrent_state_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut first = harness_in(dir, true);
    first.transport.push_socket();
    first.monitor.start(credentials()).unwrap();
    wait_for("connection", || {
        first.monitor.status() == MonitorStatus::Connected
    });

    // A second monitor for the same employee in the same state dir must
    // fail fast on the file lock.
    let transport = Arc::new(FakeTransport::new(true));
    let mut second = Monitor::with_transport(
        test_config(&first._dir),
        transport,
        Box::new(CountingSession {
            logins: Arc::new(AtomicUsize::new(0)),
        }),
        Box::new(SharedSource {
            events: Arc::new(Mutex::new(Vec::new())),
            expired: Arc::new(AtomicBool::new(false)),
        }),
        Arc::new(RecordingSink::default()),
    );
    let err = second.start(credentials()).unwrap_err();
    assert!(matches!(err, MonitorError::Locked));
    first.monitor.stop();
}

// =============================================================================
// BACKOFF
// =============================================================================

proptest! {
    #[test]
    fn prop_backoff_is_monotonic_and_capped(
        max_secs in 1u64..300,
        attempt in 1u32..64,
    ) {
        let max = Duration::from_secs(max_secs);
        let delay = backoff_delay(attempt, max);
        prop_assert!(delay <= max);
        prop_assert!(delay >= Duration::from_secs(2).min(max));
        prop_assert!(delay <= backoff_delay(attempt + 1, max));
    }
}

#[test]
fn test_first_retry_waits_two_seconds() {
    assert_eq!(
        backoff_delay(1, Duration::from_secs(30)),
        Duration::from_secs(2)
    );
}
