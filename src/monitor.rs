//! Monitor facade: configuration, the event sink, and the lifecycle of the
//! supervisor thread.

use crate::channel::transport::{SignalrTransport, Transport};
use crate::channel::{ChannelSignal, InstanceId};
use crate::detector;
use crate::error::{MonitorError, Result};
use crate::session::{AuthContext, Credentials, CredentialsHint, SessionProvider, SnapshotSource};
use crate::store::FingerprintStore;
use crate::supervisor::{Control, Supervisor, SupervisorContext};
use crate::types::AttendanceEvent;
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

/// Monitor tuning. The defaults match the backend's observed behavior;
/// most deployments only set `state_dir`.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Hub carrying attendance change notifications.
    pub hub: String,
    /// Method name announcing a change.
    pub method: String,
    /// Directory for the per-employee fingerprint state file.
    pub state_dir: PathBuf,
    /// Reconnect attempts before giving up on the realtime channel.
    pub max_reconnect_attempts: u32,
    /// Cap on the exponential reconnect delay.
    pub max_backoff: Duration,
    /// Bound on one channel open handshake.
    pub open_timeout: Duration,
    /// Force-close the channel when no frame arrives for this long.
    pub idle_threshold: Duration,
    /// Ping once the channel is idle for this long.
    pub ping_after: Duration,
    /// Keep-alive wake-up interval.
    pub keepalive_tick: Duration,
    /// Poll interval for the degraded fallback.
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            hub: "BioHub".to_string(),
            method: "update".to_string(),
            state_dir: PathBuf::from("."),
            max_reconnect_attempts: 10,
            max_backoff: Duration::from_secs(30),
            open_timeout: Duration::from_secs(20),
            idle_threshold: Duration::from_secs(120),
            ping_after: Duration::from_secs(60),
            keepalive_tick: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Where the monitor is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorStatus {
    /// Constructed, or cleanly disconnected with nothing scheduled.
    Idle,
    /// Logging in, opening, or waiting out a reconnect delay.
    Connecting,
    /// Realtime channel open.
    Connected,
    /// Realtime channel given up; interval polling is running.
    PollingActive,
    Stopped,
}

/// Consumer callbacks. Called from monitor-owned threads; implementations
/// should hand work off rather than block.
pub trait EventSink: Send + Sync {
    /// Genuinely new events, in snapshot order, already deduplicated
    /// against the persisted fingerprint set.
    fn on_new_events(&self, events: &[AttendanceEvent]);

    /// The session looks dead and a fresh login is about to happen. Emitted
    /// at most once per channel instance.
    fn on_reauth_required(&self, _instance: InstanceId, _hint: &CredentialsHint) {}

    /// Realtime recovery has been abandoned (or startup failed outright).
    /// Polling may still be running.
    fn on_terminal_failure(&self, _error: &MonitorError) {}
}

/// Fetch, diff, persist, notify. Shared between the supervisor (refresh
/// signals) and the polling fallback, serialized by the mutex around it.
pub struct Pipeline {
    source: Box<dyn SnapshotSource>,
    store: FingerprintStore,
    sink: Arc<dyn EventSink>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn SnapshotSource>,
        store: FingerprintStore,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            source,
            store,
            sink,
        }
    }

    /// Re-fetch the snapshot and report anything not seen before. Returns
    /// the number of new events. The stored set is replaced wholesale, so a
    /// second refresh of the same snapshot reports nothing.
    pub fn refresh(&mut self, auth: &AuthContext) -> Result<usize> {
        let snapshot = self.source.fetch_snapshot(auth)?;
        let changes = detector::detect(&snapshot, self.store.known());

        if !changes.missing.is_empty() {
            warn!(
                missing = changes.missing.len(),
                total = changes.total_current,
                "previously seen events vanished upstream"
            );
        }
        if !changes.new_events.is_empty() {
            self.sink.on_new_events(&changes.new_events);
        }
        let new_count = changes.new_events.len();
        self.store.replace(changes.snapshot_fingerprints)?;
        Ok(new_count)
    }
}

/// The monitoring engine. Owns the supervisor thread; everything else hangs
/// off it.
pub struct Monitor {
    config: MonitorConfig,
    transport: Arc<dyn Transport>,
    session: Option<Box<dyn SessionProvider>>,
    source: Option<Box<dyn SnapshotSource>>,
    sink: Arc<dyn EventSink>,
    status: Arc<Mutex<MonitorStatus>>,
    control: Option<Sender<Control>>,
    thread: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Monitor over the real wire transport.
    pub fn new(
        config: MonitorConfig,
        session: Box<dyn SessionProvider>,
        source: Box<dyn SnapshotSource>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let transport = Arc::new(SignalrTransport::new(config.hub.clone())?);
        Ok(Self::with_transport(config, transport, session, source, sink))
    }

    /// Monitor over a caller-supplied transport.
    pub fn with_transport(
        config: MonitorConfig,
        transport: Arc<dyn Transport>,
        session: Box<dyn SessionProvider>,
        source: Box<dyn SnapshotSource>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            transport,
            session: Some(session),
            source: Some(source),
            sink,
            status: Arc::new(Mutex::new(MonitorStatus::Idle)),
            control: None,
            thread: None,
        }
    }

    /// Log in and bring the realtime channel up, in the background. Returns
    /// once the supervisor thread is running; connection progress is
    /// visible through [`Monitor::status`] and the sink.
    pub fn start(&mut self, credentials: Credentials) -> Result<()> {
        if self.thread.is_some() {
            return Err(MonitorError::InvalidState(
                "monitor already started".to_string(),
            ));
        }
        let session = self.session.take().ok_or_else(|| {
            MonitorError::InvalidState("monitor cannot be restarted".to_string())
        })?;
        let source = self.source.take().ok_or_else(|| {
            MonitorError::InvalidState("monitor cannot be restarted".to_string())
        })?;

        let store = FingerprintStore::open(self.state_path(&credentials.employee_id))?;
        let pipeline = Arc::new(Mutex::new(Pipeline::new(
            source,
            store,
            Arc::clone(&self.sink),
        )));

        let (signal_tx, signals) = bounded::<ChannelSignal>(64);
        let (control_tx, control) = bounded::<Control>(4);

        let supervisor = Supervisor::new(SupervisorContext {
            config: self.config.clone(),
            credentials,
            session,
            transport: Arc::clone(&self.transport),
            pipeline,
            sink: Arc::clone(&self.sink),
            auth: Arc::new(RwLock::new(AuthContext::new(""))),
            status: Arc::clone(&self.status),
            signal_tx,
            signals,
            control,
        });

        let handle = thread::Builder::new()
            .name("biowatch-supervisor".to_string())
            .spawn(move || supervisor.run())?;

        self.control = Some(control_tx);
        self.thread = Some(handle);
        Ok(())
    }

    pub fn status(&self) -> MonitorStatus {
        *self.status.lock()
    }

    /// Tear everything down and wait for the supervisor thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Stop);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        *self.status.lock() = MonitorStatus::Stopped;
    }

    /// State file for one employee's fingerprints.
    fn state_path(&self, employee_id: &str) -> PathBuf {
        let safe: String = employee_id
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.config
            .state_dir
            .join(format!("attendance_state_{safe}.json"))
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}
