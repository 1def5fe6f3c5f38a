//! Long-lived push-notification channel to the backend.
//!
//! One channel instance wraps one logical subscription. The receive loop
//! only decodes and dispatches; every accepted invocation is forwarded as a
//! content-free refresh signal, never as event data. Recovery decisions
//! belong to the supervisor, which consumes this module's signals over a
//! channel.

pub mod frame;
pub mod transport;

use crate::session::AuthContext;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use transport::{SubscriptionToken, Transport, WireEvent, WireSocket};

/// How long one blocking read waits before re-checking control flags.
const RECV_POLL: Duration = Duration::from_millis(250);

/// Sleep slice for the keep-alive loop, so stop requests are observed
/// promptly even with a long tick.
const KEEPALIVE_SLICE: Duration = Duration::from_millis(250);

/// Unique identity of one channel instance, minted at construction.
///
/// Recovery signals are tagged with the identity of the instance that
/// raised them so the supervisor can ignore signals from superseded
/// instances.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one channel instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Open,
    /// Nominally open but idle past the threshold; about to be closed.
    Degraded,
    Closed,
}

/// Why a channel closed or failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit disconnect, or a clean close-handshake from the peer.
    Normal,
    /// The peer closed without a normal status.
    Remote,
    /// Forced close after prolonged idleness. Not evidence of bad
    /// credentials; reconnects stay in Simple mode.
    Idle,
    /// Socket-level error after open.
    Transport(String),
    /// The open handshake itself failed or timed out.
    Handshake(String),
}

impl CloseReason {
    /// Whether this failure looks like a corrupted socket, which skips the
    /// cheap-reconnect step entirely.
    pub fn is_socket_level(&self) -> bool {
        match self {
            CloseReason::Transport(msg) => {
                let msg = msg.to_lowercase();
                ["socket", "already", "opened", "closed", "broken"]
                    .iter()
                    .any(|needle| msg.contains(needle))
            }
            _ => false,
        }
    }

    /// Error-like reasons count toward consecutive failures; close-like
    /// ones (idle, remote close) do not.
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseReason::Transport(_) | CloseReason::Handshake(_))
    }
}

/// Signal from a channel instance to the supervisor loop.
#[derive(Clone, Debug)]
pub enum ChannelSignal {
    Opened {
        instance: InstanceId,
    },
    /// The backend announced a change; the snapshot must be re-fetched.
    Refresh {
        instance: InstanceId,
    },
    Closed {
        instance: InstanceId,
        reason: CloseReason,
    },
}

impl ChannelSignal {
    pub fn instance(&self) -> InstanceId {
        match self {
            ChannelSignal::Opened { instance }
            | ChannelSignal::Refresh { instance }
            | ChannelSignal::Closed { instance, .. } => *instance,
        }
    }
}

/// Channel tuning knobs.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Hub the subscription joins.
    pub hub: String,
    /// Method name announcing a change on that hub.
    pub method: String,
    /// Bound on the open handshake.
    pub open_timeout: Duration,
    /// Force a close when no frame arrives for this long.
    pub idle_threshold: Duration,
    /// Send a ping once idle for this long.
    pub ping_after: Duration,
    /// Keep-alive wake-up interval.
    pub keepalive_tick: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            hub: "BioHub".to_string(),
            method: "update".to_string(),
            open_timeout: Duration::from_secs(20),
            idle_threshold: Duration::from_secs(120),
            ping_after: Duration::from_secs(60),
            keepalive_tick: Duration::from_secs(30),
        }
    }
}

/// Per-connect control block. A reconnect on the same instance supersedes
/// the previous block, so lingering threads from the old wire connection
/// exit without signaling.
struct ConnHandle {
    generation: u64,
    close_requested: AtomicBool,
    ping_requested: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

impl ConnHandle {
    fn request_close(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.close_requested.store(true, Ordering::SeqCst);
    }
}

struct ChannelShared {
    state: Mutex<ConnectionState>,
    /// Set by `disconnect()`: background activities must not signal a close
    /// that would trigger auto-reconnect.
    stopped: AtomicBool,
    /// Set by the supervisor once a full reauth was requested from this
    /// instance; it will never be connected again.
    pending_reauth: AtomicBool,
    last_frame_at: Mutex<Instant>,
    connection_id: Mutex<Option<String>>,
    message_id: AtomicU64,
    generation: AtomicU64,
    conn: Mutex<Option<Arc<ConnHandle>>>,
}

/// One realtime channel instance.
pub struct RealtimeChannel {
    id: InstanceId,
    transport: Arc<dyn Transport>,
    auth: AuthContext,
    config: ChannelConfig,
    signals: Sender<ChannelSignal>,
    shared: Arc<ChannelShared>,
}

impl RealtimeChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: AuthContext,
        config: ChannelConfig,
        signals: Sender<ChannelSignal>,
    ) -> Self {
        let id = InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::SeqCst));
        Self {
            id,
            transport,
            auth,
            config,
            signals,
            shared: Arc::new(ChannelShared {
                state: Mutex::new(ConnectionState::Idle),
                stopped: AtomicBool::new(false),
                pending_reauth: AtomicBool::new(false),
                last_frame_at: Mutex::new(Instant::now()),
                connection_id: Mutex::new(None),
                message_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                conn: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Backend-assigned connection id, once observed.
    pub fn connection_id(&self) -> Option<String> {
        self.shared.connection_id.lock().clone()
    }

    /// Mark this instance as awaiting external reauthentication. It stops
    /// being a reconnect candidate; the supervisor will replace it.
    pub fn mark_pending_reauth(&self) {
        self.shared.pending_reauth.store(true, Ordering::SeqCst);
    }

    pub fn is_pending_reauth(&self) -> bool {
        self.shared.pending_reauth.load(Ordering::SeqCst)
    }

    /// Open the wire connection with a previously issued token.
    ///
    /// Blocks up to the configured open timeout. Returns `false` on
    /// handshake failure or timeout; never retries internally.
    pub fn connect(&self, token: &SubscriptionToken) -> bool {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return false;
        }

        // Supersede any leftover wire connection from a previous attempt.
        if let Some(old) = self.shared.conn.lock().take() {
            old.request_close(CloseReason::Normal);
        }

        *self.shared.state.lock() = ConnectionState::Negotiating;
        debug!(instance = %self.id, "opening realtime channel");

        let mut socket = match self
            .transport
            .open(&self.auth, token, self.config.open_timeout)
        {
            Ok(socket) => socket,
            Err(err) => {
                warn!(instance = %self.id, error = %err, "channel open failed");
                *self.shared.state.lock() = ConnectionState::Closed;
                return false;
            }
        };

        let join = frame::join_frame(&self.config.hub, self.next_message_id());
        if let Err(err) = socket.send(&join) {
            warn!(instance = %self.id, error = %err, "join frame failed");
            socket.close();
            *self.shared.state.lock() = ConnectionState::Closed;
            return false;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = Arc::new(ConnHandle {
            generation,
            close_requested: AtomicBool::new(false),
            ping_requested: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });
        *self.shared.conn.lock() = Some(Arc::clone(&handle));
        *self.shared.last_frame_at.lock() = Instant::now();
        *self.shared.state.lock() = ConnectionState::Open;

        info!(instance = %self.id, hub = %self.config.hub, "realtime channel open");
        let _ = self.signals.send(ChannelSignal::Opened { instance: self.id });

        self.spawn_receive_loop(socket, Arc::clone(&handle));
        self.spawn_keepalive_loop(handle);
        true
    }

    /// Idempotent teardown. Background threads observe the stop flag within
    /// one poll interval; no close signal from this instance will trigger a
    /// reconnect afterwards.
    pub fn disconnect(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(conn) = self.shared.conn.lock().as_ref() {
            conn.request_close(CloseReason::Normal);
        }
        *self.shared.state.lock() = ConnectionState::Closed;
        debug!(instance = %self.id, "channel disconnected");
    }

    fn next_message_id(&self) -> u64 {
        self.shared.message_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn spawn_receive_loop(&self, socket: Box<dyn WireSocket>, handle: Arc<ConnHandle>) {
        let shared = Arc::clone(&self.shared);
        let signals = self.signals.clone();
        let config = self.config.clone();
        let id = self.id;

        thread::Builder::new()
            .name(format!("biowatch-recv-{id}"))
            .spawn(move || receive_loop(socket, handle, shared, signals, config, id))
            .expect("spawn receive loop");
    }

    fn spawn_keepalive_loop(&self, handle: Arc<ConnHandle>) {
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let id = self.id;

        thread::Builder::new()
            .name(format!("biowatch-keepalive-{id}"))
            .spawn(move || keepalive_loop(handle, shared, config, id))
            .expect("spawn keepalive loop");
    }
}

/// Receive loop: decode, dispatch, nothing else. Runs until closed,
/// superseded, or failed; emits one `Closed` signal unless superseded.
fn receive_loop(
    mut socket: Box<dyn WireSocket>,
    handle: Arc<ConnHandle>,
    shared: Arc<ChannelShared>,
    signals: Sender<ChannelSignal>,
    config: ChannelConfig,
    id: InstanceId,
) {
    let reason = loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break CloseReason::Normal;
        }
        if handle.close_requested.load(Ordering::SeqCst) {
            break handle
                .close_reason
                .lock()
                .take()
                .unwrap_or(CloseReason::Normal);
        }
        if handle.generation != shared.generation.load(Ordering::SeqCst) {
            // Superseded by a newer connect on this instance.
            socket.close();
            return;
        }

        if handle.ping_requested.swap(false, Ordering::SeqCst) {
            let ping = frame::ping_frame(
                &config.hub,
                shared.message_id.fetch_add(1, Ordering::SeqCst) + 1,
            );
            if let Err(err) = socket.send(&ping) {
                debug!(instance = %id, error = %err, "keep-alive ping failed");
            }
        }

        match socket.recv(RECV_POLL) {
            Ok(None) => {}
            Ok(Some(WireEvent::Ping)) => {
                *shared.last_frame_at.lock() = Instant::now();
            }
            Ok(Some(WireEvent::Text(text))) => {
                *shared.last_frame_at.lock() = Instant::now();
                match frame::decode(&text) {
                    Some(mut envelope) => {
                        if let Some(cid) = envelope.connection_id.take() {
                            debug!(instance = %id, connection = %cid, "connection id assigned");
                            *shared.connection_id.lock() = Some(cid);
                        }
                        for _ in 0..envelope.matching(&config.hub, &config.method) {
                            let _ = signals.send(ChannelSignal::Refresh { instance: id });
                        }
                    }
                    None => debug!(instance = %id, "dropping malformed frame"),
                }
            }
            Ok(Some(WireEvent::Closed { normal })) => {
                break if normal {
                    CloseReason::Normal
                } else {
                    CloseReason::Remote
                };
            }
            Err(err) => break CloseReason::Transport(err.to_string()),
        }
    };

    socket.close();

    if handle.generation == shared.generation.load(Ordering::SeqCst) {
        *shared.state.lock() = ConnectionState::Closed;
        debug!(instance = %id, ?reason, "receive loop ended");
        let _ = signals.send(ChannelSignal::Closed {
            instance: id,
            reason,
        });
    }
}

/// Keep-alive loop: wake periodically, ping when quiet, force a close when
/// idle past the threshold. The actual socket I/O happens on the receive
/// loop; this thread only raises flags.
fn keepalive_loop(
    handle: Arc<ConnHandle>,
    shared: Arc<ChannelShared>,
    config: ChannelConfig,
    id: InstanceId,
) {
    loop {
        let mut slept = Duration::ZERO;
        while slept < config.keepalive_tick {
            if shared.stopped.load(Ordering::SeqCst)
                || handle.close_requested.load(Ordering::SeqCst)
                || handle.generation != shared.generation.load(Ordering::SeqCst)
            {
                return;
            }
            let slice = KEEPALIVE_SLICE.min(config.keepalive_tick - slept);
            thread::sleep(slice);
            slept += slice;
        }

        if *shared.state.lock() != ConnectionState::Open {
            return;
        }

        let idle = shared.last_frame_at.lock().elapsed();
        if idle > config.idle_threshold {
            warn!(instance = %id, idle_secs = idle.as_secs(), "channel idle, forcing close");
            *shared.state.lock() = ConnectionState::Degraded;
            handle.request_close(CloseReason::Idle);
            return;
        }
        if idle > config.ping_after {
            handle.ping_requested.store(true, Ordering::SeqCst);
        }
    }
}
