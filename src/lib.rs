//! # biowatch
//!
//! Resilient realtime monitoring for a biometric attendance backend.
//!
//! The backend announces changes over a SignalR-style push channel but never
//! sends the changed data; every notification triggers a full snapshot
//! re-fetch, diffed against a persisted fingerprint set so consumers only
//! ever see genuinely new events. A supervisor keeps the channel alive
//! through drops, idle stalls, and session expiry, and degrades to interval
//! polling when the channel cannot be held open.
//!
//! ## Core Concepts
//!
//! - **Channel**: One push subscription with its receive and keep-alive loops
//! - **Supervisor**: Single-threaded reconnect and escalation decisions
//! - **Detector**: Fingerprint diffing of full snapshots
//! - **Store**: Crash-safe persisted fingerprint set, one file per employee
//!
//! ## Example
//!
//! ```ignore
//! use biowatch::{Credentials, Monitor, MonitorConfig};
//!
//! let mut monitor = Monitor::new(
//!     MonitorConfig {
//!         state_dir: "/var/lib/biowatch".into(),
//!         ..Default::default()
//!     },
//!     session,  // SessionProvider: performs the login
//!     source,   // SnapshotSource: fetches the event list
//!     sink,     // EventSink: receives new events
//! )?;
//!
//! monitor.start(Credentials {
//!     employee_id: "20-1234".into(),
//!     password: password,
//! })?;
//! ```

pub mod channel;
pub mod detector;
pub mod error;
pub mod monitor;
pub mod polling;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-exports
pub use channel::transport::{SignalrTransport, SubscriptionToken, Transport, WireEvent, WireSocket};
pub use channel::{
    ChannelConfig, ChannelSignal, CloseReason, ConnectionState, InstanceId, RealtimeChannel,
};
pub use detector::{analyze_day, detect, ChangeSet, DayAnalysis};
pub use error::{MonitorError, Result};
pub use monitor::{EventSink, Monitor, MonitorConfig, MonitorStatus, Pipeline};
pub use polling::PollingFallback;
pub use session::{AuthContext, Credentials, CredentialsHint, SessionProvider, SnapshotSource};
pub use store::FingerprintStore;
pub use supervisor::{backoff_delay, ReconnectKind};
pub use types::{AccessResult, AttendanceEvent, Fingerprint};
