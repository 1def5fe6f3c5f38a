//! Interval polling, the degraded fallback when the push channel cannot be
//! kept open. Same refresh pipeline, no realtime latency.

use crate::error::MonitorError;
use crate::monitor::Pipeline;
use crate::session::AuthContext;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Sleep slice so a stop request never waits out a full interval.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Raised by the polling loop when it cannot usefully continue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollSignal {
    /// The backend rejected the session; a fresh login is needed before any
    /// further fetch can succeed.
    AuthExpired,
}

/// Background polling worker. Dropped handles leave the thread running;
/// call [`PollingFallback::stop`] to join it.
pub struct PollingFallback {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollingFallback {
    /// Spawn the polling thread. Transient refresh errors are logged and
    /// the loop keeps going; a rejected session is reported over `signals`
    /// and ends the loop, since every further fetch would fail the same way.
    pub fn start(
        interval: Duration,
        pipeline: Arc<Mutex<Pipeline>>,
        auth: Arc<RwLock<AuthContext>>,
        signals: Sender<PollSignal>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("biowatch-poll".to_string())
            .spawn(move || loop {
                let auth_snapshot = auth.read().clone();
                let outcome = pipeline.lock().refresh(&auth_snapshot);
                match outcome {
                    Ok(new_events) => {
                        if new_events > 0 {
                            debug!(new_events, "poll picked up changes");
                        }
                    }
                    Err(MonitorError::AuthExpired) => {
                        warn!("session rejected while polling");
                        let _ = signals.send(PollSignal::AuthExpired);
                        return;
                    }
                    Err(err) => warn!(error = %err, "poll refresh failed"),
                }

                let mut slept = Duration::ZERO;
                while slept < interval {
                    if stop_flag.load(Ordering::SeqCst) {
                        return;
                    }
                    let slice = STOP_POLL.min(interval - slept);
                    thread::sleep(slice);
                    slept += slice;
                }
            })
            .expect("spawn polling thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
