//! Reconnection supervisor.
//!
//! All recovery decisions are made here, on one thread, from signals the
//! channel instances send over a crossbeam channel. Receive loops never
//! reconnect themselves; they report a close reason and exit. This keeps
//! the failure-classification state (attempt counter, consecutive
//! failures, pending reauth) free of locking subtleties.

use crate::channel::transport::{SubscriptionToken, Transport};
use crate::channel::{
    ChannelConfig, ChannelSignal, CloseReason, RealtimeChannel,
};
use crate::error::MonitorError;
use crate::monitor::{EventSink, MonitorConfig, MonitorStatus, Pipeline};
use crate::polling::{PollSignal, PollingFallback};
use crate::session::{AuthContext, Credentials, SessionProvider};
use crossbeam_channel::{after, bounded, never, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Control messages from the owning monitor.
pub(crate) enum Control {
    Stop,
}

/// How the next reconnect attempt will be performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectKind {
    /// Reopen the same instance with the token already issued; no
    /// negotiation, no login.
    Simple,
    /// Discard the session, log in again, and build a fresh channel
    /// instance.
    FullReauth,
}

/// Delay before reconnect attempt `attempt` (1-based): exponential,
/// capped. Attempt 1 waits 2 seconds.
pub fn backoff_delay(attempt: u32, max_backoff: Duration) -> Duration {
    let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(max_backoff)
}

struct ReconnectPlan {
    due: Instant,
    kind: ReconnectKind,
}

/// Everything the supervisor needs to run, assembled by the monitor.
pub(crate) struct SupervisorContext {
    pub(crate) config: MonitorConfig,
    pub(crate) credentials: Credentials,
    pub(crate) session: Box<dyn SessionProvider>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pipeline: Arc<Mutex<Pipeline>>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) auth: Arc<RwLock<AuthContext>>,
    pub(crate) status: Arc<Mutex<MonitorStatus>>,
    pub(crate) signal_tx: Sender<ChannelSignal>,
    pub(crate) signals: Receiver<ChannelSignal>,
    pub(crate) control: Receiver<Control>,
}

pub(crate) struct Supervisor {
    ctx: SupervisorContext,
    current: Option<Arc<RealtimeChannel>>,
    /// Token issued by the last negotiation; Simple reconnects reuse it.
    token: Option<SubscriptionToken>,
    polling: Option<PollingFallback>,
    poll_signals: Sender<PollSignal>,
    poll_events: Receiver<PollSignal>,
    /// Reconnect attempts since the last successful open.
    attempt: u32,
    /// Error-class failures in a row; two of them escalate to full reauth.
    consecutive_failures: u32,
    pending: Option<ReconnectPlan>,
    terminal_reported: bool,
}

impl Supervisor {
    pub(crate) fn new(ctx: SupervisorContext) -> Self {
        let (poll_signals, poll_events) = bounded(4);
        Self {
            ctx,
            current: None,
            token: None,
            polling: None,
            poll_signals,
            poll_events,
            attempt: 0,
            consecutive_failures: 0,
            pending: None,
            terminal_reported: false,
        }
    }

    pub(crate) fn run(mut self) {
        *self.ctx.status.lock() = MonitorStatus::Connecting;

        let auth = match self.ctx.session.login(&self.ctx.credentials) {
            Ok(auth) => auth,
            Err(err) => {
                error!(error = %err, "initial login failed");
                self.ctx.sink.on_terminal_failure(&err);
                *self.ctx.status.lock() = MonitorStatus::Stopped;
                return;
            }
        };
        *self.ctx.auth.write() = auth.clone();

        match self.ctx.transport.negotiate(&auth) {
            Ok(token) => {
                self.token = Some(token.clone());
                let channel = self.fresh_channel(auth);
                if !channel.connect(&token) {
                    self.handle_closed(CloseReason::Handshake(
                        "initial open failed".to_string(),
                    ));
                }
            }
            Err(err) => {
                warn!(error = %err, "negotiation failed, using polling fallback");
                self.start_polling();
            }
        }

        self.event_loop();
        self.shutdown();
    }

    fn event_loop(&mut self) {
        loop {
            let timer = match &self.pending {
                Some(plan) => after(plan.due.saturating_duration_since(Instant::now())),
                None => never(),
            };
            select! {
                recv(self.ctx.control) -> msg => match msg {
                    Ok(Control::Stop) | Err(_) => return,
                },
                recv(self.ctx.signals) -> signal => match signal {
                    Ok(signal) => self.handle_signal(signal),
                    Err(_) => return,
                },
                recv(self.poll_events) -> signal => {
                    if let Ok(PollSignal::AuthExpired) = signal {
                        self.handle_poll_auth_expired();
                    }
                },
                recv(timer) -> _ => {
                    if let Some(plan) = self.pending.take() {
                        self.execute(plan.kind);
                    }
                }
            }
        }
    }

    /// Signals carry the identity of the instance that raised them; anything
    /// from a superseded instance is dropped here.
    fn handle_signal(&mut self, signal: ChannelSignal) {
        let current_id = self.current.as_ref().map(|c| c.id());
        if current_id != Some(signal.instance()) {
            debug!(instance = %signal.instance(), "ignoring signal from superseded instance");
            return;
        }
        match signal {
            ChannelSignal::Opened { .. } => self.handle_opened(),
            ChannelSignal::Refresh { .. } => self.refresh(),
            ChannelSignal::Closed { reason, .. } => self.handle_closed(reason),
        }
    }

    fn handle_opened(&mut self) {
        self.attempt = 0;
        self.consecutive_failures = 0;
        self.pending = None;
        self.stop_polling();
        *self.ctx.status.lock() = MonitorStatus::Connected;
        info!("realtime channel established");
        // Catch up on anything announced while disconnected.
        self.refresh();
    }

    fn refresh(&mut self) {
        let auth = self.ctx.auth.read().clone();
        // Bind before matching so the pipeline guard is released.
        let outcome = self.ctx.pipeline.lock().refresh(&auth);
        match outcome {
            Ok(new_events) => {
                if new_events > 0 {
                    debug!(new_events, "snapshot refreshed");
                }
            }
            Err(MonitorError::AuthExpired) => {
                warn!("session rejected by backend, escalating");
                self.schedule_reconnect(true);
            }
            Err(err) => warn!(error = %err, "snapshot refresh failed"),
        }
    }

    fn handle_closed(&mut self, reason: CloseReason) {
        match reason {
            CloseReason::Normal => {
                debug!("channel closed cleanly");
                let mut status = self.ctx.status.lock();
                if *status == MonitorStatus::Connected {
                    *status = MonitorStatus::Idle;
                }
            }
            CloseReason::Idle | CloseReason::Remote => {
                // Close-like, not error-like: reconnect without counting a
                // failure.
                self.schedule_reconnect(false);
            }
            CloseReason::Transport(_) | CloseReason::Handshake(_) => {
                self.consecutive_failures += 1;
                let escalate =
                    reason.is_socket_level() || self.consecutive_failures >= 2;
                self.schedule_reconnect(escalate);
            }
        }
    }

    fn schedule_reconnect(&mut self, escalate: bool) {
        self.attempt += 1;
        if self.attempt > self.ctx.config.max_reconnect_attempts {
            let attempts = self.attempt - 1;
            error!(attempts, "reconnect attempts exhausted, falling back to polling");
            if !self.terminal_reported {
                self.terminal_reported = true;
                self.ctx
                    .sink
                    .on_terminal_failure(&MonitorError::MaxAttemptsExceeded { attempts });
            }
            self.pending = None;
            self.start_polling();
            return;
        }

        let kind = if escalate {
            ReconnectKind::FullReauth
        } else {
            ReconnectKind::Simple
        };
        if kind == ReconnectKind::FullReauth {
            if let Some(channel) = &self.current {
                // At most one reauth request per instance.
                if !channel.is_pending_reauth() {
                    channel.mark_pending_reauth();
                    self.ctx
                        .sink
                        .on_reauth_required(channel.id(), &self.ctx.credentials.hint());
                }
            }
        }

        let delay = backoff_delay(self.attempt, self.ctx.config.max_backoff);
        info!(
            attempt = self.attempt,
            ?kind,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        *self.ctx.status.lock() = MonitorStatus::Connecting;
        self.pending = Some(ReconnectPlan {
            due: Instant::now() + delay,
            kind,
        });
    }

    fn execute(&mut self, kind: ReconnectKind) {
        match kind {
            ReconnectKind::Simple => self.reconnect_simple(),
            ReconnectKind::FullReauth => self.reconnect_full(),
        }
    }

    /// Cheap path: reopen the same instance with the token it was issued.
    /// Nothing to reuse means the cheap path is unavailable.
    fn reconnect_simple(&mut self) {
        let (Some(channel), Some(token)) = (self.current.clone(), self.token.clone()) else {
            return self.reconnect_full();
        };
        if !channel.connect(&token) {
            self.handle_closed(CloseReason::Handshake(
                "reconnect open failed".to_string(),
            ));
        }
    }

    fn reconnect_full(&mut self) {
        info!("re-authenticating");
        let auth = match self.ctx.session.login(&self.ctx.credentials) {
            Ok(auth) => auth,
            Err(err) => {
                warn!(error = %err, "login failed");
                self.handle_closed(CloseReason::Handshake(format!("login failed: {err}")));
                return;
            }
        };
        *self.ctx.auth.write() = auth.clone();

        let token = match self.ctx.transport.negotiate(&auth) {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, "negotiation after reauth failed");
                self.handle_closed(CloseReason::Handshake(err.to_string()));
                return;
            }
        };
        self.token = Some(token.clone());

        // The old instance is retired before the replacement goes live;
        // anything it still emits fails the identity check.
        if let Some(old) = self.current.take() {
            old.disconnect();
        }
        let channel = self.fresh_channel(auth);
        if !channel.connect(&token) {
            self.handle_closed(CloseReason::Handshake(
                "open after reauth failed".to_string(),
            ));
        }
    }

    fn fresh_channel(&mut self, auth: AuthContext) -> Arc<RealtimeChannel> {
        let channel = Arc::new(RealtimeChannel::new(
            Arc::clone(&self.ctx.transport),
            auth,
            self.channel_config(),
            self.ctx.signal_tx.clone(),
        ));
        self.current = Some(Arc::clone(&channel));
        channel
    }

    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            hub: self.ctx.config.hub.clone(),
            method: self.ctx.config.method.clone(),
            open_timeout: self.ctx.config.open_timeout,
            idle_threshold: self.ctx.config.idle_threshold,
            ping_after: self.ctx.config.ping_after,
            keepalive_tick: self.ctx.config.keepalive_tick,
        }
    }

    fn start_polling(&mut self) {
        if self.polling.is_none() {
            info!(
                interval_secs = self.ctx.config.poll_interval.as_secs(),
                "polling fallback active"
            );
            self.polling = Some(PollingFallback::start(
                self.ctx.config.poll_interval,
                Arc::clone(&self.ctx.pipeline),
                Arc::clone(&self.ctx.auth),
                self.poll_signals.clone(),
            ));
        }
        *self.ctx.status.lock() = MonitorStatus::PollingActive;
    }

    /// Polling hit a rejected session. A new failure episode starts: log in
    /// again through the regular backoff machinery, which resumes polling
    /// (with the refreshed session) if realtime still cannot be held.
    fn handle_poll_auth_expired(&mut self) {
        warn!("session rejected while polling, escalating");
        self.stop_polling();
        self.attempt = 0;
        self.consecutive_failures = 0;
        self.schedule_reconnect(true);
    }

    fn stop_polling(&mut self) {
        if let Some(polling) = self.polling.take() {
            polling.stop();
        }
    }

    fn shutdown(&mut self) {
        if let Some(channel) = self.current.take() {
            channel.disconnect();
        }
        self.stop_polling();
        self.pending = None;
        *self.ctx.status.lock() = MonitorStatus::Stopped;
        info!("monitor stopped");
    }
}
