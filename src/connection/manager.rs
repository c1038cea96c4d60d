//! Connection Manager
//!
//! Keeps one channel to a remote endpoint alive:
//! - Resolves parameters, opens the channel, wires its lifecycle back in
//! - Treats an unexpected close as the start of a reconnect cycle with a
//!   linearly growing delay
//! - Confirms a reconnection only after it survives a short stability window,
//!   then resets the delay and closes the disconnection episode
//! - Publishes every state change on a broadcast signal
//!
//! # Architecture
//!
//! ```text
//!   ConnectionManager (handle)          ChannelListener (per channel)
//!            │  commands                        │  tagged events
//!            ▼                                  ▼
//!   ┌──────────────────────── Supervisor task ─────────────────────────┐
//!   │ state · backoff · episode · channel · retry timer · stability     │
//!   └───────────────────────────────────────────────────────────────────┘
//!            ▲                                  ▲
//!   resolver completions                 timer fires
//! ```
//!
//! Every input is a command on one queue, so the supervisor owns its fields
//! outright and never locks them. The only suspension point is parameter
//! resolution, which runs in its own task and reports back tagged with the
//! connect attempt it belongs to.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::backoff::{DisconnectionEpisode, LinearBackoff};
use super::channel::{
    ChannelEvent, ChannelFactory, ChannelHandle, ChannelListener, ConnectionParams,
    ConnectionResolver,
};
use super::config::ManagerConfig;
use super::metrics::ManagerMetrics;
use super::state::{ConnectionState, TimerKind};
use super::timer::TimerSlot;

const STATE_SIGNAL_CAPACITY: usize = 64;

/// Diagnostic record: `info` when the manager runs with `local`, `debug` otherwise.
macro_rules! diag {
    ($local:expr, $($arg:tt)+) => {
        if $local {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// Supervisor input
pub(crate) enum Command {
    Connect {
        reply: Option<oneshot::Sender<()>>,
    },
    Resolved {
        attempt: u64,
        result: Result<ConnectionParams>,
        reply: Option<oneshot::Sender<()>>,
    },
    Reconnect {
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Login {
        enter: bool,
        reply: oneshot::Sender<bool>,
    },
    Channel {
        channel_id: u64,
        event: ChannelEvent,
    },
    TimerFired {
        kind: TimerKind,
        id: u64,
    },
    Snapshot {
        reply: oneshot::Sender<ManagerSnapshot>,
    },
    Shutdown,
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub state: ConnectionState,
    /// Delay the next retry will wait
    pub current_delay: Duration,
    /// Start of the current disconnection episode, margin already applied
    pub disconnected_at: Option<DateTime<Utc>>,
    pub retry_pending: bool,
    pub stability_pending: bool,
    pub has_channel: bool,
}

impl ManagerSnapshot {
    /// `disconnected_at` as `YYYY-MM-DD HH:MM:SS`, the form audit queries take
    pub fn audit_since(&self) -> Option<String> {
        self.disconnected_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

// =============================================================================
// PUBLIC HANDLE
// =============================================================================

/// Handle to a running connection manager.
///
/// Dropping the handle stops the supervisor and releases the channel.
pub struct ConnectionManager {
    id: Arc<str>,
    queue: mpsc::UnboundedSender<Command>,
    signal: broadcast::Sender<ConnectionState>,
    state: Arc<RwLock<ConnectionState>>,
    metrics: Arc<ManagerMetrics>,
}

impl ConnectionManager {
    /// Start a manager in the `initial` state. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        config: ManagerConfig,
        resolver: Arc<dyn ConnectionResolver>,
        factory: Arc<dyn ChannelFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let (queue, commands) = mpsc::unbounded_channel();
        let (signal, _) = broadcast::channel(STATE_SIGNAL_CAPACITY);
        let state = Arc::new(RwLock::new(ConnectionState::Initial));
        let metrics = Arc::new(ManagerMetrics::new());
        let id: Arc<str> = Arc::from(config.id.as_str());

        info!(
            id = %id,
            initial_ms = config.initial_reconnect_period_ms,
            max_ms = config.max_reconnect_period_ms,
            local = config.local,
            "connection_manager_started"
        );

        let supervisor = Supervisor {
            id: id.clone(),
            backoff: LinearBackoff::new(
                config.initial_reconnect_period(),
                config.reconnect_increment(),
                config.max_reconnect_period(),
            ),
            episode: DisconnectionEpisode::new(config.disconnect_margin()),
            config,
            resolver,
            factory,
            queue: queue.clone(),
            signal: signal.clone(),
            mirror: state.clone(),
            metrics: metrics.clone(),
            state: ConnectionState::Initial,
            channel: None,
            next_channel_id: 0,
            connect_attempt: 0,
            retry: TimerSlot::new(TimerKind::Retry),
            stability: TimerSlot::new(TimerKind::Stability),
        };
        tokio::spawn(supervisor.run(commands));

        Ok(Self {
            id,
            queue,
            signal,
            state,
            metrics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive every state change from now on. Past values are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.signal.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    /// Release the current channel (if any) and open a new one.
    ///
    /// Returns once the open request is issued; completion shows up on the
    /// state signal. Failures never surface here, they drive the reconnect
    /// cycle instead.
    pub async fn connect(&self) {
        let (reply, done) = oneshot::channel();
        self.request(Command::Connect { reply: Some(reply) }, done)
            .await;
    }

    /// Drop the channel and schedule a fresh connect after the current delay.
    /// No-op while a reconnect is already pending.
    pub async fn reconnect(&self) {
        let (reply, done) = oneshot::channel();
        self.request(Command::Reconnect { reply }, done).await;
    }

    /// Caller-initiated shutdown. Cancels pending retries and settles in
    /// `initial`.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        self.request(Command::Close { reply }, done).await;
    }

    /// `connected` → `login`. Returns false if the manager was not connected.
    pub async fn begin_login(&self) -> bool {
        let (reply, done) = oneshot::channel();
        self.request(Command::Login { enter: true, reply }, done)
            .await
            .unwrap_or(false)
    }

    /// `login` → `connected`. Returns false if no login was in progress.
    pub async fn finish_login(&self) -> bool {
        let (reply, done) = oneshot::channel();
        self.request(Command::Login { enter: false, reply }, done)
            .await
            .unwrap_or(false)
    }

    /// None once the supervisor has stopped
    pub async fn snapshot(&self) -> Option<ManagerSnapshot> {
        let (reply, done) = oneshot::channel();
        self.request(Command::Snapshot { reply }, done).await
    }

    async fn request<T>(&self, command: Command, done: oneshot::Receiver<T>) -> Option<T> {
        if self.queue.send(command).is_err() {
            warn!(id = %self.id, "connection_manager_stopped");
            return None;
        }
        done.await.ok()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.queue.send(Command::Shutdown);
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

struct ActiveChannel {
    id: u64,
    handle: Box<dyn ChannelHandle>,
    open: bool,
}

struct Supervisor {
    id: Arc<str>,
    config: ManagerConfig,
    resolver: Arc<dyn ConnectionResolver>,
    factory: Arc<dyn ChannelFactory>,
    queue: mpsc::UnboundedSender<Command>,
    signal: broadcast::Sender<ConnectionState>,
    mirror: Arc<RwLock<ConnectionState>>,
    metrics: Arc<ManagerMetrics>,

    state: ConnectionState,
    backoff: LinearBackoff,
    episode: DisconnectionEpisode,
    channel: Option<ActiveChannel>,
    next_channel_id: u64,
    /// Bumped by every connect and every teardown that must void an in-flight
    /// resolution
    connect_attempt: u64,
    retry: TimerSlot,
    stability: TimerSlot,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect { reply } => self.connect(reply),
                Command::Resolved {
                    attempt,
                    result,
                    reply,
                } => {
                    self.on_resolved(attempt, result);
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                Command::Reconnect { reply } => {
                    self.reconnect();
                    let _ = reply.send(());
                }
                Command::Close { reply } => {
                    self.close();
                    let _ = reply.send(());
                }
                Command::Login { enter, reply } => {
                    let _ = reply.send(self.login(enter));
                }
                Command::Channel { channel_id, event } => {
                    self.on_channel_event(channel_id, event)
                }
                Command::TimerFired { kind, id } => self.on_timer(kind, id),
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown => break,
            }
        }

        self.retry.cancel();
        self.stability.cancel();
        self.release_channel();
        info!(id = %self.id, summary = %self.metrics.summary(), "connection_manager_stopped");
    }

    /// The only writer of `state`. Equal values are not an event.
    fn set_state(&mut self, next: ConnectionState) -> bool {
        let previous = self.state;
        if previous == next {
            return false;
        }
        self.state = next;
        *self.mirror.write() = next;

        info!(id = %self.id, from = %previous, to = %next, "connection_transition");

        // No subscribers is fine
        let _ = self.signal.send(next);
        true
    }

    // -------------------------------------------------------------------------
    // connect . reconnect . close
    // -------------------------------------------------------------------------

    fn connect(&mut self, reply: Option<oneshot::Sender<()>>) {
        // A fresh connect supersedes a pending retry
        self.retry.cancel();
        self.release_channel();

        if self.state != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        self.metrics.record_connect_attempt();
        diag!(self.config.local, id = %self.id, attempt, "connect_resolving");

        let resolver = self.resolver.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let result = resolver.resolve().await;
            let _ = queue.send(Command::Resolved {
                attempt,
                result,
                reply,
            });
        });
    }

    fn on_resolved(&mut self, attempt: u64, result: Result<ConnectionParams>) {
        if attempt != self.connect_attempt {
            debug!(
                id = %self.id,
                attempt,
                current = self.connect_attempt,
                "stale_resolution_ignored"
            );
            return;
        }

        match result {
            Ok(params) => self.open_channel(params),
            Err(e) => {
                self.metrics.record_resolve_failure();
                error!(id = %self.id, error = %e, "connection_resolve_failed");
                self.on_close(format!("resolve failed: {e}"));
            }
        }
    }

    fn open_channel(&mut self, params: ConnectionParams) {
        // The previous handle is fully released before a new one is assigned
        self.release_channel();

        self.next_channel_id += 1;
        let channel_id = self.next_channel_id;
        let listener = ChannelListener::new(channel_id, self.queue.clone());

        match self.factory.open(&params, &self.config.channel, listener) {
            Ok(handle) => {
                diag!(
                    self.config.local,
                    id = %self.id,
                    channel_id,
                    endpoint = %params.endpoint,
                    path = %params.path,
                    "connecting"
                );
                self.channel = Some(ActiveChannel {
                    id: channel_id,
                    handle,
                    open: false,
                });
            }
            Err(e) => {
                self.metrics.record_open_failure();
                error!(id = %self.id, channel_id, error = %e, "channel_open_failed");
                self.on_close(format!("open failed: {e}"));
            }
        }
    }

    fn reconnect(&mut self) {
        if self.state == ConnectionState::Reconnecting {
            diag!(self.config.local, id = %self.id, "reconnect_already_pending");
            return;
        }
        diag!(self.config.local, id = %self.id, "reconnecting");

        self.set_state(ConnectionState::Reconnecting);
        self.abandon_channel();
        self.schedule_retry();
    }

    fn close(&mut self) {
        diag!(self.config.local, id = %self.id, state = %self.state, "close");
        self.retry.cancel();

        if self.state == ConnectionState::Initial && self.channel.is_none() {
            return;
        }

        self.set_state(ConnectionState::Closing);
        self.abandon_channel();

        // The released channel can no longer report its own close, so the
        // client-side close completes here
        self.on_close("io client disconnect".to_string());
    }

    /// Record the loss, stop the stability window, void any in-flight
    /// resolution and release the channel.
    fn abandon_channel(&mut self) {
        self.record_disconnection();
        self.stability.cancel();
        self.connect_attempt += 1;
        self.release_channel();
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.current();
        self.retry.arm(delay, &self.queue);
        self.metrics.record_retry_scheduled();
        info!(
            id = %self.id,
            delay_ms = delay.as_millis() as u64,
            "retry_scheduled"
        );
    }

    fn login(&mut self, enter: bool) -> bool {
        let (from, to) = if enter {
            (ConnectionState::Connected, ConnectionState::Login)
        } else {
            (ConnectionState::Login, ConnectionState::Connected)
        };
        if self.state != from {
            debug!(id = %self.id, state = %self.state, target = %to, "login_transition_ignored");
            return false;
        }
        self.set_state(to)
    }

    // -------------------------------------------------------------------------
    // onOpen . onError . onClose
    // -------------------------------------------------------------------------

    fn on_channel_event(&mut self, channel_id: u64, event: ChannelEvent) {
        let Some(channel) = self.channel.as_mut().filter(|c| c.id == channel_id) else {
            debug!(id = %self.id, channel_id, ?event, "stale_channel_event_ignored");
            return;
        };

        match event {
            ChannelEvent::Opened => {
                if channel.open {
                    return;
                }
                channel.open = true;
                self.on_open();
            }
            ChannelEvent::OpenFailed(error) => self.on_error(&error),
            ChannelEvent::Closed(reason) => self.on_close(format!("socket disconnect {reason}")),
            ChannelEvent::EngineClosed(reason) => {
                // Engine-level drops only count once the channel is up
                if channel.open {
                    self.on_close(format!("engine close: {reason}"));
                }
            }
        }
    }

    fn on_open(&mut self) {
        self.metrics.record_channel_opened();
        let reconnected = self.state == ConnectionState::Reconnecting;
        diag!(
            self.config.local,
            id = %self.id,
            "{}",
            if reconnected { "reconnected" } else { "connected" }
        );

        // The episode ends only after a reconnection survives the stability
        // window. A caller-driven connect leaves it open for the consumer.
        if reconnected {
            self.stability
                .arm(self.config.stability_period(), &self.queue);
        }

        self.set_state(ConnectionState::Connected);
    }

    /// Failed opens are logged only; the close that follows drives the retry.
    fn on_error(&self, error: &str) {
        self.metrics.record_open_failure();
        error!(id = %self.id, error = %error, "channel_open_error");
    }

    fn on_close(&mut self, reason: String) {
        diag!(self.config.local, id = %self.id, reason = %reason, "closed");
        self.record_disconnection();
        self.stability.cancel();

        match self.state {
            ConnectionState::Closing => {
                self.release_channel();
                self.set_state(ConnectionState::Initial);
            }
            ConnectionState::Reconnecting => {
                // A retry attempt failed
                self.metrics.record_unexpected_close();
                self.backoff.grow();
                self.release_channel();
                if !self.retry.is_armed() {
                    self.schedule_retry();
                }
            }
            _ => {
                self.metrics.record_unexpected_close();
                self.backoff.grow();
                self.reconnect();
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind, timer_id: u64) {
        match kind {
            TimerKind::Retry => {
                if !self.retry.take_fire(timer_id) {
                    debug!(id = %self.id, %kind, timer_id, "stale_timer_ignored");
                    return;
                }
                // A caller close wins over a retry that was already due
                if matches!(
                    self.state,
                    ConnectionState::Closing | ConnectionState::Initial
                ) {
                    debug!(id = %self.id, state = %self.state, "retry_after_close_ignored");
                    return;
                }
                self.connect(None);
            }
            TimerKind::Stability => {
                if !self.stability.take_fire(timer_id) {
                    debug!(id = %self.id, %kind, timer_id, "stale_timer_ignored");
                    return;
                }
                diag!(
                    self.config.local,
                    id = %self.id,
                    disconnected_at = ?self.episode.started_at(),
                    "stability_window_elapsed"
                );
                if self.state.is_connected() {
                    self.backoff.reset();
                    if let Some(since) = self.episode.clear() {
                        info!(id = %self.id, disconnected_at = %since, "connection_stable");
                    }
                    self.metrics.record_stable_recovery();
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // teardown
    // -------------------------------------------------------------------------

    /// Release the owned handle. Each step is attempted even if an earlier one
    /// failed; the reference is dropped regardless.
    fn release_channel(&mut self) {
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        diag!(self.config.local, id = %self.id, channel_id = channel.id, "releasing_channel");

        if let Err(e) = channel.handle.remove_all_listeners() {
            self.teardown_failed("remove_all_listeners", channel.id, &e);
        }
        if let Err(e) = channel.handle.off_any() {
            self.teardown_failed("off_any", channel.id, &e);
        }
        if let Err(e) = channel.handle.disconnect() {
            self.teardown_failed("disconnect", channel.id, &e);
        }
    }

    fn teardown_failed(&self, step: &'static str, channel_id: u64, error: &anyhow::Error) {
        self.metrics.record_teardown_failure();
        error!(id = %self.id, channel_id, step, error = %error, "teardown_step_failed");
    }

    fn record_disconnection(&mut self) {
        if self.episode.record(Utc::now()) {
            diag!(
                self.config.local,
                id = %self.id,
                disconnected_at = ?self.episode.started_at(),
                "disconnecting"
            );
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            state: self.state,
            current_delay: self.backoff.current(),
            disconnected_at: self.episode.started_at(),
            retry_pending: self.retry.is_armed(),
            stability_pending: self.stability.is_armed(),
            has_channel: self.channel.is_some(),
        }
    }
}
