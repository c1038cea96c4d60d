//! Lifecycle tests for the connection manager
//!
//! The transport and resolver are in-memory mocks; the tests drive channel
//! events by hand and move time with tokio's paused clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Notify};
use tokio::time::sleep;

use wsio_client::connection::{
    ChannelFactory, ChannelHandle, ChannelListener, ChannelOptions, ConnectionManager,
    ConnectionParams, ConnectionResolver, ConnectionState, ManagerConfig, ManagerSnapshot,
};

// =============================================================================
// MOCKS
// =============================================================================

#[derive(Default)]
struct MockResolver {
    calls: AtomicUsize,
    fail: AtomicBool,
    held: AtomicBool,
    gate: Notify,
}

impl MockResolver {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }
}

#[async_trait]
impl ConnectionResolver for MockResolver {
    async fn resolve(&self) -> Result<ConnectionParams> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.held.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("credentials unavailable");
        }
        Ok(ConnectionParams::new("wss://h", "/ws"))
    }
}

type CallLog = Arc<Mutex<Vec<&'static str>>>;

struct OpenedChannel {
    listener: ChannelListener,
    params: ConnectionParams,
    calls: CallLog,
}

/// Keeps every listener it hands out, like a transport that keeps firing
/// callbacks after the manager let go of it.
#[derive(Default)]
struct MockFactory {
    opened: Mutex<Vec<OpenedChannel>>,
    fail_remove_listeners: AtomicBool,
}

impl MockFactory {
    fn count(&self) -> usize {
        self.opened.lock().len()
    }

    fn listener(&self, index: usize) -> ChannelListener {
        self.opened.lock()[index].listener.clone()
    }

    fn last(&self) -> ChannelListener {
        let opened = self.opened.lock();
        opened.last().expect("no channel opened").listener.clone()
    }

    fn params(&self, index: usize) -> ConnectionParams {
        self.opened.lock()[index].params.clone()
    }

    fn calls(&self, index: usize) -> Vec<&'static str> {
        self.opened.lock()[index].calls.lock().clone()
    }
}

impl ChannelFactory for MockFactory {
    fn open(
        &self,
        params: &ConnectionParams,
        _options: &ChannelOptions,
        listener: ChannelListener,
    ) -> Result<Box<dyn ChannelHandle>> {
        let calls = CallLog::default();
        self.opened.lock().push(OpenedChannel {
            listener,
            params: params.clone(),
            calls: calls.clone(),
        });
        Ok(Box::new(MockHandle {
            calls,
            fail_remove: self.fail_remove_listeners.load(Ordering::SeqCst),
        }))
    }
}

struct MockHandle {
    calls: CallLog,
    fail_remove: bool,
}

impl ChannelHandle for MockHandle {
    fn remove_all_listeners(&mut self) -> Result<()> {
        self.calls.lock().push("remove_all_listeners");
        if self.fail_remove {
            bail!("socket already gone");
        }
        Ok(())
    }

    fn off_any(&mut self) -> Result<()> {
        self.calls.lock().push("off_any");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.calls.lock().push("disconnect");
        Ok(())
    }
}

// =============================================================================
// HARNESS
// =============================================================================

const TEARDOWN: [&str; 3] = ["remove_all_listeners", "off_any", "disconnect"];

struct Harness {
    manager: Arc<ConnectionManager>,
    resolver: Arc<MockResolver>,
    factory: Arc<MockFactory>,
}

impl Harness {
    fn new() -> Self {
        Self::with_factory(MockFactory::default())
    }

    fn with_factory(factory: MockFactory) -> Self {
        let resolver = Arc::new(MockResolver::default());
        let factory = Arc::new(factory);
        let config = ManagerConfig {
            id: "test-client".to_string(),
            initial_reconnect_period_ms: 1_000,
            reconnect_increment_ms: 500,
            max_reconnect_period_ms: 3_000,
            stability_period_ms: 200,
            ..Default::default()
        };
        let manager = ConnectionManager::spawn(config, resolver.clone(), factory.clone())
            .expect("valid config");
        Self {
            manager: Arc::new(manager),
            resolver,
            factory,
        }
    }

    async fn snapshot(&self) -> ManagerSnapshot {
        self.manager.snapshot().await.expect("manager running")
    }

    async fn connect_and_open(&self) {
        self.manager.connect().await;
        self.factory.last().opened();
        assert_eq!(self.snapshot().await.state, ConnectionState::Connected);
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn drain(signal: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(state) = signal.try_recv() {
        seen.push(state);
    }
    seen
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_initial_connect_reaches_connected_without_stability_timer() {
    let h = Harness::new();
    let mut signal = h.manager.subscribe();
    assert_eq!(h.manager.state(), ConnectionState::Initial);

    h.manager.connect().await;
    assert_eq!(h.factory.count(), 1);
    assert_eq!(h.factory.params(0), ConnectionParams::new("wss://h", "/ws"));
    assert_eq!(h.manager.state(), ConnectionState::Connecting);

    h.factory.last().opened();
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Connected);
    assert!(!snap.stability_pending);
    assert!(!snap.retry_pending);
    assert!(snap.disconnected_at.is_none());
    assert!(h.manager.is_connected());

    assert_eq!(
        drain(&mut signal),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_schedules_retry_with_grown_delay() {
    let h = Harness::new();
    h.connect_and_open().await;

    h.factory.last().closed("transport-error");
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Reconnecting);
    assert_eq!(snap.current_delay, ms(1_500));
    assert!(snap.retry_pending);
    assert!(!snap.has_channel);
    assert_eq!(h.factory.calls(0), TEARDOWN);

    // Stamped with the 20s margin
    let at = snap.disconnected_at.expect("episode started");
    let age = Utc::now() - at;
    assert!(age >= chrono::Duration::seconds(19) && age <= chrono::Duration::seconds(21));

    sleep(ms(1_400)).await;
    assert_eq!(h.factory.count(), 1);

    sleep(ms(101)).await;
    assert_eq!(h.factory.count(), 2);
    assert_eq!(h.resolver.calls(), 2);
    assert_eq!(h.manager.state(), ConnectionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_stable_reconnection_resets_backoff_and_episode() {
    let h = Harness::new();
    h.connect_and_open().await;
    h.factory.last().closed("transport-error");
    sleep(ms(1_501)).await;
    assert_eq!(h.factory.count(), 2);

    h.factory.last().opened();
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Connected);
    assert!(snap.stability_pending);
    assert_eq!(snap.current_delay, ms(1_500));
    assert!(snap.disconnected_at.is_some());
    assert!(snap.audit_since().is_some());

    sleep(ms(201)).await;
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Connected);
    assert!(!snap.stability_pending);
    assert_eq!(snap.current_delay, ms(1_000));
    assert!(snap.disconnected_at.is_none());
    assert_eq!(h.manager.metrics().snapshot().stable_recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_loss_during_stability_window_keeps_episode() {
    let h = Harness::new();
    h.connect_and_open().await;
    h.factory.last().closed("transport-error");
    sleep(ms(1_501)).await;
    h.factory.last().opened();

    let first = h.snapshot().await.disconnected_at;
    assert!(first.is_some());

    sleep(ms(100)).await;
    h.factory.last().closed("transport-error");
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Reconnecting);
    assert!(!snap.stability_pending);
    assert!(snap.retry_pending);
    assert_eq!(snap.current_delay, ms(2_000));
    assert_eq!(snap.disconnected_at, first);

    // The cancelled window never resets anything
    sleep(ms(250)).await;
    let snap = h.snapshot().await;
    assert_eq!(snap.current_delay, ms(2_000));
    assert_eq!(snap.disconnected_at, first);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_while_reconnecting_is_noop() {
    let h = Harness::new();
    h.connect_and_open().await;
    let mut signal = h.manager.subscribe();

    h.manager.reconnect().await;
    assert_eq!(drain(&mut signal), vec![ConnectionState::Reconnecting]);
    assert_eq!(h.factory.calls(0), TEARDOWN);

    h.manager.reconnect().await;
    assert!(matches!(signal.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.manager.metrics().snapshot().retries_scheduled, 1);

    // A manual reconnect does not grow the delay
    let snap = h.snapshot().await;
    assert_eq!(snap.current_delay, ms(1_000));

    sleep(ms(1_001)).await;
    assert_eq!(h.factory.count(), 2);

    sleep(ms(5_000)).await;
    assert_eq!(h.factory.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_while_reconnecting_cancels_retry() {
    let h = Harness::new();
    h.connect_and_open().await;
    h.factory.last().closed("transport-error");
    assert!(h.snapshot().await.retry_pending);

    let mut signal = h.manager.subscribe();
    h.manager.close().await;
    assert_eq!(
        drain(&mut signal),
        vec![ConnectionState::Closing, ConnectionState::Initial]
    );

    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Initial);
    assert!(!snap.retry_pending);

    sleep(ms(10_000)).await;
    assert_eq!(h.factory.count(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Initial);
}

#[tokio::test(start_paused = true)]
async fn test_close_from_connected_settles_initial() {
    let h = Harness::new();
    h.connect_and_open().await;
    let mut signal = h.manager.subscribe();

    h.manager.close().await;
    assert_eq!(
        drain(&mut signal),
        vec![ConnectionState::Closing, ConnectionState::Initial]
    );
    assert_eq!(h.factory.calls(0), TEARDOWN);

    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Initial);
    assert!(!snap.retry_pending);
    assert!(snap.disconnected_at.is_some());
    assert_eq!(h.manager.metrics().snapshot().unexpected_closes, 0);

    // The released channel reporting its close changes nothing
    h.factory.listener(0).closed("io client disconnect");
    sleep(ms(10_000)).await;
    assert_eq!(h.manager.state(), ConnectionState::Initial);
    assert_eq!(h.factory.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_when_idle_emits_nothing() {
    let h = Harness::new();
    let mut signal = h.manager.subscribe();

    h.manager.close().await;
    assert!(drain(&mut signal).is_empty());
    assert_eq!(h.manager.state(), ConnectionState::Initial);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_close_keeps_episode_open() {
    let h = Harness::new();
    h.connect_and_open().await;
    h.manager.close().await;
    let since = h.snapshot().await.disconnected_at;
    assert!(since.is_some());

    // A caller-driven connect is not a reconnection
    h.connect_and_open().await;
    let snap = h.snapshot().await;
    assert!(!snap.stability_pending);
    assert_eq!(snap.disconnected_at, since);

    sleep(ms(1_000)).await;
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Connected);
    assert_eq!(snap.disconnected_at, since);
    assert_eq!(h.manager.metrics().snapshot().stable_recoveries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stability_window_counts_login_as_connected() {
    let h = Harness::new();
    h.connect_and_open().await;
    h.factory.last().closed("transport-error");
    sleep(ms(1_501)).await;
    h.factory.last().opened();
    assert!(h.snapshot().await.stability_pending);

    assert!(h.manager.begin_login().await);
    sleep(ms(201)).await;

    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Login);
    assert!(!snap.stability_pending);
    assert_eq!(snap.current_delay, ms(1_000));
    assert!(snap.disconnected_at.is_none());
    assert_eq!(h.manager.metrics().snapshot().stable_recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_grow_delay_up_to_ceiling() {
    let h = Harness::new();
    h.manager.connect().await;

    let mut previous = Duration::ZERO;
    let mut episode_start = None;
    for _ in 0..8 {
        let listener = h.factory.last();
        listener.open_failed("connection refused");
        listener.closed("transport close");

        let snap = h.snapshot().await;
        assert_eq!(snap.state, ConnectionState::Reconnecting);
        assert!(snap.retry_pending);
        assert!(snap.current_delay >= previous);
        assert!(snap.current_delay <= ms(3_000));
        match episode_start {
            None => episode_start = snap.disconnected_at,
            Some(at) => assert_eq!(snap.disconnected_at, Some(at)),
        }
        previous = snap.current_delay;

        sleep(snap.current_delay + ms(1)).await;
    }

    assert_eq!(previous, ms(3_000));
    assert_eq!(h.factory.count(), 9);
    let metrics = h.manager.metrics().snapshot();
    assert_eq!(metrics.open_failures, 8);
    assert_eq!(metrics.unexpected_closes, 8);
}

#[tokio::test(start_paused = true)]
async fn test_resolver_failure_routes_to_reconnect() {
    let h = Harness::new();
    h.resolver.set_failing(true);

    h.manager.connect().await;
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Reconnecting);
    assert!(snap.retry_pending);
    assert!(!snap.has_channel);
    assert_eq!(h.factory.count(), 0);
    assert_eq!(h.manager.metrics().snapshot().resolve_failures, 1);

    h.resolver.set_failing(false);
    sleep(snap.current_delay + ms(1)).await;
    assert_eq!(h.factory.count(), 1);

    h.factory.last().opened();
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Connected);
    assert!(snap.stability_pending);
}

#[tokio::test(start_paused = true)]
async fn test_stale_events_from_released_channel_are_ignored() {
    let h = Harness::new();
    h.connect_and_open().await;
    h.factory.last().closed("transport-error");
    sleep(ms(1_501)).await;
    assert_eq!(h.factory.count(), 2);

    let old = h.factory.listener(0);
    old.opened();
    old.closed("late close");
    old.engine_closed("late engine close");

    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Reconnecting);
    assert!(snap.has_channel);
    assert!(!snap.retry_pending);
    assert_eq!(snap.current_delay, ms(1_500));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_continues_when_a_step_fails() {
    let factory = MockFactory::default();
    factory.fail_remove_listeners.store(true, Ordering::SeqCst);
    let h = Harness::with_factory(factory);
    h.connect_and_open().await;

    h.factory.last().closed("transport-error");
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Reconnecting);
    assert!(!snap.has_channel);
    assert_eq!(h.factory.calls(0), TEARDOWN);
    assert_eq!(h.manager.metrics().snapshot().teardown_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_engine_close_only_counts_once_open() {
    let h = Harness::new();
    h.manager.connect().await;

    h.factory.last().engine_closed("transport close");
    assert_eq!(h.snapshot().await.state, ConnectionState::Connecting);

    h.factory.last().opened();
    h.factory.last().engine_closed("ping timeout");
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Reconnecting);
    assert_eq!(snap.current_delay, ms(1_500));
}

#[tokio::test(start_paused = true)]
async fn test_open_error_alone_does_not_transition() {
    let h = Harness::new();
    h.manager.connect().await;

    h.factory.last().open_failed("connection refused");
    let snap = h.snapshot().await;
    assert_eq!(snap.state, ConnectionState::Connecting);
    assert!(!snap.retry_pending);
    assert!(snap.has_channel);
    assert_eq!(h.manager.metrics().snapshot().open_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_login_phase() {
    let h = Harness::new();
    assert!(!h.manager.begin_login().await);

    h.connect_and_open().await;
    assert!(!h.manager.finish_login().await);

    assert!(h.manager.begin_login().await);
    assert_eq!(h.manager.state(), ConnectionState::Login);
    assert!(h.manager.is_connected());
    assert!(h.manager.finish_login().await);
    assert_eq!(h.manager.state(), ConnectionState::Connected);

    assert!(h.manager.begin_login().await);
    h.factory.last().closed("transport-error");
    assert_eq!(h.snapshot().await.state, ConnectionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_close_voids_pending_resolution() {
    let h = Harness::new();
    h.resolver.hold();

    let manager = h.manager.clone();
    let pending = tokio::spawn(async move { manager.connect().await });
    sleep(ms(10)).await;
    assert_eq!(h.manager.state(), ConnectionState::Connecting);
    assert_eq!(h.resolver.calls(), 1);

    h.manager.close().await;
    assert_eq!(h.manager.state(), ConnectionState::Initial);

    h.resolver.release();
    pending.await.unwrap();

    assert_eq!(h.factory.count(), 0);
    assert_eq!(h.manager.state(), ConnectionState::Initial);
}

#[tokio::test(start_paused = true)]
async fn test_drop_releases_channel() {
    let h = Harness::new();
    h.connect_and_open().await;

    let factory = h.factory.clone();
    drop(h);
    sleep(ms(10)).await;

    assert_eq!(factory.calls(0), TEARDOWN);
}
