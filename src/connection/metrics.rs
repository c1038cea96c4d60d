//! Manager counters for monitoring

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub connect_attempts: AtomicU64,
    pub channels_opened: AtomicU64,
    pub open_failures: AtomicU64,
    pub resolve_failures: AtomicU64,
    pub unexpected_closes: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub stable_recoveries: AtomicU64,
    pub teardown_failures: AtomicU64,
}

/// Point-in-time copy of [`ManagerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerMetricsSnapshot {
    pub connect_attempts: u64,
    pub channels_opened: u64,
    pub open_failures: u64,
    pub resolve_failures: u64,
    pub unexpected_closes: u64,
    pub retries_scheduled: u64,
    pub stable_recoveries: u64,
    pub teardown_failures: u64,
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_unexpected_close(&self) {
        self.unexpected_closes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_stable_recovery(&self) {
        self.stable_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_teardown_failure(&self) {
        self.teardown_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerMetricsSnapshot {
        ManagerMetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            unexpected_closes: self.unexpected_closes.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            stable_recoveries: self.stable_recoveries.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
        }
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "connects={}/{} open_failures={} resolve_failures={} unexpected_closes={} retries={} recoveries={} teardown_failures={}",
            s.channels_opened,
            s.connect_attempts,
            s.open_failures,
            s.resolve_failures,
            s.unexpected_closes,
            s.retries_scheduled,
            s.stable_recoveries,
            s.teardown_failures,
        )
    }
}
