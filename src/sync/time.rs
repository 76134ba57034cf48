use std::{
    sync::{
        LazyLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Process-local monotonic epoch. All internal timestamps are microsecond
/// offsets from this instant, which keeps them in a single `u64`.
pub(crate) static LOCAL_EPOCH: LazyLock<quanta::Instant> = LazyLock::new(quanta::Instant::now);

/// Microseconds elapsed since [`LOCAL_EPOCH`].
#[inline]
pub(crate) fn now_micros() -> u64 {
    LOCAL_EPOCH.elapsed().as_micros() as u64
}

/// A `Duration` with microsecond resolution that can be updated atomically,
/// used for timeouts that stay tunable while a background task is running.
pub(crate) struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    pub(crate) fn new(duration: Duration) -> Self {
        Self(AtomicU64::new(duration.as_micros() as u64))
    }

    pub(crate) fn store(&self, duration: Duration, order: Ordering) {
        self.0.store(duration.as_micros() as u64, order);
    }

    pub(crate) fn load(&self, order: Ordering) -> Duration {
        Duration::from_micros(self.0.load(order))
    }
}
