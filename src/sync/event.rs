use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use event_listener::Event;

const CLOSED_ERR_STR: &str = "Signal closed";

/// Error returned when a wait fails because the signal was closed.
pub struct Closed;

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl fmt::Debug for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(CLOSED_ERR_STR)
    }
}

impl std::error::Error for Closed {}

/// A broadcast condition signal.
///
/// A `Signal` pairs an [`event_listener::Event`] with caller-held state: a
/// waiter passes a predicate over that state, and `notify()` is called after
/// every state change that could satisfy one. All waiters are woken on each
/// notification and re-evaluate their own predicate, so any number of tasks
/// can wait on the same signal for different conditions (each drain task
/// waits for its own next buffer; the producer waits for a recycled slot).
///
/// Closing the signal makes every pending and future wait return [`Closed`].
pub(crate) struct Signal {
    event: Event,
    closed: AtomicBool,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            event: Event::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Wakes every waiter so it can re-check its predicate.
    #[inline]
    pub(crate) fn notify(&self) {
        self.event.notify(usize::MAX);
    }

    /// Closes the signal, failing all pending and future waits.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.event.notify(usize::MAX);
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until `cond` yields a value.
    ///
    /// The predicate is checked before registering a listener and re-checked
    /// after registration, so a notification racing the registration is never
    /// lost.
    pub(crate) async fn wait_until<T>(&self, mut cond: impl FnMut() -> Option<T>) -> Result<T, Closed> {
        loop {
            if self.is_closed() {
                return Err(Closed);
            }
            if let Some(value) = cond() {
                return Ok(value);
            }

            let listener = self.event.listen();

            if self.is_closed() {
                return Err(Closed);
            }
            if let Some(value) = cond() {
                return Ok(value);
            }

            listener.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_basic_notify_wait() {
        // Basic notification and wait on a shared counter
        let signal = Arc::new(Signal::new());
        let state = Arc::new(AtomicUsize::new(0));

        let c_signal = signal.clone();
        let c_state = state.clone();
        let wait_task = tokio::spawn(async move {
            c_signal
                .wait_until(|| (c_state.load(Ordering::Acquire) > 0).then_some(()))
                .await
                .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        state.store(1, Ordering::Release);
        signal.notify();

        wait_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_condition_already_met() {
        // A predicate that already holds returns without waiting
        let signal = Signal::new();

        let result = timeout(Duration::from_millis(100), signal.wait_until(|| Some(42))).await;
        assert_eq!(result.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_all_waiters_woken() {
        // Every waiter re-checks its own predicate on a single notify
        let signal = Arc::new(Signal::new());
        let state = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let c_signal = signal.clone();
            let c_state = state.clone();
            tasks.push(tokio::spawn(async move {
                c_signal
                    .wait_until(|| (c_state.load(Ordering::Acquire) == 7).then_some(()))
                    .await
                    .unwrap();
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        state.store(7, Ordering::Release);
        signal.notify();

        for task in tasks {
            timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_fails_pending_wait() {
        let signal = Arc::new(Signal::new());

        let c_signal = signal.clone();
        let wait_task = tokio::spawn(async move { c_signal.wait_until(|| None::<()>).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.close();

        let result = wait_task.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_fails_future_wait() {
        let signal = Signal::new();
        signal.close();

        let result = signal.wait_until(|| Some(())).await;
        assert!(result.is_err());
    }
}
