//! Bounded polling used for every asynchronous chain condition.
//!
//! The primitives never fail on timeout: they report `false`/`None` and leave
//! escalation to the caller.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::trace;

/// Timeout and cadence of a polling loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Evaluates `predicate` every `interval` until it returns `true` or `timeout` elapses.
///
/// The predicate is always evaluated at least once, and once more right at the
/// deadline, so a zero timeout degenerates into a single check.
pub async fn wait_for_bool<F, Fut>(predicate: F, timeout: Duration, interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut predicate = predicate;
    wait_for_value(
        move || {
            let fut = predicate();
            async move { fut.await.then_some(()) }
        },
        timeout,
        interval,
    )
    .await
    .is_some()
}

/// Like [`wait_for_bool`] but hands back the first `Some` produced by `probe`.
pub async fn wait_for_value<T, F, Fut>(mut probe: F, timeout: Duration, interval: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        if let Some(value) = probe().await {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            trace!(target = "harness::poll", attempts, ?timeout, "condition not met before deadline");
            return None;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Retries `attempt` with doubling delays, starting at `initial_delay` and
/// capped at `max_delay`, until it yields `Some` or `window` has elapsed.
pub async fn retry_with_backoff<T, F, Fut>(
    mut attempt: F,
    window: Duration,
    initial_delay: Duration,
    max_delay: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + window;
    let mut delay = initial_delay;
    loop {
        if let Some(value) = attempt().await {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(max_delay);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn returns_true_once_predicate_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = wait_for_bool(
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;
        assert!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_is_reported_as_false() {
        let started = std::time::Instant::now();
        let result = wait_for_bool(|| async { false }, Duration::from_millis(120), Duration::from_millis(20)).await;
        assert!(!result);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn never_polls_faster_than_interval() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        wait_for_bool(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    false
                }
            },
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
        .await;
        // one initial check plus at most one per elapsed interval
        assert!(calls.load(Ordering::SeqCst) <= 6, "polled {} times", calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_timeout_checks_once() {
        let value = wait_for_value(|| async { Some(7) }, Duration::ZERO, Duration::from_millis(10)).await;
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn backoff_gives_up_after_window() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Option<()> = retry_with_backoff(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    None
                }
            },
            Duration::from_millis(150),
            Duration::from_millis(10),
            Duration::from_millis(40),
        )
        .await;
        assert!(result.is_none());
        let attempts = calls.load(Ordering::SeqCst);
        assert!((3..=10).contains(&attempts), "attempts = {attempts}");
    }
}
