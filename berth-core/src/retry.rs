//! Exponential backoff for retryable infrastructure operations.
//!
//! Commit uses this to absorb optimistic-concurrency conflicts: the
//! interval starts small, grows by a fixed factor, and is jittered so
//! concurrent committers do not reconverge in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Backoff policy. The defaults match the commit retry loop: 10ms initial
/// interval growing tenfold per attempt, capped at 30s per wait and one
/// minute of total elapsed time, with ±50% jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    /// Each wait is drawn uniformly from `interval * (1 ± randomization)`.
    pub randomization: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(10),
            multiplier: 10.0,
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(60),
            randomization: 0.5,
        }
    }
}

impl Backoff {
    fn jittered(&self, interval: Duration) -> Duration {
        if self.randomization <= 0.0 {
            return interval;
        }
        let base = interval.as_secs_f64();
        let delta = base * self.randomization;
        let wait = rand::rng().random_range((base - delta)..=(base + delta));
        Duration::from_secs_f64(wait.max(0.0))
    }

    fn next_interval(&self, interval: Duration) -> Duration {
        let grown = interval.as_secs_f64() * self.multiplier;
        Duration::from_secs_f64(grown).min(self.max_interval)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's elapsed budget runs out. `retryable` decides which errors are
/// worth another attempt; the last error is returned on exhaustion.
///
/// # Errors
/// Returns the first non-retryable error, or the final error once
/// `max_elapsed` has passed.
///
/// # Cancel Safety
/// Dropping the returned future between attempts abandons the retry loop
/// without side effects beyond those of attempts already completed.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: Backoff,
    mut op: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut interval = policy.initial_interval;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => {
                if started.elapsed() >= policy.max_elapsed {
                    tracing::debug!(attempt, "retry budget exhausted");
                    return Err(e);
                }
                let wait = policy.jittered(interval);
                tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying");
                tokio::time::sleep(wait).await;
                interval = policy.next_interval(interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    fn fast_policy() -> Backoff {
        Backoff {
            initial_interval: Duration::from_millis(1),
            multiplier: 1.0,
            max_interval: Duration::from_millis(1),
            max_elapsed: Duration::from_millis(200),
            randomization: 0.0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(
            fast_policy(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(TestError::Transient)
                    } else {
                        Ok(n)
                    }
                }
            },
            |e| matches!(e, TestError::Transient),
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            fast_policy(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            },
            |e| matches!(e, TestError::Transient),
        )
        .await;
        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_budget_bounds_the_loop() {
        let result: Result<(), _> = retry_with_backoff(
            Backoff {
                max_elapsed: Duration::from_secs(1),
                ..Backoff::default()
            },
            || async { Err(TestError::Transient) },
            |e| matches!(e, TestError::Transient),
        )
        .await;
        assert_eq!(result, Err(TestError::Transient));
    }

    #[test]
    fn interval_growth_is_capped() {
        let policy = Backoff::default();
        let mut interval = policy.initial_interval;
        for _ in 0..10 {
            interval = policy.next_interval(interval);
        }
        assert_eq!(interval, policy.max_interval);
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = Backoff::default();
        let interval = Duration::from_millis(100);
        for _ in 0..100 {
            let wait = policy.jittered(interval);
            assert!(wait >= Duration::from_millis(50), "wait {wait:?} below band");
            assert!(wait <= Duration::from_millis(150), "wait {wait:?} above band");
        }
    }
}
