//! Retryable Action
//!
//! Runs one replica call, retrying transient failures with randomized
//! exponential backoff until a timeout elapses or the action is cancelled.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::replication::lock;

/// Failures kept for diagnostics
const MAX_FAILURES: usize = 4;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// A cancellable action with bounded retries
#[derive(Debug)]
pub struct RetryableAction {
    id: u64,
    initial_delay: Duration,
    timeout: Duration,
    started: AtomicBool,
    done: AtomicBool,
    cancelled: CancellationToken,
    cancel_reason: Mutex<Option<Error>>,
}

impl RetryableAction {
    /// Create an action. `initial_delay` bounds the first retry delay and
    /// must be at least one millisecond.
    pub fn new(initial_delay: Duration, timeout: Duration) -> Result<Self> {
        if initial_delay < Duration::from_millis(1) {
            return Err(Error::Config(format!(
                "initial delay was less than 1 millisecond: {:?}",
                initial_delay
            )));
        }

        Ok(Self {
            id: NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed),
            initial_delay,
            timeout,
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
            cancelled: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
        })
    }

    /// Unique ID of this action
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the action has completed, failed or been cancelled
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Complete the action with `reason`. Returns false if it already finished.
    pub fn cancel(&self, reason: Error) -> bool {
        // the reason is stored before the lock is released, so a runner that
        // loses the race always finds it
        let mut cancel_reason = lock(&self.cancel_reason);
        if !self.mark_done() {
            return false;
        }

        tracing::debug!("cancelling retryable action {}: {}", self.id, reason);
        *cancel_reason = Some(reason);
        drop(cancel_reason);
        self.cancelled.cancel();
        true
    }

    /// Run `attempt` until it succeeds, fails with an error `should_retry`
    /// rejects, the retry timeout elapses, or the action is cancelled.
    pub async fn run<T, F, Fut, S>(&self, mut attempt: F, should_retry: S) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        S: Fn(&Error) -> bool,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Internal(format!(
                "retryable action {} was already run",
                self.id
            )));
        }

        let start = Instant::now();
        let mut delay_bound = self.initial_delay;
        let mut failures: VecDeque<Error> = VecDeque::with_capacity(MAX_FAILURES);

        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancelled.cancelled() => return Err(self.take_cancel_reason()),
                outcome = attempt() => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    return if self.mark_done() {
                        Ok(value)
                    } else {
                        Err(self.take_cancel_reason())
                    };
                }
                Err(error) => error,
            };

            if !should_retry(&error) {
                return self.final_failure(error, failures);
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                tracing::debug!(
                    "retryable action {} timed out after {:?}: {}",
                    self.id,
                    elapsed,
                    error
                );
                return self.final_failure(error, failures);
            }

            let delay = random_delay(delay_bound);
            delay_bound = delay_bound.saturating_mul(2);
            tracing::debug!(
                "retrying action {} that failed in {:?}: {}",
                self.id,
                delay,
                error
            );
            remember(&mut failures, error);

            tokio::select! {
                biased;
                _ = self.cancelled.cancelled() => return Err(self.take_cancel_reason()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn mark_done(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn final_failure<T>(&self, error: Error, earlier: VecDeque<Error>) -> Result<T> {
        if !self.mark_done() {
            return Err(self.take_cancel_reason());
        }

        if !earlier.is_empty() {
            tracing::debug!(
                "retryable action {} failed: {} (suppressed {} earlier failures, most recent: {})",
                self.id,
                error,
                earlier.len(),
                earlier.front().map(|e| e.to_string()).unwrap_or_default()
            );
        }
        Err(error)
    }

    fn take_cancel_reason(&self) -> Error {
        lock(&self.cancel_reason)
            .take()
            .unwrap_or_else(|| Error::Internal(format!("retryable action {} cancelled", self.id)))
    }
}

/// Uniformly random delay in `[1ms, bound]`
fn random_delay(bound: Duration) -> Duration {
    let bound_ms = bound.as_millis().clamp(1, u64::MAX as u128) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(1..=bound_ms))
}

fn remember(failures: &mut VecDeque<Error>, error: Error) {
    if failures.len() == MAX_FAILURES {
        failures.pop_back();
    }
    failures.push_front(error);
}
