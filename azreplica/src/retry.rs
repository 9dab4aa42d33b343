//! Bounded retry with exponential backoff and jitter

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::model::{ActionResult, Outcome, TransferAction};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: std::time::Duration::from_millis(500),
            max_backoff: std::time::Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay after failed attempt number `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before the next attempt: the ceiling scaled by a random factor in [0.5, 1.0].
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let jitter = rand::rng().random_range(0.5..=1.0);
        self.ceiling(attempt).mul_f64(jitter)
    }
}

/// What a successful attempt produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub outcome: Outcome,
    pub bytes: u64,
}

impl Completion {
    pub fn succeeded(bytes: u64) -> Self {
        Self {
            outcome: Outcome::Succeeded,
            bytes,
        }
    }

    pub fn skipped() -> Self {
        Self {
            outcome: Outcome::SkippedExisting,
            bytes: 0,
        }
    }
}

/// Runs actions under the retry policy, turning every failure into a recorded result.
#[derive(Clone, Debug)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// Returns the last result and the number of attempts made. Cancellation stops waiting
    /// for the next attempt but never interrupts one in flight.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> (Result<T, TransferError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, TransferError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= max_attempts {
                return (Err(error), attempt);
            }
            let delay = self.policy.backoff(attempt);
            common::get_progress().retries.inc();
            tracing::warn!(
                attempt,
                max_attempts,
                delay = %humantime::format_duration(delay),
                "{what} failed, retrying: {error}"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return (Err(error), attempt),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Executes `action` through `attempt`, always producing a result.
    pub async fn run<F, Fut>(&self, action: &TransferAction, attempt: F) -> ActionResult
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Completion, TransferError>>,
    {
        let start = std::time::Instant::now();
        let what = action.to_string();
        let (result, attempts) = self.call(&what, attempt).await;
        let (outcome, bytes) = match result {
            Ok(completion) => (completion.outcome, completion.bytes),
            Err(TransferError::AlreadyExists) => (Outcome::SkippedExisting, 0),
            Err(error) => {
                tracing::error!("{what} failed after {attempts} attempt(s): {error}");
                (Outcome::Failed(error.to_string()), 0)
            }
        };
        ActionResult::for_action(action, outcome, attempts)
            .with_elapsed(start.elapsed())
            .with_bytes(bytes)
    }
}
