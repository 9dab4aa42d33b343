//! Admission control and rate limiting for replication runs
//!
//! This crate bounds how much work a replication run puts on the storage data-planes at once.
//! Large accounts can hold millions of entries; without a process-wide bound, fanning out
//! across every container, table and share would open an unbounded number of connections and
//! quickly trip the service's throttling.
//!
//! # Overview
//!
//! Two independent limits are provided:
//!
//! 1. **In-flight actions** - the maximum number of transfer actions executing concurrently
//!    across the whole process, regardless of which resource they belong to
//! 2. **Request throttle** - the number of data-plane requests allowed per second
//!
//! Both are disabled until configured; a disabled limit never blocks.
//!
//! # Usage Patterns
//!
//! ## In-flight actions
//!
//! ```rust,no_run
//! use throttle::{set_max_in_flight, in_flight_permit};
//!
//! # async fn example() {
//! set_max_in_flight(64);
//!
//! // Acquire before executing an action - released when the guard is dropped
//! let _guard = in_flight_permit().await;
//! # }
//! ```
//!
//! ## Request throttling
//!
//! ```rust,no_run
//! use throttle::{init_request_tokens, run_request_replenish_thread, get_request_token};
//! use std::time::Duration;
//!
//! # async fn example() {
//! // 200 requests per second: 20 tokens every 100ms
//! init_request_tokens(20);
//! tokio::spawn(run_request_replenish_thread(20, Duration::from_millis(100)));
//!
//! // Acquire a token before each request
//! get_request_token().await;
//! # }
//! ```
//!
//! # Replenishment Strategy
//!
//! Request tokens are replenished by a background task that tops the bucket back up to
//! `tokens_per_interval` every interval. Unused tokens do not accumulate beyond that, so a
//! burst after an idle period is bounded by a single interval's worth of requests.

mod semaphore;

static IN_FLIGHT_LIMIT: semaphore::Semaphore = semaphore::Semaphore::new();
static REQUEST_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();

/// Limits the number of actions executing at the same time (0 = unlimited).
pub fn set_max_in_flight(max_in_flight: usize) {
    IN_FLIGHT_LIMIT.setup(max_in_flight);
}

pub struct InFlightGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn in_flight_permit() -> InFlightGuard {
    InFlightGuard {
        _permit: IN_FLIGHT_LIMIT.acquire().await,
    }
}

pub fn init_request_tokens(tokens: usize) {
    REQUEST_THROTTLE.setup(tokens);
}

pub async fn get_request_token() {
    REQUEST_THROTTLE.consume().await;
}

pub async fn run_request_replenish_thread(replenish: usize, interval: std::time::Duration) {
    REQUEST_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}

/// Splits a requests-per-second target into a (tokens, interval) pair.
///
/// Small rates are replenished once per second; larger rates are spread over 100ms intervals
/// to avoid bursting the whole second's budget at once.
#[must_use]
pub fn replenish_schedule(requests_per_second: usize) -> (usize, std::time::Duration) {
    if requests_per_second >= 10 {
        (
            requests_per_second / 10,
            std::time::Duration::from_millis(100),
        )
    } else {
        (requests_per_second, std::time::Duration::from_secs(1))
    }
}
