//! Retrying an action until its expectations hold, or until they must be
//! seen never to hold
//!
//! Each attempt invokes the action to completion and checks every expectation
//! against the result. Between attempts the controller waits, starting from
//! the requested delay and squaring it each time (in milliseconds, capped at
//! one second). The time an attempt takes plus the upcoming delay is charged
//! against the remaining budget; when the budget cannot cover another full
//! delay, the remainder becomes the final delay so the last attempt lands at
//! the deadline.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, ExpectationError, FailureKind, Result};
use crate::expectation::{check_all, Expectation};
use crate::http::HttpResponse;

/// Upper bound for the delay between attempts
pub const MAX_DELAY: Duration = Duration::from_millis(1000);

/// Source of time for the poller
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Clock backed by tokio's timer, which honours `tokio::time::pause`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// What to poll for
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub expectations: Vec<Expectation>,
    pub delay: Duration,
    pub timeout: Duration,
    /// Succeed only if no attempt satisfies every expectation
    pub negate: bool,
}

/// Retry bookkeeping threaded through the loop
#[derive(Debug, Clone, Copy)]
struct PollState {
    delay: Duration,
    remaining: Duration,
    attempts: u32,
}

impl PollState {
    /// Charge an attempt that took `elapsed` and decide how long to wait
    /// before the next one, or `None` if the budget is spent.
    fn schedule(&mut self, elapsed: Duration) -> Option<Duration> {
        let left = match self.remaining.checked_sub(elapsed) {
            Some(left) if !left.is_zero() => left,
            _ => {
                self.remaining = Duration::ZERO;
                return None;
            }
        };
        let wait = match left.checked_sub(self.delay) {
            Some(rest) => {
                self.remaining = rest;
                self.delay
            }
            None => {
                self.remaining = Duration::ZERO;
                left
            }
        };
        self.delay = next_delay(wait);
        Some(wait)
    }
}

/// `min(delay², 1000)` with the delay in milliseconds
pub fn next_delay(delay: Duration) -> Duration {
    let ms = delay.as_millis();
    Duration::from_millis(ms.saturating_mul(ms).min(MAX_DELAY.as_millis()) as u64)
}

/// Invoke `action` until the expectations in `spec` are settled.
///
/// Normal mode returns the first result satisfying every expectation, or the
/// most recent failure once the budget runs out. Negate mode returns the last
/// result once the budget runs out without any attempt satisfying every
/// expectation, and fails immediately on the first attempt that does.
/// Transport errors from `action` are returned as-is without retrying.
pub async fn poll<F, Fut>(mut action: F, spec: &PollSpec, clock: &dyn Clock) -> Result<HttpResponse>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<HttpResponse>>,
{
    let mut state = PollState {
        delay: spec.delay,
        remaining: spec.timeout,
        attempts: 0,
    };

    loop {
        let started = clock.now();
        state.attempts += 1;
        let result = action().await?;

        let outcome = check_all(&spec.expectations, &result).await;
        debug!(
            attempt = state.attempts,
            negate = spec.negate,
            passed = outcome.is_ok(),
            "poll attempt"
        );

        let last_failure = match (outcome, spec.negate) {
            (Ok(()), false) => return Ok(result),
            (Ok(()), true) => return Err(succeeded_unexpectedly(spec).into()),
            (Err(err), _) => err,
        };

        match state.schedule(clock.now() - started) {
            Some(wait) => clock.sleep(wait).await,
            None if spec.negate => return Ok(result),
            None => return Err(Error::Expectation(last_failure)),
        }
    }
}

fn succeeded_unexpectedly(spec: &PollSpec) -> ExpectationError {
    let origin = spec
        .expectations
        .first()
        .map(|e| e.origin.clone())
        .unwrap_or_default();
    ExpectationError::new(
        FailureKind::SucceededUnexpectedly,
        "One or more expectations succeeded which should not have",
        origin,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_squares_and_caps() {
        assert_eq!(next_delay(Duration::from_millis(10)), Duration::from_millis(100));
        assert_eq!(next_delay(Duration::from_millis(100)), MAX_DELAY);
        assert_eq!(next_delay(Duration::from_millis(2)), Duration::from_millis(4));
        assert_eq!(next_delay(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_schedule_collapses_remaining_budget_into_last_delay() {
        let mut state = PollState {
            delay: Duration::from_millis(100),
            remaining: Duration::from_millis(150),
            attempts: 1,
        };
        assert_eq!(state.schedule(Duration::from_millis(20)), Some(Duration::from_millis(100)));
        assert_eq!(state.remaining, Duration::from_millis(30));
        // next delay is 1000ms, more than the 30ms left
        assert_eq!(state.schedule(Duration::ZERO), Some(Duration::from_millis(30)));
        assert_eq!(state.remaining, Duration::ZERO);
        assert_eq!(state.schedule(Duration::ZERO), None);
    }

    #[test]
    fn test_attempt_slower_than_budget_ends_polling() {
        let mut state = PollState {
            delay: Duration::from_millis(10),
            remaining: Duration::from_millis(190),
            attempts: 2,
        };
        assert_eq!(state.schedule(Duration::from_millis(300)), None);
        assert_eq!(state.remaining, Duration::ZERO);
    }

    #[test]
    fn test_zero_timeout_never_schedules() {
        let mut state = PollState {
            delay: Duration::from_millis(10),
            remaining: Duration::ZERO,
            attempts: 1,
        };
        assert_eq!(state.schedule(Duration::ZERO), None);
    }
}
