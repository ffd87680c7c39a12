use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    // Set while the single half-open trial call is in flight.
    trial_in_flight: bool,
}

/// Failure-counting circuit breaker.
///
/// After `failure_threshold` consecutive failures the breaker opens and
/// rejects calls outright. Once `reset_timeout` has elapsed the next caller
/// is admitted as a half-open trial; its outcome decides whether the breaker
/// closes again or re-opens for another full timeout.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

/// Outcome of asking the breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the call.
    Allowed,
    /// Breaker is open (or a half-open trial is already in flight).
    Rejected,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            failure_threshold,
            reset_timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask for admission. Must be paired with a later `record_success` or
    /// `record_failure` when `Allowed` is returned.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("circuit breaker half-open, admitting trial call");
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!("circuit breaker closing after successful call");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;

        match inner.state {
            BreakerState::HalfOpen => {
                // Failed trial re-opens for another full timeout.
                inner.state = BreakerState::Open;
                tracing::warn!("circuit breaker re-opened after failed trial call");
            }
            BreakerState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = BreakerState::Open;
                tracing::warn!(
                    failures = inner.failure_count,
                    "circuit breaker opened after consecutive failures"
                );
            }
            _ => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Lock is never held across an await point; poisoning means a panic
        // while mutating plain counters, which is unrecoverable anyway.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        for _ in 0..2 {
            assert_eq!(breaker.try_acquire(), Admission::Allowed);
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        assert_eq!(breaker.try_acquire(), Admission::Allowed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(breaker.try_acquire(), Admission::Allowed);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Second caller while the trial is outstanding is turned away.
        assert_eq!(breaker.try_acquire(), Admission::Rejected);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);

        // A further full timeout earns another trial.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
    }
}
