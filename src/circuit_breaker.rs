use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    // only one trial call may be in flight while half-open
    HalfOpen { successes: u32, probing: bool },
}

/// Per-provider breaker. Consecutive failures open it; after `reset_timeout`
/// one trial call is let through.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.state.lock() {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Time left before an open breaker admits a trial call.
    pub fn retry_after(&self) -> Option<Duration> {
        match *self.state.lock() {
            State::Open { opened_at } => Some(
                self.config
                    .reset_timeout
                    .saturating_sub(opened_at.elapsed()),
            ),
            _ => None,
        }
    }

    pub fn should_allow_call(&self) -> bool {
        self.admit().is_some()
    }

    /// Admits a call and returns a permit for recording its outcome. A permit
    /// dropped without an outcome releases its half-open trial slot, so an
    /// aborted caller cannot keep the breaker half-open.
    pub fn acquire(&self) -> Option<CallPermit<'_>> {
        self.admit().map(|trial| CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    // Some(true) when the admitted call is the half-open trial
    fn admit(&self) -> Option<bool> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { .. } => Some(false),
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    tracing::info!("circuit breaker half-open, allowing trial call");
                    *state = State::HalfOpen {
                        successes: 0,
                        probing: true,
                    };
                    Some(true)
                } else {
                    None
                }
            }
            State::HalfOpen { probing, .. } => {
                if *probing {
                    None
                } else {
                    *probing = true;
                    Some(true)
                }
            }
        }
    }

    pub fn success(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { failures } => *failures = 0,
            State::HalfOpen { successes, probing } => {
                *successes += 1;
                *probing = false;
                if *successes >= self.config.success_threshold {
                    tracing::info!("circuit breaker closed");
                    *state = State::Closed { failures: 0 };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn fail(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    tracing::warn!(failures = *failures, "circuit breaker opened");
                    *state = State::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            State::HalfOpen { .. } => {
                tracing::warn!("trial call failed, circuit breaker re-opened");
                *state = State::Open {
                    opened_at: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Releases a half-open trial slot without recording an outcome, e.g.
    /// when the caller gave up before the call finished.
    pub fn abandon(&self) {
        if let State::HalfOpen { probing, .. } = &mut *self.state.lock() {
            *probing = false;
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = State::Closed { failures: 0 };
    }
}

#[must_use]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.success();
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.fail();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(4),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_recovers() {
        let cb = breaker(3);

        for _ in 0..2 {
            assert!(cb.should_allow_call());
            cb.fail();
        }
        assert!(cb.is_closed());

        cb.fail();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow_call());
        assert!(cb.retry_after().is_some());

        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(cb.should_allow_call());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // single trial
        assert!(!cb.should_allow_call());

        cb.success();
        assert!(cb.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(1);
        cb.fail();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(cb.should_allow_call());
        cb.fail();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow_call());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3);
        cb.fail();
        cb.fail();
        cb.success();
        cb.fail();
        cb.fail();
        assert!(cb.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let cb = breaker(1);
        cb.fail();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(cb.should_allow_call());
        cb.abandon();
        assert!(cb.should_allow_call());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_frees_slot() {
        let cb = breaker(1);
        cb.fail();
        tokio::time::advance(Duration::from_secs(5)).await;

        let permit = cb.acquire();
        assert!(permit.is_some());
        assert!(cb.acquire().is_none());

        drop(permit);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let permit = cb.acquire().unwrap();
        permit.success();
        assert!(cb.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_closed_permit_leaves_trial_alone() {
        let cb = breaker(1);
        let stale = cb.acquire().unwrap();

        cb.fail();
        tokio::time::advance(Duration::from_secs(5)).await;
        let trial = cb.acquire().unwrap();

        // a permit taken while closed must not release someone else's trial
        drop(stale);
        assert!(cb.acquire().is_none());

        trial.fail();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
