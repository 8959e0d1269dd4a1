//! Three-state circuit breaker guarding the load client's send path.
//!
//! CLOSED counts consecutive failures; OPEN rejects everything until the
//! timer expires; HALF_OPEN admits traffic and closes after enough
//! consecutive successes, re-opening on the first failure.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN that close it again.
    pub success_threshold: u32,
    /// How long OPEN rejects before probing.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 5,
            open_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
            }),
        }
    }

    /// False only in OPEN before the timer expires. Expiry transitions to
    /// HALF_OPEN as a side effect, so the first caller after the window
    /// becomes the probe.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open { since } => {
                if since.elapsed() >= self.config.open_timeout {
                    inner.state = State::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures = 0;
            }
            State::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                }
            }
            // A straggler completing after the trip changes nothing.
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = State::Open { since: Instant::now() };
                }
            }
            State::HalfOpen => {
                inner.state = State::Open { since: Instant::now() };
            }
            State::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.lock().unwrap().state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped() -> CircuitBreaker {
        let cb = CircuitBreaker::default();
        for _ in 0..10 {
            cb.record_failure();
        }
        cb
    }

    #[test]
    fn closed_allows_and_success_clears_failures() {
        let cb = CircuitBreaker::default();
        for _ in 0..9 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..9 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn ten_consecutive_failures_open_for_the_full_window() {
        let cb = tripped();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());

        tokio::time::advance(Duration::from_millis(9_900)).await;
        assert!(!cb.allow_request());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn five_successes_in_half_open_close_the_breaker() {
        let cb = tripped();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.allow_request());

        for _ in 0..4 {
            cb.record_success();
            assert_eq!(cb.state(), BreakerState::HalfOpen);
        }
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_a_fresh_timer() {
        let cb = tripped();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!cb.allow_request());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cb.allow_request());
    }
}
