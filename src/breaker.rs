use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

/// Three-state gate in front of the upstream transport: Closed counts
/// consecutive failures, Open fails fast until the open timeout elapses,
/// HalfOpen admits a bounded number of probes and closes again only after
/// enough of them succeed. The lock covers admission and result recording
/// only; the wrapped call runs outside it.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    open_timeout: Duration,
    half_open_max: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Closed,
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_timeout: Duration, half_open_max: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                last_failure: None,
            }),
            threshold: threshold.max(1),
            open_timeout,
            half_open_max: half_open_max.max(1),
        }
    }

    /// Runs `f` if the breaker admits it; otherwise fails fast with `Open`
    /// without invoking `f` at all.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.admit() else {
            crate::metrics::record_breaker_rejection();
            return Err(BreakerError::Open);
        };
        let result = f().await;
        self.record(admission, result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Some(Admission::Closed),
            BreakerState::Open => {
                let waited_out = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.open_timeout)
                    .unwrap_or(true);
                if !waited_out {
                    return None;
                }
                // The caller that trips the transition is the first probe.
                inner.state = BreakerState::HalfOpen;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 1;
                info!("circuit breaker entering half-open");
                Some(Admission::HalfOpen)
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight >= self.half_open_max {
                    return None;
                }
                inner.half_open_in_flight += 1;
                Some(Admission::HalfOpen)
            }
        }
    }

    fn record(&self, admission: Admission, success: bool) {
        let mut inner = self.inner.lock();
        match admission {
            Admission::Closed => {
                // The state may have moved on while the call ran; results
                // from a stale admission do not rewrite it.
                if inner.state != BreakerState::Closed {
                    return;
                }
                if success {
                    inner.consecutive_failures = 0;
                    return;
                }
                inner.consecutive_failures += 1;
                inner.last_failure = Some(Instant::now());
                if inner.consecutive_failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    crate::metrics::record_breaker_open();
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            Admission::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if inner.state != BreakerState::HalfOpen {
                    return;
                }
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.half_open_max {
                        inner.state = BreakerState::Closed;
                        inner.consecutive_failures = 0;
                        inner.half_open_successes = 0;
                        info!("circuit breaker closed");
                    }
                } else {
                    // Any half-open failure re-opens immediately.
                    inner.state = BreakerState::Open;
                    inner.last_failure = Some(Instant::now());
                    inner.half_open_successes = 0;
                    crate::metrics::record_breaker_open();
                    warn!("circuit breaker re-opened from half-open");
                }
            }
        }
    }
}
