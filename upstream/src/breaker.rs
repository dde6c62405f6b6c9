//! Failure-counting circuit breaker with half-open probing.
//!
//! One breaker guards the primary upstream. Without a configured
//! fallback there is nowhere to shed traffic to, so the breaker never
//! leaves `Closed` no matter how many failures accumulate. Only POST
//! outcomes feed the state machine; GET probes are diagnostic.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::alert::{emit, AlertEvent, AlertSink};

/// Breaker tuning. Defaults match production: two consecutive failures
/// open the breaker, probes resume after a minute.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub has_fallback: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            has_fallback: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Where the dispatcher should send the next POST.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteChoice {
    /// Send to the primary. `probing` marks a half-open trial request.
    Primary { probing: bool },
    /// Breaker is open: send straight to the fallback.
    Fallback,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_count: u64,
}

/// Admin view of the breaker.
#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// Seconds since the most recent failure, if any.
    pub seconds_since_last_failure: Option<u64>,
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub has_fallback: bool,
    /// Times the breaker has opened since process start.
    pub opened_count: u64,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    alerts: Box<dyn AlertSink>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, alerts: Box<dyn AlertSink>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_count: 0,
            }),
            alerts,
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.config.has_fallback
    }

    /// Decide where the next POST goes, advancing `Open → HalfOpen` when
    /// the reset timeout has elapsed.
    pub fn route(&self) -> RouteChoice {
        if !self.config.has_fallback {
            return RouteChoice::Primary { probing: false };
        }
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        match inner.state {
            BreakerState::Closed => RouteChoice::Primary { probing: false },
            BreakerState::HalfOpen => RouteChoice::Primary { probing: true },
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    debug!("breaker reset timeout elapsed; probing primary");
                    inner.state = BreakerState::HalfOpen;
                    RouteChoice::Primary { probing: true }
                } else {
                    RouteChoice::Fallback
                }
            }
        }
    }

    /// Record a successful primary POST.
    pub fn on_success(&self) {
        let recovered = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let was_half_open = inner.state == BreakerState::HalfOpen;
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            was_half_open
        };
        if recovered {
            emit(self.alerts.as_ref(), AlertEvent::Recovered);
        }
    }

    /// Record a failed primary POST.
    pub fn on_failure(&self) {
        let opened = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.consecutive_failures += 1;
            inner.last_failure_at = Some(Instant::now());
            let open_now = self.config.has_fallback
                && inner.state != BreakerState::Open
                && (inner.state == BreakerState::HalfOpen
                    || inner.consecutive_failures >= self.config.failure_threshold);
            if open_now {
                inner.state = BreakerState::Open;
                inner.opened_count += 1;
                Some(inner.consecutive_failures)
            } else {
                None
            }
        };
        if let Some(consecutive_failures) = opened {
            emit(
                self.alerts.as_ref(),
                AlertEvent::Opened {
                    consecutive_failures,
                },
            );
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            seconds_since_last_failure: inner.last_failure_at.map(|at| at.elapsed().as_secs()),
            failure_threshold: self.config.failure_threshold,
            reset_timeout_secs: self.config.reset_timeout.as_secs(),
            has_fallback: self.config.has_fallback,
            opened_count: inner.opened_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSink {
        opened: AtomicU32,
        recovered: AtomicU32,
    }

    impl AlertSink for Arc<CountingSink> {
        fn notify(&self, event: AlertEvent) {
            match event {
                AlertEvent::Opened { .. } => self.opened.fetch_add(1, Ordering::SeqCst),
                AlertEvent::Recovered => self.recovered.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    fn breaker(has_fallback: bool, reset_timeout: Duration) -> (CircuitBreaker, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink::default());
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 2,
                reset_timeout,
                has_fallback,
            },
            Box::new(Arc::clone(&sink)),
        );
        (breaker, sink)
    }

    #[test]
    fn opens_at_threshold_with_fallback() {
        let (breaker, sink) = breaker(true, Duration::from_secs(60));
        breaker.on_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        assert_eq!(breaker.route(), RouteChoice::Fallback);
        assert_eq!(sink.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn opened_alert_fires_exactly_once() {
        let (breaker, sink) = breaker(true, Duration::from_secs(60));
        for _ in 0..5 {
            breaker.on_failure();
        }
        assert_eq!(sink.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_opens_without_fallback() {
        let (breaker, sink) = breaker(false, Duration::from_secs(60));
        for _ in 0..10 {
            breaker.on_failure();
        }
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
        assert_eq!(breaker.route(), RouteChoice::Primary { probing: false });
        assert_eq!(sink.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn success_resets_failure_count() {
        let (breaker, _) = breaker(true, Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_success();
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        breaker.on_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_after_reset_timeout() {
        let (breaker, _) = breaker(true, Duration::from_millis(0));
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        // Zero reset timeout: the very next routing call probes.
        assert_eq!(breaker.route(), RouteChoice::Primary { probing: true });
        assert_eq!(breaker.snapshot().state, BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_success_recovers() {
        let (breaker, sink) = breaker(true, Duration::from_millis(0));
        breaker.on_failure();
        breaker.on_failure();
        let _ = breaker.route();
        breaker.on_success();
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        assert_eq!(sink.recovered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn half_open_failure_reopens_with_alert() {
        let (breaker, sink) = breaker(true, Duration::from_millis(0));
        breaker.on_failure();
        breaker.on_failure();
        let _ = breaker.route();
        assert_eq!(breaker.snapshot().state, BreakerState::HalfOpen);
        breaker.on_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        assert_eq!(sink.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn open_before_timeout_routes_to_fallback() {
        let (breaker, _) = breaker(true, Duration::from_secs(3_600));
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.route(), RouteChoice::Fallback);
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
    }

    #[test]
    fn panicking_sink_is_contained() {
        struct PanickingSink;
        impl AlertSink for PanickingSink {
            fn notify(&self, _event: AlertEvent) {
                panic!("sink exploded");
            }
        }
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                has_fallback: true,
            },
            Box::new(PanickingSink),
        );
        breaker.on_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
    }
}
