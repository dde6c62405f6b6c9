//! Breaker state-change alerts.
//!
//! Delivery targets (chat sinks, webhooks) live outside the core; the
//! proxy only defines the seam. Sinks are fault-isolated: a panicking
//! sink is caught and logged, never surfaced to the dispatcher.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

/// A breaker state change worth telling an operator about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertEvent {
    /// The breaker opened; traffic is being routed to the fallback.
    Opened { consecutive_failures: u32 },
    /// A half-open probe succeeded; traffic is back on the primary.
    Recovered,
}

/// Externally injected alert delivery.
pub trait AlertSink: Send + Sync {
    fn notify(&self, event: AlertEvent);
}

/// Default sink: structured log lines only.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, event: AlertEvent) {
        match event {
            AlertEvent::Opened {
                consecutive_failures,
            } => warn!(
                consecutive_failures,
                "circuit breaker opened; routing to fallback"
            ),
            AlertEvent::Recovered => warn!("circuit breaker recovered; routing to primary"),
        }
    }
}

/// Invoke a sink with panic isolation.
pub(crate) fn emit(sink: &dyn AlertSink, event: AlertEvent) {
    if catch_unwind(AssertUnwindSafe(|| sink.notify(event))).is_err() {
        error!("alert sink panicked; alert dropped");
    }
}
