//! Upstream routing for the palisade proxy: a per-upstream circuit
//! breaker and the dispatcher that forwards validated requests.

pub mod alert;
pub mod breaker;
pub mod dispatcher;
pub mod error;

pub use alert::{AlertEvent, AlertSink, LogAlertSink};
pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker, RouteChoice};
pub use dispatcher::{Dispatcher, DispatcherConfig, ForwardOutcome, ProbeOutcome, Upstream};
pub use error::UpstreamError;
