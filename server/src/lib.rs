//! The HTTPS surface of the palisade proxy.
//!
//! Wires the admission pipeline, rate limiter, dispatcher, and
//! aggregator into an axum router, serves it over TLS, and exposes the
//! key-guarded admin endpoints.

pub mod admin;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rpc;
pub mod state;
pub mod tls;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

pub use config::ProxyConfig;
pub use error::ServerError;
pub use metrics::ProxyMetrics;
pub use state::ProxyState;

/// Assemble the full route table over shared proxy state.
pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/", post(rpc::handle_rpc).get(rpc::handle_probe))
        .route("/watchdog", get(admin::watchdog))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/status", get(admin::breaker_status))
        .route("/ratelimitstatus", get(admin::rate_limit_status))
        .route("/blackliststatus", get(admin::blacklist_status))
        .with_state(state)
}
