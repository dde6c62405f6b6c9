//! Shared utilities for the palisade proxy.

pub mod logging;
pub mod shutdown;
pub mod time;

pub use logging::init_tracing_with;
pub use shutdown::ShutdownController;
