//! Request admission for the palisade proxy.
//!
//! Everything that runs synchronously before a request may touch an
//! upstream: client IP/origin extraction, JSON-RPC validation and
//! namespace filtering, the hot-reloaded IP blacklist, and the buffered
//! reject log. Admission never suspends and, apart from deliberate
//! rejections, never fails a request: internal errors fail open.

pub mod blacklist;
pub mod client;
pub mod reject_log;
pub mod validator;

pub use blacklist::{BlacklistSnapshot, IpBlacklist};
pub use client::{client_ip, request_origin};
pub use reject_log::RejectLog;
pub use validator::{validate_body, RpcReject};
