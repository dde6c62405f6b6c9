//! Fundamental types for the palisade RPC proxy.
//!
//! This crate defines the types shared across every other crate in the
//! workspace: origin classification, the JSON-RPC envelope, per-IP usage
//! aggregates, and persisted counter rows.

pub mod ip;
pub mod origin;
pub mod rpc;
pub mod usage;

pub use ip::UNKNOWN;
pub use origin::OriginClass;
pub use rpc::{RpcCall, RpcErrorResponse, RpcPayload};
pub use usage::{CounterRow, HistoryRow, IpUsage, OriginCounts};
