//! JSON-RPC 2.0 envelope types and error codes.
//!
//! The validator at the HTTP edge parses untrusted bodies into
//! [`RpcPayload`] once; everything downstream (dispatcher, aggregator,
//! reject log) operates on the typed value.

use serde::Serialize;
use serde_json::Value;

/// JSON-RPC parse error (malformed or non-object body).
pub const CODE_PARSE_ERROR: i64 = -32700;
/// JSON-RPC invalid request (structurally bad request object).
pub const CODE_INVALID_REQUEST: i64 = -32600;
/// JSON-RPC method not found; also used for blocked namespaces.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// Rate limit exceeded (conventional infra extension code).
pub const CODE_RATE_LIMITED: i64 = -32005;

/// Method prefixes that are never forwarded upstream.
pub const BLOCKED_NAMESPACES: [&str; 7] = [
    "admin_", "personal_", "debug_", "miner_", "engine_", "clique_", "les_",
];

/// A single validated JSON-RPC request.
#[derive(Clone, Debug)]
pub struct RpcCall {
    pub method: String,
    /// The request id, exactly as supplied. An explicit `null` is kept;
    /// validation guarantees the key was present.
    pub id: Value,
}

/// A validated request body: one call or a non-empty batch.
#[derive(Clone, Debug)]
pub enum RpcPayload {
    Single(RpcCall),
    Batch(Vec<RpcCall>),
}

impl RpcPayload {
    /// Number of individual calls carried by this payload.
    pub fn call_count(&self) -> usize {
        match self {
            RpcPayload::Single(_) => 1,
            RpcPayload::Batch(calls) => calls.len(),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, RpcPayload::Batch(_))
    }

    /// The id to echo in a payload-level error response: the call's own id
    /// for a singleton, `null` for a batch.
    pub fn primary_id(&self) -> Value {
        match self {
            RpcPayload::Single(call) => call.id.clone(),
            RpcPayload::Batch(_) => Value::Null,
        }
    }

    /// All method names in the payload, for logging.
    pub fn methods(&self) -> Vec<&str> {
        match self {
            RpcPayload::Single(call) => vec![call.method.as_str()],
            RpcPayload::Batch(calls) => calls.iter().map(|c| c.method.as_str()).collect(),
        }
    }
}

/// Serializable JSON-RPC error response body.
#[derive(Clone, Debug, Serialize)]
pub struct RpcErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub error: RpcErrorDetail,
}

#[derive(Clone, Debug, Serialize)]
pub struct RpcErrorDetail {
    pub code: i64,
    pub message: String,
    /// Optional structured detail, e.g. `retryAfter` on rate-limit
    /// denials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorResponse {
    pub fn new(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            error: RpcErrorDetail {
                code,
                message: message.into(),
                data: None,
            },
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.error.data = Some(data);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The blocked namespace matching a method name, if any, without the
/// trailing underscore (`"debug_traceTransaction"` → `Some("debug")`).
pub fn blocked_namespace(method: &str) -> Option<&'static str> {
    BLOCKED_NAMESPACES
        .iter()
        .find(|prefix| method.starts_with(**prefix))
        .map(|prefix| prefix.trim_end_matches('_'))
}
