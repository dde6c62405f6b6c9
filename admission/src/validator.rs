//! JSON-RPC 2.0 request validation and namespace filtering.
//!
//! Runs once at the edge. The output is either a typed [`RpcPayload`]
//! that the rest of the pipeline trusts, or an [`RpcReject`] describing
//! the JSON-RPC error to answer with. Rejections are always HTTP 200.

use serde_json::Value;

use palisade_types::rpc::{
    blocked_namespace, RpcCall, RpcPayload, CODE_INVALID_REQUEST, CODE_METHOD_NOT_FOUND,
    CODE_PARSE_ERROR,
};

/// A validation failure, carrying everything needed to build the JSON-RPC
/// error body and the reject-log line.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcReject {
    pub code: i64,
    pub message: String,
    /// Id to echo in the response; `null` when none is available.
    pub id: Value,
}

impl RpcReject {
    fn parse_error() -> Self {
        Self {
            code: CODE_PARSE_ERROR,
            message: "Parse error".to_string(),
            id: Value::Null,
        }
    }

    fn invalid(message: impl Into<String>, id: Value) -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: message.into(),
            id,
        }
    }

    fn blocked(namespace: &str, id: Value) -> Self {
        Self {
            code: CODE_METHOD_NOT_FOUND,
            message: format!("method namespace '{namespace}' is blocked"),
            id,
        }
    }
}

/// Validate a parsed request body, singleton or batch.
///
/// The contract, in order: non-object/null bodies are parse errors with a
/// null id; an empty array is an invalid request with a null id; each
/// request object needs `jsonrpc == "2.0"`, a non-empty string `method`,
/// and an `id` key (an explicit `null` id counts, a missing key does
/// not); blocked method namespaces reject the whole payload. The first
/// offending entry of a batch decides the response, with its index named
/// in the message.
pub fn validate_body(body: &Value) -> Result<RpcPayload, RpcReject> {
    match body {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(RpcReject::invalid("empty batch", Value::Null));
            }
            let mut calls = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                calls.push(validate_call(item, Some(index))?);
            }
            Ok(RpcPayload::Batch(calls))
        }
        Value::Object(_) => Ok(RpcPayload::Single(validate_call(body, None)?)),
        _ => Err(RpcReject::parse_error()),
    }
}

/// Validate one request object. `index` is the batch position, if any.
fn validate_call(item: &Value, index: Option<usize>) -> Result<RpcCall, RpcReject> {
    let at = |message: &str| match index {
        Some(i) => format!("{message} (batch index {i})"),
        None => message.to_string(),
    };

    let obj = match item.as_object() {
        Some(obj) => obj,
        None => {
            return Err(RpcReject::invalid(
                at("request is not an object"),
                Value::Null,
            ))
        }
    };

    // Echo whatever id is recoverable, even from otherwise bad requests.
    let id = obj.get("id").cloned();

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(RpcReject::invalid(
            at("jsonrpc version must be \"2.0\""),
            id.unwrap_or(Value::Null),
        ));
    }

    let method = match obj.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m,
        _ => {
            return Err(RpcReject::invalid(
                at("missing or empty method"),
                id.unwrap_or(Value::Null),
            ))
        }
    };

    // The id key must be present; an explicit null is fine.
    let id = match id {
        Some(id) => id,
        None => return Err(RpcReject::invalid(at("missing id"), Value::Null)),
    };

    if let Some(namespace) = blocked_namespace(method) {
        return Err(RpcReject::blocked(namespace, id));
    }

    Ok(RpcCall {
        method: method.to_string(),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_single_request() {
        let body = json!({"jsonrpc": "2.0", "method": "eth_call", "id": "x"});
        let payload = validate_body(&body).unwrap();
        assert_eq!(payload.call_count(), 1);
        assert_eq!(payload.methods(), vec!["eth_call"]);
        assert_eq!(payload.primary_id(), json!("x"));
    }

    #[test]
    fn valid_batch() {
        let body = json!([
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "id": 1},
            {"jsonrpc": "2.0", "method": "eth_call", "id": 2},
        ]);
        let payload = validate_body(&body).unwrap();
        assert!(payload.is_batch());
        assert_eq!(payload.call_count(), 2);
    }

    #[test]
    fn null_body_is_parse_error() {
        let err = validate_body(&Value::Null).unwrap_err();
        assert_eq!(err.code, CODE_PARSE_ERROR);
        assert_eq!(err.id, Value::Null);
    }

    #[test]
    fn scalar_body_is_parse_error() {
        let err = validate_body(&json!(42)).unwrap_err();
        assert_eq!(err.code, CODE_PARSE_ERROR);
    }

    #[test]
    fn empty_batch_is_invalid_request() {
        let err = validate_body(&json!([])).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
        assert_eq!(err.id, Value::Null);
    }

    #[test]
    fn wrong_version_rejected_with_echoed_id() {
        let err = validate_body(&json!({"jsonrpc": "1.0", "method": "eth_call", "id": 3}))
            .unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
        assert_eq!(err.id, json!(3));
    }

    #[test]
    fn missing_method_rejected() {
        let err = validate_body(&json!({"jsonrpc": "2.0", "id": 3})).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
        assert!(err.message.contains("method"));
    }

    #[test]
    fn empty_method_rejected() {
        let err =
            validate_body(&json!({"jsonrpc": "2.0", "method": "", "id": 3})).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
    }

    #[test]
    fn missing_id_rejected_but_null_id_accepted() {
        let err = validate_body(&json!({"jsonrpc": "2.0", "method": "eth_call"})).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
        assert!(err.message.contains("id"));

        let ok = validate_body(&json!({"jsonrpc": "2.0", "method": "eth_call", "id": null}));
        assert!(ok.is_ok());
    }

    #[test]
    fn blocked_namespace_names_offender() {
        let err = validate_body(
            &json!({"jsonrpc": "2.0", "method": "debug_traceTransaction", "id": 2}),
        )
        .unwrap_err();
        assert_eq!(err.code, CODE_METHOD_NOT_FOUND);
        assert!(err.message.contains("debug"));
        assert!(!err.message.contains("debug_"));
        assert_eq!(err.id, json!(2));
    }

    #[test]
    fn batch_rejects_on_first_offender_with_index() {
        let body = json!([
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "id": 1},
            {"jsonrpc": "2.0", "method": "debug_traceTransaction", "id": 2},
        ]);
        let err = validate_body(&body).unwrap_err();
        assert_eq!(err.code, CODE_METHOD_NOT_FOUND);
        assert_eq!(err.id, json!(2));
    }

    #[test]
    fn batch_structural_error_carries_index() {
        let body = json!([
            {"jsonrpc": "2.0", "method": "eth_call", "id": 1},
            {"jsonrpc": "2.0", "id": 2},
        ]);
        let err = validate_body(&body).unwrap_err();
        assert!(err.message.contains("batch index 1"));
        assert_eq!(err.id, json!(2));
    }

    #[test]
    fn non_object_batch_entry_rejected() {
        let err = validate_body(&json!([42])).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
        assert!(err.message.contains("batch index 0"));
    }

    #[test]
    fn all_blocked_namespaces_reject() {
        for method in [
            "admin_peers",
            "personal_sign",
            "debug_traceCall",
            "miner_start",
            "engine_newPayloadV1",
            "clique_getSigners",
            "les_status",
        ] {
            let err = validate_body(&json!({"jsonrpc": "2.0", "method": method, "id": 1}))
                .unwrap_err();
            assert_eq!(err.code, CODE_METHOD_NOT_FOUND, "method {method}");
        }
    }
}
