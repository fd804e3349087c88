/// Wire message shapes and proxy-originated error codes shared by both
/// dialects (spec.md §6).
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ERR_UNSUPPORTED_METHOD: i64 = 20;
pub const ERR_ALREADY_SUBSCRIBED: i64 = 21;
pub const ERR_BAD_PARAMS: i64 = 22;
pub const ERR_STALE_SHARE: i64 = 23;
pub const ERR_RPC_TRANSPORT: i64 = 24;
pub const ERR_UNKNOWN_SUBMIT: i64 = 25;
pub const ERR_NODE_REJECTED: i64 = 26;

/// A request line as received from a client: both `method` and `params`
/// must be present for the proxy to dispatch it at all (see `session.rs`).
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: Option<Value>,
    pub method: Option<String>,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Option<Value>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Bool(false),
            error: Some(serde_json::json!({ "code": code, "message": message.into() })),
        }
    }

    pub fn err_value(id: Value, error: Value) -> Self {
        Self {
            id,
            result: Value::Bool(false),
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Notification {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Value::Null,
            method: method.into(),
            params,
        }
    }
}

/// True only when both `method` and `params` were present on the line,
/// matching the original implementation's dispatch gate — a structurally
/// valid JSON object missing either key is treated like malformed JSON and
/// draws no response at all.
pub fn is_dispatchable(req: &Request) -> bool {
    req.method.is_some() && req.params.is_some()
}
