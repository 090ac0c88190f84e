//! Wire-level JSON-RPC 2.0 types and the app-server method/notification
//! vocabulary. Nothing in this module talks to a transport; it only knows how
//! to turn [`serde_json::Value`] frames into [`Message`]s and back.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "initialized";
pub const METHOD_THREAD_START: &str = "thread/start";
pub const METHOD_THREAD_RESUME: &str = "thread/resume";
pub const METHOD_THREAD_COMPACT_START: &str = "thread/compact/start";
pub const METHOD_TURN_START: &str = "turn/start";
pub const METHOD_TURN_INTERRUPT: &str = "turn/interrupt";

pub const METHOD_ITEM_COMMAND_EXECUTION_REQUEST_APPROVAL: &str =
    "item/commandExecution/requestApproval";
pub const METHOD_ITEM_FILE_CHANGE_REQUEST_APPROVAL: &str = "item/fileChange/requestApproval";
pub const METHOD_ITEM_TOOL_CALL: &str = "item/tool/call";

pub const NOTIFICATION_TURN_STARTED: &str = "turn/started";
pub const NOTIFICATION_TURN_COMPLETED: &str = "turn/completed";
pub const NOTIFICATION_ITEM_STARTED: &str = "item/started";
pub const NOTIFICATION_ITEM_COMPLETED: &str = "item/completed";
pub const NOTIFICATION_AGENT_MESSAGE_DELTA: &str = "item/agentMessage/delta";
pub const NOTIFICATION_REASONING_TEXT_DELTA: &str = "item/reasoning/textDelta";
pub const NOTIFICATION_REASONING_SUMMARY_TEXT_DELTA: &str = "item/reasoning/summaryTextDelta";
pub const NOTIFICATION_REASONING_SUMMARY_PART_ADDED: &str = "item/reasoning/summaryPartAdded";
pub const NOTIFICATION_PLAN_DELTA: &str = "item/plan/delta";
pub const NOTIFICATION_FILE_CHANGE_OUTPUT_DELTA: &str = "item/fileChange/outputDelta";
pub const NOTIFICATION_COMMAND_EXECUTION_OUTPUT_DELTA: &str = "item/commandExecution/outputDelta";
pub const NOTIFICATION_TOKEN_USAGE_UPDATED: &str = "thread/tokenUsage/updated";
pub const NOTIFICATION_PLAN_UPDATED: &str = "turn/plan/updated";
pub const NOTIFICATION_DIFF_UPDATED: &str = "turn/diff/updated";

// Wrapper-form duplicates the sidecar sometimes also emits alongside the
// canonical names above. The mapper treats these as already-covered and
// drops them rather than double-emitting parts.
pub const NOTIFICATION_MCP_TOOL_CALL_PROGRESS: &str = "item/mcpToolCall/progress";
pub const NOTIFICATION_TOOL_CALL_STARTED: &str = "item/tool/callStarted";
pub const NOTIFICATION_TOOL_CALL_DELTA: &str = "item/tool/callDelta";
pub const NOTIFICATION_TOOL_CALL_FINISHED: &str = "item/tool/callFinished";

pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INTERNAL: i64 = -32000;
pub const ERROR_CANCELLED: i64 = -32800;

/// A JSON-RPC request/response identifier. The app-server is free to use
/// either shape; we preserve whichever one it sent back to us.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// Generates request ids that are unique for the lifetime of one
/// [`crate::rpc::RpcClient`]. Ids are not unique across clients, which is
/// fine: correlation only ever happens within a single client's pending map.
pub struct RequestIdGenerator(AtomicI64);

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    pub fn next(&self) -> RequestId {
        RequestId::Number(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded JSON-RPC frame, already classified by the presence of `id` /
/// `method` / `result` / `error`.
#[derive(Clone, Debug)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Success {
        id: RequestId,
        result: Value,
    },
    Error {
        id: RequestId,
        error: RpcErrorObject,
    },
}

impl Message {
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { id, method, params } => serde_json::json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "method": method,
                "params": params,
            }),
            Message::Notification { method, params } => serde_json::json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": method,
                "params": params,
            }),
            Message::Success { id, result } => serde_json::json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": result,
            }),
            Message::Error { id, error } => serde_json::json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "error": error,
            }),
        }
    }
}

/// Classifies a raw frame. Anything that doesn't look like a JSON-RPC 2.0
/// object (missing both `method` and a response pair) is rejected, letting
/// callers treat it as a malformed frame without panicking.
pub fn decode_message(value: Value) -> Option<Message> {
    let obj = value.as_object()?;
    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        let params = obj.get("params").cloned();
        return match obj.get("id") {
            Some(id_value) => {
                let id = parse_request_id(id_value)?;
                Some(Message::Request {
                    id,
                    method: method.to_string(),
                    params,
                })
            }
            None => Some(Message::Notification {
                method: method.to_string(),
                params,
            }),
        };
    }

    let id = parse_request_id(obj.get("id")?)?;
    if let Some(error) = obj.get("error") {
        let error: RpcErrorObject = serde_json::from_value(error.clone()).ok()?;
        return Some(Message::Error { id, error });
    }
    let result = obj.get("result").cloned().unwrap_or(Value::Null);
    Some(Message::Success { id, result })
}

fn parse_request_id(value: &Value) -> Option<RequestId> {
    if let Some(n) = value.as_i64() {
        return Some(RequestId::Number(n));
    }
    if let Some(s) = value.as_str() {
        return Some(RequestId::String(s.to_string()));
    }
    None
}

/// Looks up the first of several candidate keys on a JSON object, tolerating
/// both `snake_case` and `camelCase` field names from the sidecar.
pub(crate) fn extract_string(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = value.get(*key).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_request_notification_and_response() {
        let req = decode_message(serde_json::json!({"jsonrpc":"2.0","id":1,"method":"item/tool/call","params":{"name":"x"}})).unwrap();
        assert!(matches!(req, Message::Request{method, ..} if method == "item/tool/call"));

        let note = decode_message(serde_json::json!({"jsonrpc":"2.0","method":"turn/started"})).unwrap();
        assert!(matches!(note, Message::Notification{method, ..} if method == "turn/started"));

        let ok = decode_message(serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}})).unwrap();
        assert!(matches!(ok, Message::Success{..}));

        let err = decode_message(serde_json::json!({"jsonrpc":"2.0","id":"abc","error":{"code":-32601,"message":"nope"}})).unwrap();
        assert!(matches!(err, Message::Error{..}));
    }

    #[test]
    fn rejects_frames_with_no_method_and_no_id() {
        assert!(decode_message(serde_json::json!({"jsonrpc":"2.0"})).is_none());
        assert!(decode_message(serde_json::json!("not an object")).is_none());
    }

    #[test]
    fn extract_string_tries_each_key_in_order() {
        let value = serde_json::json!({"itemId": "abc"});
        assert_eq!(extract_string(&value, &["item_id", "itemId"]), Some("abc".to_string()));
        assert_eq!(extract_string(&value, &["missing"]), None);
    }
}
