//! Registers handlers on the RPC client for inbound command-execution and
//! file-change approval requests, each delegating to a caller-supplied
//! function that returns a decision from a small closed set. The app-server
//! sends these as inbound JSON-RPC requests that this client must answer,
//! rather than as fire-and-forget notifications.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{
    METHOD_ITEM_COMMAND_EXECUTION_REQUEST_APPROVAL, METHOD_ITEM_FILE_CHANGE_REQUEST_APPROVAL,
};
use crate::rpc::{HandlerError, HandlerResult, RpcClient};

/// Decision returned to the peer for an approval request. The conservative
/// default across this crate is `Deny`; callers that want auto-approval
/// must say so explicitly via [`ApprovalHandlers`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

impl Default for ApprovalDecision {
    fn default() -> Self {
        ApprovalDecision::Deny
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CommandExecutionApprovalRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FileChangeApprovalRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    pub path: String,
    #[serde(default)]
    pub diff: Option<String>,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Caller-supplied handlers for the two approval prompt kinds.
#[derive(Clone)]
pub struct ApprovalHandlers {
    pub on_command:
        Arc<dyn Fn(CommandExecutionApprovalRequest) -> BoxFuture<ApprovalDecision> + Send + Sync>,
    pub on_file_change:
        Arc<dyn Fn(FileChangeApprovalRequest) -> BoxFuture<ApprovalDecision> + Send + Sync>,
}

impl ApprovalHandlers {
    /// Conservative defaults: deny everything unless the caller overrides.
    pub fn denying() -> Self {
        Self {
            on_command: Arc::new(|_| Box::pin(async { ApprovalDecision::Deny })),
            on_file_change: Arc::new(|_| Box::pin(async { ApprovalDecision::Deny })),
        }
    }
}

/// Registers the two approval handlers on `client`. Pure dispatch: no state
/// survives between calls.
pub async fn register(client: &RpcClient, handlers: ApprovalHandlers) {
    let on_command = handlers.on_command.clone();
    client
        .on_request(METHOD_ITEM_COMMAND_EXECUTION_REQUEST_APPROVAL, move |params| {
            let on_command = on_command.clone();
            async move {
                let request = parse_params::<CommandExecutionApprovalRequest>(params)?;
                let decision = on_command(request).await;
                encode_decision(decision)
            }
        })
        .await;

    let on_file_change = handlers.on_file_change.clone();
    client
        .on_request(METHOD_ITEM_FILE_CHANGE_REQUEST_APPROVAL, move |params| {
            let on_file_change = on_file_change.clone();
            async move {
                let request = parse_params::<FileChangeApprovalRequest>(params)?;
                let decision = on_file_change(request).await;
                encode_decision(decision)
            }
        })
        .await;
}

fn parse_params<T: for<'a> Deserialize<'a>>(params: Option<Value>) -> Result<T, HandlerError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| HandlerError(format!("invalid approval request params: {err}")))
}

fn encode_decision(decision: ApprovalDecision) -> HandlerResult {
    Ok(serde_json::json!({ "decision": decision }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_decision_is_deny() {
        assert_eq!(ApprovalDecision::default(), ApprovalDecision::Deny);
    }

    #[test]
    fn parses_command_execution_request() {
        let value = serde_json::json!({"command": "ls -la", "cwd": "/tmp"});
        let parsed: CommandExecutionApprovalRequest = parse_params(Some(value)).unwrap();
        assert_eq!(parsed.command, "ls -la");
        assert_eq!(parsed.cwd.as_deref(), Some("/tmp"));
    }
}
