//! A deterministic, stateful-per-turn state machine translating the
//! sidecar's notification vocabulary into an ordered, well-formed stream of
//! [`GenerationPart`]s. Hand-rolled match-on-method-name dispatch rather
//! than a parser-combinator dependency, matching how the rest of this crate
//! decodes JSON-RPC traffic.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::parts::{
    FinishReason, GenerationPart, ProviderMetadata, ToolCallPayload, ToolResultPayload, Usage,
};
use crate::protocol;

const TOOL_NAME_COMMAND_EXECUTION: &str = "provider_command_execution";

#[derive(Clone, Debug)]
struct OpenToolCall {
    tool_name: String,
    accumulated_output: String,
}

/// Per-turn state held by the mapper.
#[derive(Default)]
pub struct EventMapper {
    stream_started: bool,
    open_text_ids: HashSet<String>,
    text_delta_seen: HashSet<String>,
    open_reasoning_ids: HashSet<String>,
    open_tool_calls: HashMap<String, OpenToolCall>,
    plan_sequence: HashMap<String, String>,
    latest_usage: Option<Usage>,
    thread_id: Option<String>,
    turn_id: Option<String>,
    emit_plan_updates: bool,
    finished: bool,
}

impl EventMapper {
    pub fn new(emit_plan_updates: bool) -> Self {
        Self {
            emit_plan_updates,
            ..Default::default()
        }
    }

    pub fn set_thread_id(&mut self, thread_id: impl Into<String>) {
        self.thread_id = Some(thread_id.into());
    }

    pub fn set_turn_id(&mut self, turn_id: impl Into<String>) {
        self.turn_id = Some(turn_id.into());
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            thread_id: self.thread_id.clone(),
        }
    }

    fn ensure_stream_start(&mut self, out: &mut Vec<GenerationPart>) {
        if !self.stream_started {
            self.stream_started = true;
            out.push(GenerationPart::StreamStart);
        }
    }

    /// Consumes one inbound notification (method + params) and appends zero
    /// or more parts to `out`, preserving mapper-produced order.
    pub fn handle_notification(&mut self, method: &str, params: &Value, out: &mut Vec<GenerationPart>) {
        if self.finished {
            return;
        }

        match method {
            protocol::NOTIFICATION_TURN_STARTED => {
                self.ensure_stream_start(out);
            }
            protocol::NOTIFICATION_ITEM_STARTED => self.handle_item_started(params, out),
            protocol::NOTIFICATION_ITEM_COMPLETED => self.handle_item_completed(params, out),
            protocol::NOTIFICATION_AGENT_MESSAGE_DELTA => self.handle_agent_message_delta(params, out),
            protocol::NOTIFICATION_REASONING_TEXT_DELTA
            | protocol::NOTIFICATION_REASONING_SUMMARY_TEXT_DELTA
            | protocol::NOTIFICATION_PLAN_DELTA
            | protocol::NOTIFICATION_FILE_CHANGE_OUTPUT_DELTA => {
                self.handle_reasoning_delta(params, out)
            }
            protocol::NOTIFICATION_REASONING_SUMMARY_PART_ADDED => {
                self.handle_reasoning_section_break(params, out)
            }
            protocol::NOTIFICATION_COMMAND_EXECUTION_OUTPUT_DELTA => {
                self.handle_command_execution_delta(params, out)
            }
            protocol::NOTIFICATION_TOKEN_USAGE_UPDATED => self.handle_token_usage(params),
            protocol::NOTIFICATION_PLAN_UPDATED => self.handle_plan_updated(params, out),
            protocol::NOTIFICATION_DIFF_UPDATED => {
                // Raw diff payloads are dropped; callers get deltas instead.
            }
            protocol::NOTIFICATION_TURN_COMPLETED => self.handle_turn_completed(params, out),
            // Wrapper-form duplicates: the canonical events above are
            // authoritative, so these are silently ignored.
            protocol::NOTIFICATION_MCP_TOOL_CALL_PROGRESS
            | protocol::NOTIFICATION_TOOL_CALL_STARTED
            | protocol::NOTIFICATION_TOOL_CALL_DELTA
            | protocol::NOTIFICATION_TOOL_CALL_FINISHED => {}
            _ => {}
        }
    }

    fn handle_item_started(&mut self, params: &Value, out: &mut Vec<GenerationPart>) {
        self.ensure_stream_start(out);
        let Some(item) = params.get("item") else {
            return;
        };
        let Some(id) = item_id(item) else {
            return;
        };
        let kind = item_kind(item);
        let metadata = self.metadata();

        match kind.as_deref() {
            Some("agentMessage") | Some("agent_message") => {
                self.open_text_ids.insert(id.clone());
                out.push(GenerationPart::TextStart { id, metadata });
            }
            Some("commandExecution") | Some("command_execution") => {
                let command = item
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let cwd = item
                    .get("cwd")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.open_tool_calls.insert(
                    id.clone(),
                    OpenToolCall {
                        tool_name: TOOL_NAME_COMMAND_EXECUTION.to_string(),
                        accumulated_output: String::new(),
                    },
                );
                out.push(GenerationPart::ToolCall {
                    payload: ToolCallPayload {
                        call_id: id,
                        tool_name: TOOL_NAME_COMMAND_EXECUTION.to_string(),
                        input: serde_json::json!({ "command": command, "cwd": cwd }),
                        provider_executed: true,
                        dynamic: false,
                    },
                    metadata,
                });
            }
            // plan / reasoning / file-change / tool-call / web-search /
            // context-compaction / review-mode entries all open a reasoning
            // part keyed by the item id.
            _ => {
                self.open_reasoning_ids.insert(id.clone());
                out.push(GenerationPart::ReasoningStart { id, metadata });
            }
        }
    }

    fn handle_item_completed(&mut self, params: &Value, out: &mut Vec<GenerationPart>) {
        let Some(item) = params.get("item") else {
            return;
        };
        let Some(id) = item_id(item) else {
            return;
        };
        let kind = item_kind(item);
        let metadata = self.metadata();

        if self.open_text_ids.remove(&id) {
            if !self.text_delta_seen.remove(&id) {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    out.push(GenerationPart::TextDelta {
                        id: id.clone(),
                        delta: text.to_string(),
                        metadata: metadata.clone(),
                    });
                }
            }
            out.push(GenerationPart::TextEnd { id, metadata });
            return;
        }

        if let Some(open_call) = self.open_tool_calls.remove(&id) {
            let aggregated_output = item
                .get("aggregatedOutput")
                .or_else(|| item.get("aggregated_output"))
                .and_then(Value::as_str)
                .unwrap_or(&open_call.accumulated_output)
                .to_string();
            let exit_code = item.get("exitCode").or_else(|| item.get("exit_code")).cloned();
            let status = item.get("status").cloned();
            out.push(GenerationPart::ToolResult {
                payload: ToolResultPayload {
                    call_id: id,
                    tool_name: open_call.tool_name,
                    result: serde_json::json!({
                        "aggregatedOutput": aggregated_output,
                        "exitCode": exit_code,
                        "status": status,
                    }),
                    preliminary: false,
                },
                metadata,
            });
            return;
        }

        if self.open_reasoning_ids.remove(&id) {
            let _ = kind;
            out.push(GenerationPart::ReasoningEnd { id, metadata });
        }
    }

    fn handle_agent_message_delta(&mut self, params: &Value, out: &mut Vec<GenerationPart>) {
        let Some(id) = protocol::extract_string(params, &["item_id", "itemId"]) else {
            return;
        };
        let Some(delta) = params.get("delta").and_then(Value::as_str) else {
            return;
        };
        self.ensure_stream_start(out);
        let metadata = self.metadata();
        if self.open_text_ids.insert(id.clone()) {
            out.push(GenerationPart::TextStart {
                id: id.clone(),
                metadata: metadata.clone(),
            });
        }
        self.text_delta_seen.insert(id.clone());
        out.push(GenerationPart::TextDelta {
            id,
            delta: delta.to_string(),
            metadata,
        });
    }

    fn handle_reasoning_delta(&mut self, params: &Value, out: &mut Vec<GenerationPart>) {
        let Some(id) = protocol::extract_string(params, &["item_id", "itemId"]) else {
            return;
        };
        let Some(delta) = params.get("delta").and_then(Value::as_str) else {
            return;
        };
        self.append_reasoning_delta(id, delta.to_string(), out);
    }

    fn handle_reasoning_section_break(&mut self, params: &Value, out: &mut Vec<GenerationPart>) {
        let Some(id) = protocol::extract_string(params, &["item_id", "itemId"]) else {
            return;
        };
        self.append_reasoning_delta(id, "\n\n".to_string(), out);
    }

    fn append_reasoning_delta(&mut self, id: String, delta: String, out: &mut Vec<GenerationPart>) {
        self.ensure_stream_start(out);
        let metadata = self.metadata();
        if self.open_reasoning_ids.insert(id.clone()) {
            out.push(GenerationPart::ReasoningStart {
                id: id.clone(),
                metadata: metadata.clone(),
            });
        }
        out.push(GenerationPart::ReasoningDelta { id, delta, metadata });
    }

    fn handle_command_execution_delta(&mut self, params: &Value, out: &mut Vec<GenerationPart>) {
        let Some(id) = protocol::extract_string(params, &["item_id", "itemId"]) else {
            return;
        };
        let Some(delta) = params.get("delta").or_else(|| params.get("chunk")).and_then(Value::as_str) else {
            return;
        };
        let metadata = self.metadata();
        let Some(open_call) = self.open_tool_calls.get_mut(&id) else {
            return;
        };
        open_call.accumulated_output.push_str(delta);
        let tool_name = open_call.tool_name.clone();
        let accumulated = open_call.accumulated_output.clone();
        out.push(GenerationPart::ToolResult {
            payload: ToolResultPayload {
                call_id: id,
                tool_name,
                result: serde_json::json!({ "output": accumulated }),
                preliminary: true,
            },
            metadata,
        });
    }

    fn handle_token_usage(&mut self, params: &Value) {
        let usage = Usage {
            input_tokens: params.get("inputTokens").or_else(|| params.get("input_tokens")).and_then(Value::as_u64).unwrap_or_default(),
            output_tokens: params.get("outputTokens").or_else(|| params.get("output_tokens")).and_then(Value::as_u64).unwrap_or_default(),
            total_tokens: params.get("totalTokens").or_else(|| params.get("total_tokens")).and_then(Value::as_u64).unwrap_or_default(),
        };
        self.latest_usage = Some(usage);
    }

    fn handle_plan_updated(&mut self, params: &Value, out: &mut Vec<GenerationPart>) {
        if !self.emit_plan_updates {
            return;
        }
        let turn_id = self.turn_id.clone().unwrap_or_default();
        let call_id = format!("plan:{turn_id}");
        let metadata = self.metadata();

        if !self.plan_sequence.contains_key(&turn_id) {
            self.plan_sequence.insert(turn_id.clone(), call_id.clone());
            out.push(GenerationPart::ToolCall {
                payload: ToolCallPayload {
                    call_id: call_id.clone(),
                    tool_name: "plan".to_string(),
                    input: params.clone(),
                    provider_executed: true,
                    dynamic: false,
                },
                metadata: metadata.clone(),
            });
        }

        out.push(GenerationPart::ToolResult {
            payload: ToolResultPayload {
                call_id,
                tool_name: "plan".to_string(),
                result: params.clone(),
                preliminary: false,
            },
            metadata,
        });
    }

    fn flush_open_items(&mut self, out: &mut Vec<GenerationPart>) {
        let metadata = self.metadata();
        for id in std::mem::take(&mut self.open_text_ids) {
            self.text_delta_seen.remove(&id);
            out.push(GenerationPart::TextEnd {
                id,
                metadata: metadata.clone(),
            });
        }
        for id in std::mem::take(&mut self.open_reasoning_ids) {
            out.push(GenerationPart::ReasoningEnd {
                id,
                metadata: metadata.clone(),
            });
        }
        for (id, open_call) in std::mem::take(&mut self.open_tool_calls) {
            out.push(GenerationPart::ToolResult {
                payload: ToolResultPayload {
                    call_id: id,
                    tool_name: open_call.tool_name,
                    result: serde_json::json!({ "aggregatedOutput": open_call.accumulated_output }),
                    preliminary: false,
                },
                metadata: metadata.clone(),
            });
        }
    }

    fn handle_turn_completed(&mut self, params: &Value, out: &mut Vec<GenerationPart>) {
        self.ensure_stream_start(out);
        self.flush_open_items(out);

        let status = params.get("status").and_then(Value::as_str).unwrap_or("");
        let reason = match status {
            "completed" => FinishReason::Stop,
            "failed" => FinishReason::Error,
            "interrupted" => FinishReason::Other,
            _ => FinishReason::Other,
        };
        let usage = self.latest_usage.take().unwrap_or_default();
        let metadata = self.metadata();
        out.push(GenerationPart::Finish {
            reason,
            usage,
            metadata,
        });
        self.finished = true;
    }

    /// Emits a `tool-call` + `finish(tool-calls)` pair for a parked call and
    /// marks the turn finished, closing the stream for a call whose tool
    /// result will arrive on a later call.
    pub fn emit_parked_tool_call(&mut self, call_id: &str, tool_name: &str, input: Value, out: &mut Vec<GenerationPart>) {
        self.ensure_stream_start(out);
        self.flush_open_items(out);
        let metadata = self.metadata();
        out.push(GenerationPart::ToolCall {
            payload: ToolCallPayload {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
                input,
                provider_executed: false,
                dynamic: true,
            },
            metadata: metadata.clone(),
        });
        out.push(GenerationPart::Finish {
            reason: FinishReason::ToolCalls,
            usage: self.latest_usage.take().unwrap_or_default(),
            metadata,
        });
        self.finished = true;
    }

    /// Emits a single `error` part and marks the turn finished. At most one
    /// `error` part is ever emitted for a turn, followed by stream close.
    pub fn emit_error(&mut self, message: impl Into<String>, out: &mut Vec<GenerationPart>) {
        if self.finished {
            return;
        }
        let metadata = self.metadata();
        out.push(GenerationPart::Error {
            message: message.into(),
            metadata,
        });
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

fn item_id(item: &Value) -> Option<String> {
    protocol::extract_string(item, &["id", "item_id", "itemId"])
}

fn item_kind(item: &Value) -> Option<String> {
    item.get("type")
        .or_else(|| item.get("kind"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(events: &[(&str, Value)], emit_plan: bool) -> Vec<GenerationPart> {
        let mut mapper = EventMapper::new(emit_plan);
        mapper.set_thread_id("thr_1");
        mapper.set_turn_id("turn_1");
        let mut out = Vec::new();
        for (method, params) in events {
            mapper.handle_notification(method, params, &mut out);
        }
        out
    }

    #[test]
    fn plain_text_turn_matches_scenario_one() {
        let out = drive(
            &[
                (protocol::NOTIFICATION_TURN_STARTED, serde_json::json!({})),
                (
                    protocol::NOTIFICATION_ITEM_STARTED,
                    serde_json::json!({"item": {"id": "m1", "type": "agentMessage"}}),
                ),
                (
                    protocol::NOTIFICATION_AGENT_MESSAGE_DELTA,
                    serde_json::json!({"item_id": "m1", "delta": "Hello"}),
                ),
                (
                    protocol::NOTIFICATION_ITEM_COMPLETED,
                    serde_json::json!({"item": {"id": "m1", "type": "agentMessage", "text": "Hello"}}),
                ),
                (
                    protocol::NOTIFICATION_TURN_COMPLETED,
                    serde_json::json!({"status": "completed"}),
                ),
            ],
            false,
        );

        assert!(matches!(out[0], GenerationPart::StreamStart));
        assert!(matches!(&out[1], GenerationPart::TextStart{id, ..} if id == "m1"));
        assert!(matches!(&out[2], GenerationPart::TextDelta{id, delta, ..} if id == "m1" && delta == "Hello"));
        assert!(matches!(&out[3], GenerationPart::TextEnd{id, ..} if id == "m1"));
        assert!(matches!(out.last().unwrap(), GenerationPart::Finish{reason: FinishReason::Stop, ..}));
        for part in &out {
            if let Some(meta) = part.metadata() {
                assert_eq!(meta.thread_id.as_deref(), Some("thr_1"));
            }
        }
    }

    #[test]
    fn item_completed_without_delta_falls_back_to_full_text() {
        let out = drive(
            &[
                (
                    protocol::NOTIFICATION_ITEM_STARTED,
                    serde_json::json!({"item": {"id": "m1", "type": "agentMessage"}}),
                ),
                (
                    protocol::NOTIFICATION_ITEM_COMPLETED,
                    serde_json::json!({"item": {"id": "m1", "type": "agentMessage", "text": "whole message"}}),
                ),
            ],
            false,
        );
        assert!(matches!(&out[1], GenerationPart::TextDelta{delta, ..} if delta == "whole message"));
        assert!(matches!(out[2], GenerationPart::TextEnd{..}));
    }

    #[test]
    fn turn_completed_flushes_open_text_and_reasoning() {
        let out = drive(
            &[
                (
                    protocol::NOTIFICATION_ITEM_STARTED,
                    serde_json::json!({"item": {"id": "m1", "type": "agentMessage"}}),
                ),
                (
                    protocol::NOTIFICATION_ITEM_STARTED,
                    serde_json::json!({"item": {"id": "r1", "type": "reasoning"}}),
                ),
                (
                    protocol::NOTIFICATION_TURN_COMPLETED,
                    serde_json::json!({"status": "failed"}),
                ),
            ],
            false,
        );
        assert!(out.iter().any(|p| matches!(p, GenerationPart::TextEnd{id, ..} if id == "m1")));
        assert!(out.iter().any(|p| matches!(p, GenerationPart::ReasoningEnd{id, ..} if id == "r1")));
        assert!(matches!(out.last().unwrap(), GenerationPart::Finish{reason: FinishReason::Error, ..}));
    }

    #[test]
    fn plan_updates_reuse_the_same_call_id() {
        let out = drive(
            &[
                (protocol::NOTIFICATION_PLAN_UPDATED, serde_json::json!({"steps": ["a"]})),
                (protocol::NOTIFICATION_PLAN_UPDATED, serde_json::json!({"steps": ["a", "b"]})),
            ],
            true,
        );
        let tool_calls: Vec<_> = out
            .iter()
            .filter(|p| matches!(p, GenerationPart::ToolCall{..}))
            .collect();
        assert_eq!(tool_calls.len(), 1);
        let tool_results: Vec<_> = out
            .iter()
            .filter(|p| matches!(p, GenerationPart::ToolResult{..}))
            .collect();
        assert_eq!(tool_results.len(), 2);
    }

    #[test]
    fn diff_updates_are_dropped() {
        let out = drive(&[(protocol::NOTIFICATION_DIFF_UPDATED, serde_json::json!({"diff": "+foo"}))], false);
        assert!(out.is_empty());
    }

    #[test]
    fn wrapper_duplicates_do_not_double_emit() {
        let out = drive(
            &[
                (
                    protocol::NOTIFICATION_ITEM_STARTED,
                    serde_json::json!({"item": {"id": "c1", "type": "commandExecution", "command": "ls", "cwd": "/"}}),
                ),
                (
                    protocol::NOTIFICATION_COMMAND_EXECUTION_OUTPUT_DELTA,
                    serde_json::json!({"item_id": "c1", "delta": "file.txt\n"}),
                ),
                (protocol::NOTIFICATION_TOOL_CALL_STARTED, serde_json::json!({"item_id": "c1"})),
                (protocol::NOTIFICATION_TOOL_CALL_DELTA, serde_json::json!({"item_id": "c1", "delta": "ignored"})),
                (
                    protocol::NOTIFICATION_ITEM_COMPLETED,
                    serde_json::json!({"item": {"id": "c1", "type": "commandExecution", "aggregatedOutput": "file.txt\n", "exitCode": 0, "status": "completed"}}),
                ),
            ],
            false,
        );
        let preliminary_results: Vec<_> = out
            .iter()
            .filter(|p| matches!(p, GenerationPart::ToolResult{payload, ..} if payload.preliminary))
            .collect();
        assert_eq!(preliminary_results.len(), 1);
    }
}
