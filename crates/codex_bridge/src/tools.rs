//! Tool registry and wire-encoding helpers for the inbound tool-call
//! request method. The handler itself lives on `orchestrator::install_tool_dispatch`,
//! which needs to route a single inbound request between provider-executed
//! tools (answered here) and host-managed ones (parked across calls), so it
//! owns registration directly rather than through a standalone `register()`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::rpc::HandlerResult;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Context passed to a tool's `execute` callback.
#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub call_id: Option<String>,
    pub tool_name: String,
}

/// A registered tool: advertised schema plus local executor.
#[derive(Clone)]
pub struct ToolDefinition {
    pub description: Option<String>,
    pub input_schema: Value,
    pub execute: Arc<dyn Fn(Value, ToolContext) -> BoxFuture<Result<Value, String>> + Send + Sync>,
}

/// Advertised-only schema, for merging into `thread/start`'s advertised
/// tool list.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, definition: ToolDefinition) {
        self.tools.insert(name.into(), definition);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|(name, def)| ToolSchema {
                name: name.clone(),
                description: def.description.clone(),
                input_schema: def.input_schema.clone(),
            })
            .collect()
    }

    /// Merges `self` with `other`, keeping `other`'s entry on a name
    /// conflict: caller-supplied tools win over provider-level ones.
    pub fn merge_caller_wins(&self, caller: &ToolRegistry) -> ToolRegistry {
        let mut merged = self.tools.clone();
        for (name, def) in &caller.tools {
            merged.insert(name.clone(), def.clone());
        }
        ToolRegistry { tools: merged }
    }
}

#[derive(serde::Serialize)]
struct ToolCallResult {
    success: bool,
    #[serde(rename = "content_items")]
    content_items: Vec<ToolCallContentItem>,
}

#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolCallContentItem {
    InputText { text: String },
    InputImage { image_url: String },
}

pub(crate) fn failure_result(message: impl Into<String>) -> HandlerResult {
    Ok(serde_json::to_value(ToolCallResult {
        success: false,
        content_items: vec![ToolCallContentItem::InputText {
            text: message.into(),
        }],
    })
    .expect("ToolCallResult always serializes"))
}

/// Encodes a tool's return value as the wire's `content_items` union. A
/// `{"type": "image", "image_url": "..."}` object becomes `input_image`;
/// everything else (including arbitrary JSON) folds to `input_text`, json-
/// stringified unless it's already a plain string.
pub(crate) fn success_result(value: Value) -> HandlerResult {
    let item = match &value {
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("image") => {
            ToolCallContentItem::InputImage {
                image_url: map.get("image_url").and_then(Value::as_str).unwrap_or_default().to_string(),
            }
        }
        Value::String(s) => ToolCallContentItem::InputText { text: s.clone() },
        other => ToolCallContentItem::InputText {
            text: serde_json::to_string(other).unwrap_or_default(),
        },
    };
    Ok(serde_json::to_value(ToolCallResult {
        success: true,
        content_items: vec![item],
    })
    .expect("ToolCallResult always serializes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_caller_wins_overrides_matching_names() {
        let mut provider = ToolRegistry::new();
        provider.register(
            "lookup",
            ToolDefinition {
                description: Some("provider".into()),
                input_schema: serde_json::json!({}),
                execute: Arc::new(|_args, _ctx| Box::pin(async { Ok(Value::Null) })),
            },
        );
        let mut caller = ToolRegistry::new();
        caller.register(
            "lookup",
            ToolDefinition {
                description: Some("caller".into()),
                input_schema: serde_json::json!({}),
                execute: Arc::new(|_args, _ctx| Box::pin(async { Ok(Value::Null) })),
            },
        );

        let merged = provider.merge_caller_wins(&caller);
        let schema = merged.schemas().into_iter().find(|s| s.name == "lookup").unwrap();
        assert_eq!(schema.description.as_deref(), Some("caller"));
    }

    #[test]
    fn failure_result_marks_success_false() {
        let result = failure_result("boom").unwrap();
        assert_eq!(result["success"], false);
    }

    #[test]
    fn success_result_encodes_text_values_as_input_text() {
        let result = success_result(Value::String("open".into())).unwrap();
        assert_eq!(result["content_items"][0]["type"], "input_text");
        assert_eq!(result["content_items"][0]["text"], "open");
    }

    #[test]
    fn success_result_encodes_image_values_as_input_image() {
        let result = success_result(serde_json::json!({"type": "image", "image_url": "https://example/x.png"})).unwrap();
        assert_eq!(result["content_items"][0]["type"], "input_image");
        assert_eq!(result["content_items"][0]["image_url"], "https://example/x.png");
    }
}
