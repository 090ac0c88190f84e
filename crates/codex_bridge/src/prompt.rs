//! The abstract host-SDK input schema, developer-instruction derivation,
//! turn-input mapping, and inline-binary URL resolution.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Provider id used as the key for this crate's `thread_id` provider
/// metadata field on assistant messages/parts. Resuming a prior thread
/// means reading this field back off the last assistant message.
pub const PROVIDER_ID: &str = "codex_bridge";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    File {
        #[serde(default)]
        media_type: Option<String>,
        data: FileData,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        input: Value,
        #[serde(default)]
        provider_metadata: Option<Value>,
    },
    ToolResult {
        call_id: String,
        #[serde(default)]
        tool_name: Option<String>,
        output: Value,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FileData {
    Url { url: String },
    Inline { bytes: Vec<u8> },
    Base64 { base64: String },
}

/// One turn of the host SDK's normalized conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default)]
    pub provider_metadata: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    fn parts(&self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(text) => vec![ContentPart::Text { text: text.clone() }],
            MessageContent::Parts(parts) => parts.clone(),
        }
    }
}

pub type Prompt = Vec<PromptMessage>;

/// Concatenates all system messages in order, blank-line separated, trimmed;
/// absent if empty.
pub fn developer_instructions(prompt: &Prompt) -> Option<String> {
    let joined = prompt
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| match &m.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Scans assistant messages last-to-first for a stamped `thread_id` in
/// provider metadata, on either the message or any of its parts.
pub fn find_resume_thread_id(prompt: &Prompt) -> Option<String> {
    for message in prompt.iter().rev() {
        if message.role != Role::Assistant {
            continue;
        }
        if let Some(id) = extract_thread_id(message.provider_metadata.as_ref()) {
            return Some(id);
        }
        if let MessageContent::Parts(parts) = &message.content {
            for part in parts {
                if let ContentPart::ToolCall {
                    provider_metadata, ..
                } = part
                {
                    if let Some(id) = extract_thread_id(provider_metadata.as_ref()) {
                        return Some(id);
                    }
                }
            }
        }
    }
    None
}

fn extract_thread_id(metadata: Option<&Value>) -> Option<String> {
    let metadata = metadata?;
    metadata
        .get(PROVIDER_ID)
        .and_then(|v| v.get("thread_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// One item in the sidecar's `turn/start` input vocabulary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnInputItem {
    Text { text: String },
    LocalImage { path: String },
    Image { url: String },
}

/// Resolves inline binary payloads (images, text files) to URLs, tracking
/// every URL it produced so `cleanup()` can best-effort remove them.
#[async_trait::async_trait]
pub trait FileResolver: Send + Sync {
    async fn write(&self, media_type: Option<&str>, bytes: &[u8]) -> Result<String>;
    async fn cleanup(&self);
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Injectable writer used by [`FileResolver::write`] implementations, e.g. a
/// temp-file-backed one for production and an in-memory one for tests.
pub trait InlineWriter: Send + Sync {
    fn write<'a>(&'a self, media_type: Option<&'a str>, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>>;
}

pub struct TrackingFileResolver {
    writer: Arc<dyn InlineWriter>,
    produced: tokio::sync::Mutex<Vec<String>>,
    remove: Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>,
}

impl TrackingFileResolver {
    pub fn new(
        writer: Arc<dyn InlineWriter>,
        remove: Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>,
    ) -> Self {
        Self {
            writer,
            produced: tokio::sync::Mutex::new(Vec::new()),
            remove,
        }
    }
}

#[async_trait::async_trait]
impl FileResolver for TrackingFileResolver {
    async fn write(&self, media_type: Option<&str>, bytes: &[u8]) -> Result<String> {
        let url = self.writer.write(media_type, bytes).await?;
        self.produced.lock().await.push(url.clone());
        Ok(url)
    }

    async fn cleanup(&self) {
        let urls = std::mem::take(&mut *self.produced.lock().await);
        for url in urls {
            (self.remove)(url).await;
        }
    }
}

fn decode_file_data(data: &FileData) -> Option<(Option<Vec<u8>>, Option<String>)> {
    match data {
        FileData::Url { url } => Some((None, Some(url.clone()))),
        FileData::Inline { bytes } => Some((Some(bytes.clone()), None)),
        FileData::Base64 { base64 } => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(base64)
                .ok()
                .map(|bytes| (Some(bytes), None))
        }
    }
}

/// Maps one file content part to the sidecar's turn-input vocabulary,
/// resolving inline/base64 payloads via `resolver`. `image/*` is written
/// and substituted as a URL; `text/*` is decoded and inlined as text;
/// unsupported media types are silently skipped.
async fn map_file_part(
    media_type: Option<&str>,
    data: &FileData,
    resolver: &dyn FileResolver,
) -> Option<TurnInputItem> {
    if let FileData::Url { url } = data {
        return Some(classify_url(media_type, url));
    }

    let (bytes, _) = decode_file_data(data)?;
    let bytes = bytes?;

    match media_type {
        Some(mt) if mt.starts_with("image/") => {
            let url = resolver.write(media_type, &bytes).await.ok()?;
            Some(classify_url(media_type, &url))
        }
        Some(mt) if mt.starts_with("text/") => {
            let text = String::from_utf8(bytes).ok()?;
            Some(TurnInputItem::Text { text })
        }
        _ => None,
    }
}

fn classify_url(_media_type: Option<&str>, url: &str) -> TurnInputItem {
    if let Some(path) = url.strip_prefix("file://") {
        TurnInputItem::LocalImage {
            path: path.to_string(),
        }
    } else {
        TurnInputItem::Image {
            url: url.to_string(),
        }
    }
}

/// Maps the prompt to turn input. Fresh threads walk all user messages,
/// flushing accumulated text before each non-text part; resumed threads map
/// only the last user message.
pub async fn map_turn_input(
    prompt: &Prompt,
    resuming: bool,
    resolver: &dyn FileResolver,
) -> Vec<TurnInputItem> {
    let user_messages: Vec<&PromptMessage> = if resuming {
        prompt
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .into_iter()
            .collect()
    } else {
        prompt.iter().filter(|m| m.role == Role::User).collect()
    };

    let mut items = Vec::new();
    let mut buffer = String::new();

    for message in user_messages {
        for part in message.content.parts() {
            match part {
                ContentPart::Text { text } => {
                    if !buffer.is_empty() {
                        buffer.push('\n');
                    }
                    buffer.push_str(&text);
                }
                ContentPart::File { media_type, data } => {
                    if !buffer.is_empty() {
                        items.push(TurnInputItem::Text {
                            text: std::mem::take(&mut buffer),
                        });
                    }
                    if let Some(item) = map_file_part(media_type.as_deref(), &data, resolver).await {
                        items.push(item);
                    }
                }
                ContentPart::ToolCall { .. } | ContentPart::ToolResult { .. } => {}
            }
        }
    }

    if !buffer.is_empty() {
        items.push(TurnInputItem::Text { text: buffer });
    }

    items
}

/// Extracts the host-SDK tool result matching `call_id` from the prompt's
/// trailing tool message, for the cross-call continuation branch. Folds
/// text/JSON outputs to `input_text`.
pub fn find_tool_result(prompt: &Prompt, call_id: &str) -> Option<Value> {
    for message in prompt.iter().rev() {
        if message.role != Role::Tool {
            continue;
        }
        if let MessageContent::Parts(parts) = &message.content {
            for part in parts {
                if let ContentPart::ToolResult {
                    call_id: id,
                    output,
                    ..
                } = part
                {
                    if id == call_id {
                        return Some(output.clone());
                    }
                }
            }
        }
    }
    None
}

/// Folds a host-SDK tool output value to plain text the way the wire
/// encoding requires: text outputs pass through, JSON is stringified.
fn fold_tool_output(output: &Value) -> String {
    match output.get("type").and_then(Value::as_str) {
        Some("text") => output
            .get("value")
            .or_else(|| output.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some("json") => output
            .get("value")
            .map(|v| serde_json::to_string(v).unwrap_or_default())
            .unwrap_or_default(),
        _ => match output {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        },
    }
}

/// As [`find_tool_result`], folded to the text the wire response carries.
pub fn find_tool_result_text(prompt: &Prompt, call_id: &str) -> Option<String> {
    find_tool_result(prompt, call_id).map(|output| fold_tool_output(&output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn developer_instructions_concatenates_system_messages() {
        let prompt: Prompt = vec![
            PromptMessage {
                role: Role::System,
                content: MessageContent::Text("be terse".into()),
                provider_metadata: None,
            },
            PromptMessage {
                role: Role::System,
                content: MessageContent::Text("use markdown".into()),
                provider_metadata: None,
            },
            PromptMessage {
                role: Role::User,
                content: MessageContent::Text("hi".into()),
                provider_metadata: None,
            },
        ];
        assert_eq!(
            developer_instructions(&prompt),
            Some("be terse\n\nuse markdown".to_string())
        );
    }

    #[test]
    fn developer_instructions_absent_when_empty() {
        let prompt: Prompt = vec![PromptMessage {
            role: Role::User,
            content: MessageContent::Text("hi".into()),
            provider_metadata: None,
        }];
        assert_eq!(developer_instructions(&prompt), None);
    }

    #[test]
    fn finds_resume_thread_id_from_last_assistant_message() {
        let prompt: Prompt = vec![
            PromptMessage {
                role: Role::Assistant,
                content: MessageContent::Text("old".into()),
                provider_metadata: Some(serde_json::json!({"codex_bridge": {"thread_id": "thr_old"}})),
            },
            PromptMessage {
                role: Role::Assistant,
                content: MessageContent::Text("new".into()),
                provider_metadata: Some(serde_json::json!({"codex_bridge": {"thread_id": "thr_new"}})),
            },
        ];
        assert_eq!(find_resume_thread_id(&prompt), Some("thr_new".to_string()));
    }

    #[test]
    fn folds_text_typed_tool_output_to_its_value() {
        let prompt: Prompt = vec![PromptMessage {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                call_id: "c1".into(),
                tool_name: Some("lookup_ticket".into()),
                output: serde_json::json!({"type": "text", "value": "open"}),
            }]),
            provider_metadata: None,
        }];
        assert_eq!(find_tool_result_text(&prompt, "c1"), Some("open".to_string()));
    }

    #[tokio::test]
    async fn map_turn_input_flushes_text_before_image() {
        struct NoopResolver;
        #[async_trait::async_trait]
        impl FileResolver for NoopResolver {
            async fn write(&self, _media_type: Option<&str>, _bytes: &[u8]) -> Result<String> {
                Ok("file:///tmp/x.png".to_string())
            }
            async fn cleanup(&self) {}
        }

        let prompt: Prompt = vec![PromptMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "look at this".into() },
                ContentPart::File {
                    media_type: Some("image/png".into()),
                    data: FileData::Inline { bytes: vec![1, 2, 3] },
                },
            ]),
            provider_metadata: None,
        }];

        let items = map_turn_input(&prompt, false, &NoopResolver).await;
        assert!(matches!(&items[0], TurnInputItem::Text{text} if text == "look at this"));
        assert!(matches!(&items[1], TurnInputItem::LocalImage{path} if path == "/tmp/x.png"));
    }
}
