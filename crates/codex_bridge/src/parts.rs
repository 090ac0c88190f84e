//! The generation part vocabulary emitted by the
//! [`crate::mapper::EventMapper`]: a plain enum plus a small set of payload
//! structs, each stamped with provider metadata carrying a `thread_id` for
//! resumption.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unified outcome label for a completed turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Error,
    Other,
    ToolCalls,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Metadata this provider stamps onto every non-initial part so callers can
/// round-trip a `thread_id` for resumption.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderMetadata {
    pub thread_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPayload {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(default)]
    pub provider_executed: bool,
    #[serde(default)]
    pub dynamic: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolResultPayload {
    pub call_id: String,
    pub tool_name: String,
    pub result: Value,
    #[serde(default)]
    pub preliminary: bool,
}

/// One ordered, well-formed unit of the generation stream produced by the
/// event mapper for a single turn.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GenerationPart {
    StreamStart,
    TextStart {
        id: String,
        metadata: ProviderMetadata,
    },
    TextDelta {
        id: String,
        delta: String,
        metadata: ProviderMetadata,
    },
    TextEnd {
        id: String,
        metadata: ProviderMetadata,
    },
    ReasoningStart {
        id: String,
        metadata: ProviderMetadata,
    },
    ReasoningDelta {
        id: String,
        delta: String,
        metadata: ProviderMetadata,
    },
    ReasoningEnd {
        id: String,
        metadata: ProviderMetadata,
    },
    ToolCall {
        #[serde(flatten)]
        payload: ToolCallPayload,
        metadata: ProviderMetadata,
    },
    ToolResult {
        #[serde(flatten)]
        payload: ToolResultPayload,
        metadata: ProviderMetadata,
    },
    ToolInputStart {
        id: String,
        tool_name: String,
        metadata: ProviderMetadata,
    },
    ToolInputDelta {
        id: String,
        delta: String,
        metadata: ProviderMetadata,
    },
    ToolInputEnd {
        id: String,
        metadata: ProviderMetadata,
    },
    Finish {
        reason: FinishReason,
        usage: Usage,
        metadata: ProviderMetadata,
    },
    Error {
        message: String,
        metadata: ProviderMetadata,
    },
}

impl GenerationPart {
    /// `stream-start` carries no metadata; every other part does.
    pub fn metadata(&self) -> Option<&ProviderMetadata> {
        match self {
            GenerationPart::StreamStart => None,
            GenerationPart::TextStart { metadata, .. }
            | GenerationPart::TextDelta { metadata, .. }
            | GenerationPart::TextEnd { metadata, .. }
            | GenerationPart::ReasoningStart { metadata, .. }
            | GenerationPart::ReasoningDelta { metadata, .. }
            | GenerationPart::ReasoningEnd { metadata, .. }
            | GenerationPart::ToolCall { metadata, .. }
            | GenerationPart::ToolResult { metadata, .. }
            | GenerationPart::ToolInputStart { metadata, .. }
            | GenerationPart::ToolInputDelta { metadata, .. }
            | GenerationPart::ToolInputEnd { metadata, .. }
            | GenerationPart::Finish { metadata, .. }
            | GenerationPart::Error { metadata, .. } => Some(metadata),
        }
    }
}
