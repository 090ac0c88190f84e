//! Generation Orchestrator configuration: the enumerated options governing
//! the per-call flow, plus a plain struct-with-setters builder.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::approvals::ApprovalHandlers;
use crate::pool::PersistentScope;
use crate::tools::ToolRegistry;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportVariant {
    Stdio,
    WebSocket,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StdioTransportSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub current_dir: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WebSocketTransportSettings {
    pub url: String,
}

#[derive(Clone, Debug)]
pub enum TransportSettings {
    Stdio(StdioTransportSettings),
    WebSocket(WebSocketTransportSettings),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThreadDefaults {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub approval_policy: Option<String>,
    #[serde(default)]
    pub sandbox: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TurnDefaults {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub approval_policy: Option<String>,
    #[serde(default)]
    pub sandbox_policy: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub effort: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Either a fixed boolean or a per-call callback, matching the union type
/// `should_compact_on_resume: bool | (context) → bool`.
#[derive(Clone)]
pub enum CompactionDecision {
    Fixed(bool),
    Callback(Arc<dyn Fn(&CompactionContext) -> bool + Send + Sync>),
}

#[derive(Clone, Debug, Default)]
pub struct CompactionContext {
    pub thread_id: String,
}

impl CompactionDecision {
    pub fn evaluate(&self, context: &CompactionContext) -> bool {
        match self {
            CompactionDecision::Fixed(value) => *value,
            CompactionDecision::Callback(callback) => callback(context),
        }
    }
}

#[derive(Clone)]
pub struct CompactionConfig {
    pub should_compact_on_resume: CompactionDecision,
    pub strict: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            should_compact_on_resume: CompactionDecision::Fixed(false),
            strict: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DebugConfig {
    pub log_packets: bool,
    pub log_tool_calls: bool,
}

#[derive(Clone, Debug)]
pub struct PersistentConfig {
    pub scope: PersistentScope,
    pub key: Option<String>,
    pub pool_size: usize,
    pub idle_timeout: Duration,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            scope: PersistentScope::Provider,
            key: None,
            pool_size: 1,
            idle_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Full enumerated configuration for the orchestrator's per-call flow.
#[derive(Clone)]
pub struct BridgeConfig {
    pub default_model: Option<String>,
    pub client_info: ClientInfo,
    pub experimental_api_enabled: bool,
    pub transport_variant: TransportVariant,
    pub transport_settings: TransportSettings,
    pub thread_defaults: ThreadDefaults,
    pub turn_defaults: TurnDefaults,
    pub compaction: CompactionConfig,
    pub tools: ToolRegistry,
    pub tool_timeout: Duration,
    pub interrupt_timeout: Duration,
    pub approvals: ApprovalHandlers,
    pub debug: DebugConfig,
    pub persistent: Option<PersistentConfig>,
    pub emit_plan_updates: bool,
}

impl BridgeConfig {
    pub fn builder(transport_settings: TransportSettings) -> BridgeConfigBuilder {
        BridgeConfigBuilder::new(transport_settings)
    }
}

/// Plain struct + `with_*` setters, `Default`-driven.
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn new(transport_settings: TransportSettings) -> Self {
        let transport_variant = match &transport_settings {
            TransportSettings::Stdio(_) => TransportVariant::Stdio,
            TransportSettings::WebSocket(_) => TransportVariant::WebSocket,
        };
        Self {
            config: BridgeConfig {
                default_model: None,
                client_info: ClientInfo::default(),
                experimental_api_enabled: false,
                transport_variant,
                transport_settings,
                thread_defaults: ThreadDefaults::default(),
                turn_defaults: TurnDefaults::default(),
                compaction: CompactionConfig::default(),
                tools: ToolRegistry::new(),
                tool_timeout: Duration::from_secs(60),
                interrupt_timeout: Duration::from_secs(5),
                approvals: ApprovalHandlers::denying(),
                debug: DebugConfig::default(),
                persistent: None,
                emit_plan_updates: false,
            },
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.config.default_model = Some(model.into());
        self
    }

    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.config.client_info = client_info;
        self
    }

    pub fn with_experimental_api(mut self, enabled: bool) -> Self {
        self.config.experimental_api_enabled = enabled;
        self
    }

    pub fn with_thread_defaults(mut self, defaults: ThreadDefaults) -> Self {
        self.config.thread_defaults = defaults;
        self
    }

    pub fn with_turn_defaults(mut self, defaults: TurnDefaults) -> Self {
        self.config.turn_defaults = defaults;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.config.compaction = compaction;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.config.tools = tools;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.tool_timeout = timeout;
        self
    }

    pub fn with_interrupt_timeout(mut self, timeout: Duration) -> Self {
        self.config.interrupt_timeout = timeout;
        self
    }

    pub fn with_approvals(mut self, approvals: ApprovalHandlers) -> Self {
        self.config.approvals = approvals;
        self
    }

    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn with_persistent(mut self, persistent: PersistentConfig) -> Self {
        self.config.persistent = Some(persistent);
        self
    }

    pub fn with_emit_plan_updates(mut self, enabled: bool) -> Self {
        self.config.emit_plan_updates = enabled;
        self
    }

    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_conservative() {
        let config = BridgeConfig::builder(TransportSettings::Stdio(StdioTransportSettings {
            program: "codex".into(),
            ..Default::default()
        }))
        .build();
        assert!(!config.experimental_api_enabled);
        assert!(config.persistent.is_none());
        assert_eq!(config.tool_timeout, Duration::from_secs(60));
    }

    #[test]
    fn compaction_callback_is_evaluated() {
        let decision = CompactionDecision::Callback(Arc::new(|ctx: &CompactionContext| {
            ctx.thread_id == "thr_1"
        }));
        assert!(decision.evaluate(&CompactionContext {
            thread_id: "thr_1".into()
        }));
        assert!(!decision.evaluate(&CompactionContext {
            thread_id: "thr_2".into()
        }));
    }
}
