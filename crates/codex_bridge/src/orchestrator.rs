//! Generation Orchestrator: the per-call state machine composing the
//! Transport, RPC multiplexer, Event Mapper, Worker Pool, Persistent
//! Transport, Approvals and Tools dispatchers, and Prompt Mapper into one
//! `generate()` call: connect/initialize/request/stream-events/disconnect,
//! generalized to the thread/turn protocol with pooling, handshake caching,
//! and cross-call tool-result continuation layered on top.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tracing::warn;

use crate::approvals;
use crate::config::{BridgeConfig, PersistentConfig, TransportSettings};
use crate::error::{BridgeError, Result};
use crate::mapper::EventMapper;
use crate::parts::{FinishReason, GenerationPart, ProviderMetadata, Usage};
use crate::persistent_transport::PersistentTransport;
use crate::pool::{GlobalPoolHandle, GlobalPoolRegistry, ParkedCall, PersistentScope, Worker, WorkerPool};
use crate::prompt::{self, FileResolver, Prompt};
use crate::protocol;
use crate::rpc::RpcClient;
use crate::tools::{self, ToolRegistry};
use crate::transport::{StdioTransport, StdioTransportConfig, Transport, WebSocketTransport};

const NOTIFICATION_METHODS: &[&str] = &[
    protocol::NOTIFICATION_TURN_STARTED,
    protocol::NOTIFICATION_TURN_COMPLETED,
    protocol::NOTIFICATION_ITEM_STARTED,
    protocol::NOTIFICATION_ITEM_COMPLETED,
    protocol::NOTIFICATION_AGENT_MESSAGE_DELTA,
    protocol::NOTIFICATION_REASONING_TEXT_DELTA,
    protocol::NOTIFICATION_REASONING_SUMMARY_TEXT_DELTA,
    protocol::NOTIFICATION_REASONING_SUMMARY_PART_ADDED,
    protocol::NOTIFICATION_PLAN_DELTA,
    protocol::NOTIFICATION_FILE_CHANGE_OUTPUT_DELTA,
    protocol::NOTIFICATION_COMMAND_EXECUTION_OUTPUT_DELTA,
    protocol::NOTIFICATION_TOKEN_USAGE_UPDATED,
    protocol::NOTIFICATION_PLAN_UPDATED,
    protocol::NOTIFICATION_DIFF_UPDATED,
    protocol::NOTIFICATION_MCP_TOOL_CALL_PROGRESS,
    protocol::NOTIFICATION_TOOL_CALL_STARTED,
    protocol::NOTIFICATION_TOOL_CALL_DELTA,
    protocol::NOTIFICATION_TOOL_CALL_FINISHED,
];

/// Cooperative cancellation handle for one `generate()` call. Cloning shares
/// the same underlying flag; `trigger()` is idempotent.
#[derive(Clone)]
pub struct AbortSignal {
    notify: Arc<Notify>,
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already triggered, otherwise waits. Safe to
    /// await from more than one place concurrently.
    pub async fn triggered(&self) {
        if self.is_aborted() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-facing input to one generation call.
pub struct GenerateRequest {
    pub prompt: Prompt,
    pub tools: ToolRegistry,
    pub file_resolver: Arc<dyn FileResolver>,
    pub abort: AbortSignal,
}

impl GenerateRequest {
    pub fn new(prompt: Prompt, file_resolver: Arc<dyn FileResolver>) -> Self {
        Self {
            prompt,
            tools: ToolRegistry::new(),
            file_resolver,
            abort: AbortSignal::new(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }
}

/// Pull-based handle to one call's part stream.
pub struct GenerationStream {
    rx: mpsc::UnboundedReceiver<GenerationPart>,
}

impl GenerationStream {
    pub async fn next(&mut self) -> Option<GenerationPart> {
        self.rx.recv().await
    }

    pub async fn collect(mut self) -> Vec<GenerationPart> {
        let mut parts = Vec::new();
        while let Some(part) = self.next().await {
            parts.push(part);
        }
        parts
    }
}

/// Folded non-streaming view over a [`GenerationStream`], for callers that
/// don't need incremental delivery.
#[derive(Debug, Default)]
pub struct GenerateResult {
    pub content: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
    pub provider_metadata: ProviderMetadata,
    pub warnings: Vec<String>,
    pub pass_through: Vec<GenerationPart>,
}

pub async fn generate_once(mut stream: GenerationStream) -> GenerateResult {
    let mut result = GenerateResult::default();
    let mut order: Vec<String> = Vec::new();
    let mut texts: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    while let Some(part) = stream.next().await {
        if let Some(metadata) = part.metadata() {
            result.provider_metadata = metadata.clone();
        }
        match &part {
            GenerationPart::TextDelta { id, delta, .. } => {
                if !texts.contains_key(id) {
                    order.push(id.clone());
                }
                texts.entry(id.clone()).or_default().push_str(delta);
            }
            GenerationPart::Finish { reason, usage, .. } => {
                result.finish_reason = Some(*reason);
                result.usage = usage.clone();
            }
            GenerationPart::Error { message, .. } => {
                result.warnings.push(message.clone());
                result.pass_through.push(part);
            }
            GenerationPart::ToolCall { .. } | GenerationPart::ToolResult { .. } => {
                result.pass_through.push(part);
            }
            _ => {}
        }
    }

    result.content = order.into_iter().filter_map(|id| texts.remove(&id)).collect::<Vec<_>>().join("");
    result
}

fn build_transport(settings: &TransportSettings) -> Arc<dyn Transport> {
    match settings {
        TransportSettings::Stdio(settings) => Arc::new(StdioTransport::new(StdioTransportConfig {
            program: PathBuf::from(&settings.program),
            args: settings.args.clone(),
            env: settings.env.clone(),
            current_dir: settings.current_dir.as_ref().map(PathBuf::from),
            shutdown_grace: Duration::from_secs(5),
        })),
        TransportSettings::WebSocket(settings) => Arc::new(WebSocketTransport::new(settings.url.clone())),
    }
}

enum PersistentPool {
    Provider(WorkerPool),
    Global(GlobalPoolHandle),
}

impl PersistentPool {
    fn pool(&self) -> WorkerPool {
        match self {
            PersistentPool::Provider(pool) => pool.clone(),
            PersistentPool::Global(handle) => handle.pool().clone(),
        }
    }
}

async fn build_persistent_pool(
    config: &BridgeConfig,
    persistent: &PersistentConfig,
    global_registry: &GlobalPoolRegistry,
) -> Result<PersistentPool> {
    let pool_size = persistent.pool_size.max(1);
    match persistent.scope {
        PersistentScope::Provider => {
            let workers = (0..pool_size)
                .map(|_| Worker::new(build_transport(&config.transport_settings), persistent.idle_timeout))
                .collect();
            Ok(PersistentPool::Provider(WorkerPool::new(workers)))
        }
        PersistentScope::Global => {
            let key = persistent
                .key
                .clone()
                .ok_or_else(|| BridgeError::ProtocolViolation("global persistent scope requires a key".into()))?;
            let idle_timeout = persistent.idle_timeout;
            let transport_settings = config.transport_settings.clone();
            let handle = global_registry
                .acquire(
                    &key,
                    move || {
                        let workers = (0..pool_size)
                            .map(|_| Worker::new(build_transport(&transport_settings), idle_timeout))
                            .collect();
                        WorkerPool::new(workers)
                    },
                    pool_size,
                    idle_timeout,
                )
                .await?;
            Ok(PersistentPool::Global(handle))
        }
    }
}

static DEFAULT_GLOBAL_REGISTRY: OnceLock<GlobalPoolRegistry> = OnceLock::new();

fn default_global_registry() -> GlobalPoolRegistry {
    DEFAULT_GLOBAL_REGISTRY.get_or_init(GlobalPoolRegistry::new).clone()
}

/// Owns the pool (if any) and drives `generate()` calls against it.
pub struct Orchestrator {
    config: Arc<BridgeConfig>,
    persistent: Option<PersistentPool>,
}

impl Orchestrator {
    pub async fn new(config: BridgeConfig) -> Result<Self> {
        Self::with_global_registry(config, default_global_registry()).await
    }

    /// As [`Self::new`], with an injectable global-pool registry so tests
    /// don't share process-wide state with each other.
    pub async fn with_global_registry(config: BridgeConfig, global_registry: GlobalPoolRegistry) -> Result<Self> {
        let persistent = match &config.persistent {
            None => None,
            Some(persistent_config) => Some(build_persistent_pool(&config, persistent_config, &global_registry).await?),
        };
        Ok(Self {
            config: Arc::new(config),
            persistent,
        })
    }

    pub async fn shutdown(self) {
        match self.persistent {
            Some(PersistentPool::Provider(pool)) => pool.shutdown().await,
            Some(PersistentPool::Global(handle)) => handle.release().await,
            None => {}
        }
    }

    /// Spawns the call's driver task and returns a stream the caller pulls
    /// from; the task keeps running even if the stream is dropped early
    /// (the abort signal is the only way to stop it short of completion).
    pub fn generate(&self, request: GenerateRequest) -> GenerationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let pool = self.persistent.as_ref().map(PersistentPool::pool);
        tokio::spawn(run_call(config, pool, request, tx));
        GenerationStream { rx }
    }
}

enum Lease {
    Persistent { worker: Worker, pool: WorkerPool, rpc: RpcClient },
    Direct { rpc: RpcClient },
}

impl Lease {
    fn rpc_client(&self) -> RpcClient {
        match self {
            Lease::Persistent { rpc, .. } => rpc.clone(),
            Lease::Direct { rpc } => rpc.clone(),
        }
    }
}

async fn race<T>(abort: &AbortSignal, fut: impl std::future::Future<Output = T>) -> Result<T> {
    tokio::select! {
        value = fut => Ok(value),
        _ = abort.triggered() => Err(BridgeError::Aborted),
    }
}

async fn acquire_lease(config: &BridgeConfig, pool: Option<&WorkerPool>, abort: &AbortSignal) -> Result<Lease> {
    match pool {
        Some(pool) => {
            let worker = pool.acquire(abort.triggered()).await?;
            let transport = PersistentTransport::new(worker.clone()).await;
            transport.install_initialize_cache().await;
            let rpc = RpcClient::new(transport as Arc<dyn Transport>).await;
            race(abort, rpc.connect()).await??;
            Ok(Lease::Persistent {
                worker,
                pool: pool.clone(),
                rpc,
            })
        }
        None => {
            let transport = build_transport(&config.transport_settings);
            let rpc = RpcClient::new(transport).await;
            race(abort, rpc.connect()).await??;
            Ok(Lease::Direct { rpc })
        }
    }
}

async fn cleanup_lease(lease: Lease) {
    match lease {
        Lease::Persistent { worker, pool, rpc } => {
            rpc.clear_handlers().await;
            rpc.disconnect().await;
            pool.release(worker).await;
        }
        Lease::Direct { rpc } => {
            rpc.disconnect().await;
        }
    }
}

async fn run_call(
    config: Arc<BridgeConfig>,
    pool: Option<WorkerPool>,
    request: GenerateRequest,
    tx: mpsc::UnboundedSender<GenerationPart>,
) {
    let GenerateRequest {
        prompt,
        tools: call_tools,
        file_resolver,
        abort,
    } = request;
    let mapper = Arc::new(AsyncMutex::new(EventMapper::new(config.emit_plan_updates)));

    let outcome = run_call_inner(&config, pool.as_ref(), &prompt, call_tools, file_resolver.as_ref(), &abort, &mapper, &tx).await;

    if let Err(err) = outcome {
        let mut out = Vec::new();
        mapper.lock().await.emit_error(err.to_string(), &mut out);
        for part in out {
            let _ = tx.send(part);
        }
    }

    file_resolver.cleanup().await;
}

async fn run_call_inner(
    config: &BridgeConfig,
    pool: Option<&WorkerPool>,
    prompt: &Prompt,
    call_tools: ToolRegistry,
    file_resolver: &dyn FileResolver,
    abort: &AbortSignal,
    mapper: &Arc<AsyncMutex<EventMapper>>,
    tx: &mpsc::UnboundedSender<GenerationPart>,
) -> Result<()> {
    let lease = acquire_lease(config, pool, abort).await?;
    let outcome = drive_lease(config, &lease, call_tools, prompt, file_resolver, mapper, tx, abort).await;
    cleanup_lease(lease).await;
    outcome
}

async fn drive_lease(
    config: &BridgeConfig,
    lease: &Lease,
    call_tools: ToolRegistry,
    prompt: &Prompt,
    file_resolver: &dyn FileResolver,
    mapper: &Arc<AsyncMutex<EventMapper>>,
    tx: &mpsc::UnboundedSender<GenerationPart>,
    abort: &AbortSignal,
) -> Result<()> {
    let rpc_client = lease.rpc_client();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(String, Option<Value>)>();
    for method in NOTIFICATION_METHODS {
        let sender = event_tx.clone();
        let method_owned = (*method).to_string();
        rpc_client
            .on_notification(method, move |params| {
                let _ = sender.send((method_owned.clone(), params));
            })
            .await;
    }
    drop(event_tx);

    approvals::register(&rpc_client, config.approvals.clone()).await;

    let turn_done = Arc::new(Notify::new());

    if let Lease::Persistent { worker, .. } = lease {
        if let Some(parked) = worker.peek_parked_call().await {
            return run_continuation(config, lease, worker, parked, prompt, mapper, tx, &mut event_rx, &turn_done, abort).await;
        }
    }

    run_normal(config, lease, call_tools, prompt, file_resolver, mapper, tx, &mut event_rx, &turn_done, abort).await
}

/// Signalled by a parked tool call's handler so [`drive_notifications`] can
/// stop waiting on notifications that will never arrive: the turn already
/// ended via `tool-calls` rather than via `turn/completed`.
async fn install_tool_dispatch(
    rpc_client: &RpcClient,
    provider_tools: ToolRegistry,
    call_tools: ToolRegistry,
    worker_for_parking: Option<Worker>,
    tool_timeout: Duration,
    tx: mpsc::UnboundedSender<GenerationPart>,
    mapper: Arc<AsyncMutex<EventMapper>>,
    turn_done: Arc<Notify>,
) {
    let host_managed_names: HashSet<String> = call_tools.schemas().into_iter().map(|s| s.name).collect();

    rpc_client
        .on_request_with_id(protocol::METHOD_ITEM_TOOL_CALL, move |id, params| {
            let provider_tools = provider_tools.clone();
            let host_managed_names = host_managed_names.clone();
            let worker_for_parking = worker_for_parking.clone();
            let tx = tx.clone();
            let mapper = mapper.clone();
            let turn_done = turn_done.clone();
            async move {
                let params = params.unwrap_or(Value::Null);
                let tool_name = params
                    .get("name")
                    .or_else(|| params.get("tool_name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = params.get("arguments").or_else(|| params.get("input")).cloned().unwrap_or(Value::Null);
                let thread_id = params.get("thread_id").and_then(Value::as_str).map(str::to_string);
                let turn_id = params.get("turn_id").and_then(Value::as_str).map(str::to_string);
                // The sidecar is expected to always supply a `call_id`, but mint one
                // rather than parking/responding under an empty id if it's ever absent.
                let call_id = params
                    .get("call_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

                if let Some(tool) = provider_tools.get(&tool_name) {
                    let execute = tool.execute.clone();
                    let context = tools::ToolContext {
                        thread_id,
                        turn_id,
                        call_id: Some(call_id),
                        tool_name: tool_name.clone(),
                    };
                    return match tokio::time::timeout(tool_timeout, execute(arguments, context)).await {
                        Ok(Ok(value)) => tools::success_result(value),
                        Ok(Err(message)) => tools::failure_result(message),
                        Err(_) => tools::failure_result(format!("tool `{tool_name}` timed out")),
                    };
                }

                if host_managed_names.contains(&tool_name) {
                    let Some(worker) = worker_for_parking else {
                        return tools::failure_result(format!(
                            "tool `{tool_name}` is host-managed but the transport is not persistent"
                        ));
                    };

                    let (responder_tx, responder_rx) = oneshot::channel();
                    worker.set_parked_responder(responder_tx).await;
                    worker
                        .park_tool_call(ParkedCall {
                            request_id: id,
                            call_id: call_id.clone(),
                            tool_name: tool_name.clone(),
                            arguments: arguments.clone(),
                            thread_id,
                        })
                        .await;

                    let mut out = Vec::new();
                    mapper.lock().await.emit_parked_tool_call(&call_id, &tool_name, arguments, &mut out);
                    for part in out {
                        let _ = tx.send(part);
                    }
                    turn_done.notify_one();

                    return match responder_rx.await {
                        Ok(result) => result,
                        Err(_) => Err(crate::rpc::HandlerError("parked tool call was abandoned".into())),
                    };
                }

                tools::failure_result(format!("unknown tool `{tool_name}`"))
            }
        })
        .await;
}

fn resolve_thread_id(value: &Value) -> Option<String> {
    if let Some(id) = value.get("thread_id").and_then(Value::as_str) {
        return Some(id.to_string());
    }
    value.get("thread").and_then(|t| t.get("id")).and_then(Value::as_str).map(str::to_string)
}

fn resolve_turn_id(value: &Value) -> Option<String> {
    if let Some(id) = value.get("turn_id").and_then(Value::as_str) {
        return Some(id.to_string());
    }
    value.get("turn").and_then(|t| t.get("id")).and_then(Value::as_str).map(str::to_string)
}

async fn drive_notifications(
    event_rx: &mut mpsc::UnboundedReceiver<(String, Option<Value>)>,
    mapper: &Arc<AsyncMutex<EventMapper>>,
    tx: &mpsc::UnboundedSender<GenerationPart>,
    turn_done: &Arc<Notify>,
    abort: &AbortSignal,
) {
    loop {
        tokio::select! {
            received = event_rx.recv() => {
                let Some((method, params)) = received else { return };
                let mut out = Vec::new();
                {
                    let mut mapper = mapper.lock().await;
                    mapper.handle_notification(&method, &params.unwrap_or(Value::Null), &mut out);
                }
                let finished = out.iter().any(|part| matches!(part, GenerationPart::Finish { .. }));
                for part in out {
                    let _ = tx.send(part);
                }
                if finished {
                    return;
                }
            }
            _ = turn_done.notified() => return,
            _ = abort.triggered() => return,
        }
    }
}

/// Normal per-call flow: initialize (possibly synthesized), open or resume a
/// thread, optionally compact, start a turn, then stream until finish.
#[allow(clippy::too_many_arguments)]
async fn run_normal(
    config: &BridgeConfig,
    lease: &Lease,
    call_tools: ToolRegistry,
    prompt: &Prompt,
    file_resolver: &dyn FileResolver,
    mapper: &Arc<AsyncMutex<EventMapper>>,
    tx: &mpsc::UnboundedSender<GenerationPart>,
    event_rx: &mut mpsc::UnboundedReceiver<(String, Option<Value>)>,
    turn_done: &Arc<Notify>,
    abort: &AbortSignal,
) -> Result<()> {
    let rpc_client = lease.rpc_client();
    let worker_for_parking = match lease {
        Lease::Persistent { worker, .. } => Some(worker.clone()),
        Lease::Direct { .. } => None,
    };

    let merged_tools = config.tools.merge_caller_wins(&call_tools);
    let dynamic_tools_present = !merged_tools.is_empty();
    if config.experimental_api_enabled || dynamic_tools_present {
        install_tool_dispatch(
            &rpc_client,
            config.tools.clone(),
            call_tools,
            worker_for_parking,
            config.tool_timeout,
            tx.clone(),
            mapper.clone(),
            turn_done.clone(),
        )
        .await;
    }

    let init_params = serde_json::json!({
        "client_info": {
            "name": config.client_info.name,
            "version": config.client_info.version,
            "title": config.client_info.title,
        },
        "capabilities": { "tools": dynamic_tools_present },
    });
    rpc_client
        .request(protocol::METHOD_INITIALIZE, Some(init_params), config.tool_timeout)
        .await
        .map_err(BridgeError::from)?;
    rpc_client.notify(protocol::METHOD_INITIALIZED, None).await?;

    let developer_instructions = prompt::developer_instructions(prompt);
    let resume_thread_id = prompt::find_resume_thread_id(prompt);

    let thread_id = if let Some(resume_thread_id) = resume_thread_id.clone() {
        let params = serde_json::json!({
            "thread_id": resume_thread_id,
            "persist_extended_history": false,
            "developer_instructions": developer_instructions,
        });
        let result = rpc_client
            .request(protocol::METHOD_THREAD_RESUME, Some(params), config.tool_timeout)
            .await
            .map_err(BridgeError::from)?;
        let resolved = resolve_thread_id(&result)
            .ok_or_else(|| BridgeError::ProtocolViolation("thread/resume response missing a thread id".into()))?;

        let should_compact = config.compaction.should_compact_on_resume.evaluate(&crate::config::CompactionContext {
            thread_id: resolved.clone(),
        });
        if should_compact {
            let compact_params = serde_json::json!({ "thread_id": resolved });
            let outcome = rpc_client
                .request(protocol::METHOD_THREAD_COMPACT_START, Some(compact_params), config.tool_timeout)
                .await;
            if let Err(err) = outcome {
                if config.compaction.strict {
                    return Err(BridgeError::CompactionFailed(err.to_string()));
                }
                warn!("compaction failed, continuing without it: {err}");
            }
        }
        resolved
    } else {
        let mut thread_start_params = serde_json::json!({
            "model": config.default_model,
            "developer_instructions": developer_instructions,
            "cwd": config.thread_defaults.cwd,
            "approval_policy": config.thread_defaults.approval_policy,
            "sandbox": config.thread_defaults.sandbox,
        });
        if dynamic_tools_present {
            thread_start_params["dynamic_tools"] = serde_json::to_value(merged_tools.schemas()).unwrap_or(Value::Null);
        }
        let result = rpc_client
            .request(protocol::METHOD_THREAD_START, Some(thread_start_params), config.tool_timeout)
            .await
            .map_err(BridgeError::from)?;
        resolve_thread_id(&result)
            .ok_or_else(|| BridgeError::ProtocolViolation("thread/start response missing a thread id".into()))?
    };

    mapper.lock().await.set_thread_id(thread_id.clone());

    let turn_input = prompt::map_turn_input(prompt, resume_thread_id.is_some(), file_resolver).await;
    let turn_params = serde_json::json!({
        "thread_id": thread_id,
        "input": turn_input,
        "cwd": config.turn_defaults.cwd,
        "approval_policy": config.turn_defaults.approval_policy,
        "sandbox_policy": config.turn_defaults.sandbox_policy,
        "model": config.turn_defaults.model,
        "effort": config.turn_defaults.effort,
        "summary": config.turn_defaults.summary,
    });
    let turn_result = rpc_client
        .request(protocol::METHOD_TURN_START, Some(turn_params), config.tool_timeout)
        .await
        .map_err(BridgeError::from)?;
    let turn_id = resolve_turn_id(&turn_result)
        .ok_or_else(|| BridgeError::ProtocolViolation("turn/start response missing a turn id".into()))?;
    mapper.lock().await.set_turn_id(turn_id.clone());

    drive_notifications(event_rx, mapper, tx, turn_done, abort).await;

    if abort.is_aborted() {
        let params = serde_json::json!({ "thread_id": thread_id, "turn_id": turn_id });
        let _ = tokio::time::timeout(
            config.interrupt_timeout,
            rpc_client.request(protocol::METHOD_TURN_INTERRUPT, Some(params), config.interrupt_timeout),
        )
        .await;
        return Err(BridgeError::Aborted);
    }

    Ok(())
}

/// Cross-call continuation: a prior call on this worker left a tool call
/// parked. This call supplies its result instead of opening a new turn; the
/// worker's session-level `thread/resume` still runs so the peer's notion of
/// the active thread for this connection stays current.
#[allow(clippy::too_many_arguments)]
async fn run_continuation(
    config: &BridgeConfig,
    lease: &Lease,
    worker: &Worker,
    parked: ParkedCall,
    prompt: &Prompt,
    mapper: &Arc<AsyncMutex<EventMapper>>,
    tx: &mpsc::UnboundedSender<GenerationPart>,
    event_rx: &mut mpsc::UnboundedReceiver<(String, Option<Value>)>,
    turn_done: &Arc<Notify>,
    abort: &AbortSignal,
) -> Result<()> {
    let rpc_client = lease.rpc_client();
    if let Some(thread_id) = parked.thread_id.clone() {
        mapper.lock().await.set_thread_id(thread_id.clone());
        let params = serde_json::json!({
            "thread_id": thread_id,
            "persist_extended_history": false,
            "developer_instructions": prompt::developer_instructions(prompt),
        });
        rpc_client
            .request(protocol::METHOD_THREAD_RESUME, Some(params), config.tool_timeout)
            .await
            .map_err(BridgeError::from)?;
    }

    let result = match prompt::find_tool_result_text(prompt, &parked.call_id) {
        Some(text) => tools::success_result(Value::String(text)),
        None => tools::failure_result(format!("no tool result supplied for call `{}`", parked.call_id)),
    };

    if let Some(responder) = worker.take_parked_responder().await {
        let _ = responder.send(result);
    }
    worker.take_parked_call().await;

    drive_notifications(event_rx, mapper, tx, turn_done, abort).await;

    if abort.is_aborted() {
        return Err(BridgeError::Aborted);
    }
    Ok(())
}
