//! Reusable sidecar sessions that survive across generation calls, cache
//! the initialize handshake, park in-flight tool calls across calls, and
//! idle-expire. Unnamed, ref-counted, FIFO-waiter pooling with idle-timeout
//! teardown, plus a keyed registry layer for pools shared process-wide.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use crate::error::PoolError;
use crate::protocol::RequestId;
use crate::rpc::RpcClient;
use crate::transport::Transport;

/// An inbound tool-call request deliberately left unanswered at end-of-turn
/// so a subsequent generation call can supply the result.
#[derive(Clone, Debug)]
pub struct ParkedCall {
    pub request_id: RequestId,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub thread_id: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Disconnected,
    Idle,
    Busy,
}

struct WorkerInner {
    transport: Arc<dyn Transport>,
    rpc: Mutex<Option<RpcClient>>,
    state: Mutex<WorkerState>,
    initialized: AtomicBool,
    cached_initialize_result: Mutex<Option<Value>>,
    parked_call: Mutex<Option<ParkedCall>>,
    parked_responder: Mutex<Option<oneshot::Sender<crate::rpc::HandlerResult>>>,
    idle_timeout: Duration,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    teardown: Notify,
}

/// One reusable sidecar session. Wraps a single [`Transport`]; the RPC
/// client living on top of it is rebuilt on every (re)connect so that
/// session-scoped handlers never leak across a disconnect.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(transport: Arc<dyn Transport>, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                transport,
                rpc: Mutex::new(None),
                state: Mutex::new(WorkerState::Disconnected),
                initialized: AtomicBool::new(false),
                cached_initialize_result: Mutex::new(None),
                parked_call: Mutex::new(None),
                parked_responder: Mutex::new(None),
                idle_timeout,
                idle_timer: Mutex::new(None),
                teardown: Notify::new(),
            }),
        }
    }

    pub async fn state(&self) -> WorkerState {
        *self.inner.state.lock().await
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub async fn rpc_client(&self) -> RpcClient {
        let mut guard = self.inner.rpc.lock().await;
        if guard.is_none() {
            *guard = Some(RpcClient::new(self.inner.transport.clone()).await);
        }
        guard.as_ref().unwrap().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub async fn cached_initialize_result(&self) -> Option<Value> {
        self.inner.cached_initialize_result.lock().await.clone()
    }

    pub async fn mark_initialized(&self, result: Value) {
        self.inner.initialized.store(true, Ordering::SeqCst);
        *self.inner.cached_initialize_result.lock().await = Some(result);
    }

    pub async fn park_tool_call(&self, parked: ParkedCall) {
        *self.inner.parked_call.lock().await = Some(parked);
    }

    pub async fn take_parked_call(&self) -> Option<ParkedCall> {
        self.inner.parked_call.lock().await.take()
    }

    pub async fn peek_parked_call(&self) -> Option<ParkedCall> {
        self.inner.parked_call.lock().await.clone()
    }

    /// Stashes the responder for the currently parked call; a later
    /// generation call on the same worker takes it and resolves the inbound
    /// request's still-pending future with the supplied result.
    pub async fn set_parked_responder(&self, responder: oneshot::Sender<crate::rpc::HandlerResult>) {
        *self.inner.parked_responder.lock().await = Some(responder);
    }

    pub async fn take_parked_responder(&self) -> Option<oneshot::Sender<crate::rpc::HandlerResult>> {
        self.inner.parked_responder.lock().await.take()
    }

    /// Cancels any pending idle timer and transitions to `busy`.
    pub async fn acquire(&self) {
        if let Some(handle) = self.inner.idle_timer.lock().await.take() {
            handle.abort();
        }
        *self.inner.state.lock().await = WorkerState::Busy;
    }

    /// Clears session-scoped listeners, returns to `idle`, and arms the idle
    /// timer (0 disables it).
    pub async fn release(&self) {
        if let Some(client) = self.inner.rpc.lock().await.as_ref() {
            client.clear_handlers().await;
        }
        *self.inner.state.lock().await = WorkerState::Idle;

        if let Some(handle) = self.inner.idle_timer.lock().await.take() {
            handle.abort();
        }

        if self.inner.idle_timeout.is_zero() {
            return;
        }

        let inner = self.inner.clone();
        let timeout = self.inner.idle_timeout;
        let handle = tokio::spawn(async move {
            time::sleep(timeout).await;
            debug!("worker idle timeout expired, tearing down");
            teardown(&inner).await;
        });
        *self.inner.idle_timer.lock().await = Some(handle);
    }

    /// Clears timers, detaches listeners, disconnects the transport.
    pub async fn shutdown(&self) {
        teardown(&self.inner).await;
    }

    pub fn on_teardown(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.inner.teardown.notified()
    }
}

async fn teardown(inner: &Arc<WorkerInner>) {
    if let Some(handle) = inner.idle_timer.lock().await.take() {
        handle.abort();
    }
    inner.transport.disconnect().await;
    inner.initialized.store(false, Ordering::SeqCst);
    *inner.cached_initialize_result.lock().await = None;
    *inner.parked_call.lock().await = None;
    inner.parked_responder.lock().await.take();
    *inner.state.lock().await = WorkerState::Disconnected;
    inner.rpc.lock().await.take();
    inner.teardown.notify_waiters();
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Worker>,
}

struct PoolInner {
    idle: Mutex<VecDeque<Worker>>,
    waiters: Mutex<VecDeque<Waiter>>,
    next_waiter_id: AtomicU64,
    size: usize,
    outstanding: Mutex<usize>,
    shutdown: AtomicBool,
}

/// FIFO-fair pool of reusable [`Worker`]s. `acquire`d workers are never
/// handed to two callers; releasing hands the worker straight to the head
/// of the waiter queue when one exists.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(workers: Vec<Worker>) -> Self {
        let size = workers.len();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(workers.into()),
                waiters: Mutex::new(VecDeque::new()),
                next_waiter_id: AtomicU64::new(0),
                size,
                outstanding: Mutex::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Returns an available worker, enqueuing the caller FIFO-style if none
    /// are free. A `cancel` future lets the caller abandon the wait.
    pub async fn acquire(
        &self,
        cancel: impl std::future::Future<Output = ()> + Send,
    ) -> std::result::Result<Worker, PoolError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }

        {
            let mut idle = self.inner.idle.lock().await;
            if let Some(worker) = idle.pop_front() {
                worker.acquire().await;
                *self.inner.outstanding.lock().await += 1;
                return Ok(worker);
            }
        }

        let id = self.inner.next_waiter_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().await.push_back(Waiter { id, tx });

        tokio::select! {
            worker = rx => worker.map_err(|_| PoolError::Cancelled),
            _ = cancel => {
                self.inner.waiters.lock().await.retain(|waiter| waiter.id != id);
                Err(PoolError::Cancelled)
            }
        }
    }

    /// Hands the worker to the head of the waiter queue, or releases it to
    /// idle if no one is waiting.
    pub async fn release(&self, worker: Worker) {
        {
            let mut outstanding = self.inner.outstanding.lock().await;
            *outstanding = outstanding.saturating_sub(1);
        }

        let mut waiters = self.inner.waiters.lock().await;
        while let Some(waiter) = waiters.pop_front() {
            worker.acquire().await;
            if waiter.tx.send(worker.clone()).is_ok() {
                *self.inner.outstanding.lock().await += 1;
                return;
            }
        }
        drop(waiters);

        worker.release().await;
        self.inner.idle.lock().await.push_back(worker);
    }

    /// Rejects all waiters with `PoolShutdown` and tears down idle workers.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for waiter in self.inner.waiters.lock().await.drain(..) {
            drop(waiter.tx);
        }
        for worker in self.inner.idle.lock().await.drain(..) {
            worker.shutdown().await;
        }
    }
}

/// Pooling scope requested by a caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PersistentScope {
    Provider,
    Global,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct GlobalPoolSettings {
    pool_size: usize,
    idle_timeout: Duration,
}

struct GlobalPoolEntry {
    pool: WorkerPool,
    settings: GlobalPoolSettings,
    ref_count: usize,
}

/// Process-wide keyed registry of pools, confined behind this type so the
/// global mutable state it wraps can be stubbed out in tests.
#[derive(Clone, Default)]
pub struct GlobalPoolRegistry {
    entries: Arc<Mutex<HashMap<String, GlobalPoolEntry>>>,
}

/// A handle into the global registry; dropping it (via [`Self::release`])
/// decrements the ref count and tears the pool down on last release.
pub struct GlobalPoolHandle {
    registry: GlobalPoolRegistry,
    key: String,
    pool: WorkerPool,
}

impl GlobalPoolHandle {
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn release(self) {
        let mut entries = self.registry.entries.lock().await;
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                let entry = entries.remove(&self.key).unwrap();
                drop(entries);
                entry.pool.shutdown().await;
            }
        }
    }
}

impl GlobalPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires (creating if absent) a reference-counted entry keyed by
    /// `key`. Reuse across calls with identical `(pool_size, idle_timeout)`
    /// is permitted; mismatch is `IncompatiblePoolSettings`.
    pub async fn acquire(
        &self,
        key: &str,
        build: impl FnOnce() -> WorkerPool,
        pool_size: usize,
        idle_timeout: Duration,
    ) -> std::result::Result<GlobalPoolHandle, PoolError> {
        let mut entries = self.entries.lock().await;
        let settings = GlobalPoolSettings {
            pool_size,
            idle_timeout,
        };

        match entries.get_mut(key) {
            Some(entry) => {
                if entry.settings != settings {
                    return Err(PoolError::IncompatibleSettings {
                        key: key.to_string(),
                    });
                }
                entry.ref_count += 1;
                Ok(GlobalPoolHandle {
                    registry: self.clone(),
                    key: key.to_string(),
                    pool: entry.pool.clone(),
                })
            }
            None => {
                let pool = build();
                entries.insert(
                    key.to_string(),
                    GlobalPoolEntry {
                        pool: pool.clone(),
                        settings,
                        ref_count: 1,
                    },
                );
                Ok(GlobalPoolHandle {
                    registry: self.clone(),
                    key: key.to_string(),
                    pool,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Listeners, Transport};
    use async_trait::async_trait;

    struct FakeTransport {
        listeners: Listeners,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn send_message(&self, _message: &crate::protocol::Message) -> crate::error::Result<()> {
            Ok(())
        }
        fn listeners(&self) -> &Listeners {
            &self.listeners
        }
    }

    fn fake_worker() -> Worker {
        Worker::new(
            Arc::new(FakeTransport {
                listeners: Listeners::default(),
            }),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn acquire_never_double_hands_a_worker() {
        let pool = WorkerPool::new(vec![fake_worker()]);
        let w1 = pool.acquire(std::future::pending()).await.unwrap();
        assert_eq!(w1.state().await, WorkerState::Busy);

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(std::future::pending()).await });
        tokio::task::yield_now().await;

        pool.release(w1).await;
        let w2 = waiter.await.unwrap().unwrap();
        assert_eq!(w2.state().await, WorkerState::Busy);
    }

    #[tokio::test]
    async fn cancel_removes_waiter() {
        let pool = WorkerPool::new(vec![]);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let cancel = async move {
            let _ = cancel_rx.await;
        };
        let fut = pool.acquire(cancel);
        tokio::pin!(fut);
        // poll once to register the waiter, then cancel
        tokio::select! {
            _ = &mut fut => panic!("should not resolve yet"),
            _ = tokio::task::yield_now() => {}
        }
        let _ = cancel_tx.send(());
        let result = fut.await;
        assert!(matches!(result, Err(PoolError::Cancelled)));
        assert!(pool.inner.waiters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn global_registry_rejects_incompatible_settings() {
        let registry = GlobalPoolRegistry::new();
        let handle1 = registry
            .acquire(
                "shared",
                || WorkerPool::new(vec![fake_worker()]),
                1,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let mismatch = registry
            .acquire(
                "shared",
                || WorkerPool::new(vec![fake_worker()]),
                2,
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(
            mismatch,
            Err(PoolError::IncompatibleSettings { .. })
        ));

        handle1.release().await;
    }
}
