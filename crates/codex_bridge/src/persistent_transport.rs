//! Presents the [`Transport`] contract over a pool-borrowed [`Worker`], whose
//! lifetime spans many generation calls even though this transport
//! instance's lifetime spans only one. Two behaviors beyond passthrough:
//! handshake caching and tool-call parking.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::pool::{ParkedCall, Worker};
use crate::protocol::{self, Message, RequestId};
use crate::transport::{Listeners, Transport, TransportEvent};

/// Wraps a pool-borrowed [`Worker`] and intercepts `initialize` handshakes so
/// repeat calls on the same worker synthesize a cached response instead of
/// round-tripping.
pub struct PersistentTransport {
    worker: Worker,
    listeners: Listeners,
    pending_initialize_id: tokio::sync::Mutex<Option<RequestId>>,
}

impl PersistentTransport {
    pub async fn new(worker: Worker) -> Arc<Self> {
        let transport = Arc::new(Self {
            worker,
            listeners: Listeners::default(),
            pending_initialize_id: tokio::sync::Mutex::new(None),
        });

        let upstream = transport.worker.transport();
        let downstream = transport.listeners.clone();
        upstream
            .listeners()
            .subscribe(Box::new(move |event| {
                let downstream = downstream.clone();
                tokio::spawn(async move {
                    downstream.emit(event).await;
                });
            }))
            .await;

        transport
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub async fn park_tool_call(&self, parked: ParkedCall) {
        self.worker.park_tool_call(parked).await;
    }

    pub async fn peek_parked_call(&self) -> Option<ParkedCall> {
        self.worker.peek_parked_call().await
    }

    pub async fn take_parked_call(&self) -> Option<ParkedCall> {
        self.worker.take_parked_call().await
    }

    /// Subscribes so that a successful `initialize` response is recorded on
    /// the [`Worker`] for future Persistent Transport instances to
    /// synthesize from. Call once right after construction, before issuing
    /// `initialize`.
    pub async fn install_initialize_cache(self: &Arc<Self>) {
        let transport = self.clone();
        let upstream = self.worker.transport();
        upstream
            .listeners()
            .subscribe(Box::new(move |event| {
                let transport = transport.clone();
                if let TransportEvent::Message(Message::Success { id, result }) = &event {
                    let id = id.clone();
                    let result = result.clone();
                    tokio::spawn(async move {
                        let expected = transport.pending_initialize_id.lock().await.clone();
                        if expected.as_ref() == Some(&id) {
                            transport.worker.mark_initialized(result).await;
                        }
                    });
                }
            }))
            .await;
    }
}

#[async_trait]
impl Transport for PersistentTransport {
    async fn connect(&self) -> Result<()> {
        if self.worker.state().await == crate::pool::WorkerState::Disconnected {
            self.worker.transport().connect().await?;
        }
        Ok(())
    }

    /// Releases the worker back to the pool without closing the underlying
    /// transport and without clearing parked state.
    async fn disconnect(&self) {
        // Intentionally not calling `self.worker.transport().disconnect()`:
        // the worker outlives this transport instance.
    }

    async fn send_message(&self, message: &Message) -> Result<()> {
        if let Message::Request { id, method, .. } = message {
            if method == protocol::METHOD_INITIALIZE {
                if let Some(cached) = self.worker.cached_initialize_result().await {
                    // Already initialized on a prior call over this worker:
                    // synthesize the response on the next microtask instead
                    // of sending any bytes.
                    let listeners = self.listeners.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        listeners
                            .emit(TransportEvent::Message(Message::Success {
                                id,
                                result: cached,
                            }))
                            .await;
                    });
                    return Ok(());
                }
                // First handshake over this worker: remember the id so
                // `install_initialize_cache`'s upstream subscriber can match
                // the real response back to this request and cache it.
                *self.pending_initialize_id.lock().await = Some(id.clone());
            }
        }

        // Suppress `initialized` when the handshake was synthesized: a
        // worker that has already completed `initialize` has also already
        // sent `initialized` on a prior call.
        if let Message::Notification { method, .. } = message {
            if method == protocol::METHOD_INITIALIZED && self.worker.is_initialized() {
                return Ok(());
            }
        }

        self.worker.transport().send_message(message).await
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

