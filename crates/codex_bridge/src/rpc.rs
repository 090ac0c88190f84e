//! JSON-RPC 2.0 multiplexer. Correlates outbound requests with inbound
//! responses, fans out notifications, and dispatches inbound requests to
//! caller-registered handlers, since the sidecar calls back into this
//! client for approvals and tool calls.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time;
use tracing::{debug, warn};

use crate::error::{BridgeError, RpcError};
use crate::protocol::{
    Message, RequestId, RequestIdGenerator, RpcErrorObject, ERROR_INTERNAL, ERROR_METHOD_NOT_FOUND,
};
use crate::transport::{Transport, TransportEvent};

/// Result type returned by an inbound-request handler.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

#[derive(Debug, Clone)]
pub struct HandlerError(pub String);

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for HandlerError {}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RequestHandler = Arc<dyn Fn(RequestId, Option<Value>) -> BoxFuture<HandlerResult> + Send + Sync>;
type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

struct Inner {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<std::result::Result<Value, RpcError>>>>,
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
    notification_handlers: Mutex<HashMap<String, Vec<NotificationHandler>>>,
    any_notification_handlers: Mutex<Vec<NotificationHandler>>,
    id_gen: RequestIdGenerator,
}

/// Correlates requests/responses over one [`Transport`] instance.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Builds a client over an already-constructed transport and wires its
    /// message stream into dispatch. Does not call `connect()`.
    pub async fn new(transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(Inner {
            transport,
            pending: Mutex::new(HashMap::new()),
            request_handlers: Mutex::new(HashMap::new()),
            notification_handlers: Mutex::new(HashMap::new()),
            any_notification_handlers: Mutex::new(Vec::new()),
            id_gen: RequestIdGenerator::new(),
        });

        let dispatch_inner = inner.clone();
        inner
            .transport
            .listeners()
            .subscribe(Box::new(move |event| {
                let inner = dispatch_inner.clone();
                tokio::spawn(async move {
                    handle_transport_event(inner, event).await;
                });
            }))
            .await;

        Self { inner }
    }

    pub async fn connect(&self) -> crate::error::Result<()> {
        self.inner.transport.connect().await.map_err(Into::into)
    }

    pub async fn disconnect(&self) {
        self.inner.transport.disconnect().await;
        self.reject_all_pending(RpcError::Disconnected).await;
    }

    /// Sends a request and waits for the matching response, or fails with
    /// `Timeout`/`Disconnected`/`JsonRpcError`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> std::result::Result<Value, RpcError> {
        let id = self.inner.id_gen.next();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id.clone(), tx);

        let message = Message::Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        if let Err(err) = self.inner.transport.send_message(&message).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(err.into());
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ChannelClosed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> crate::error::Result<()> {
        self.inner
            .transport
            .send_notification(method, params)
            .await
            .map_err(Into::into)
    }

    pub async fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.inner
            .notification_handlers
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    pub async fn on_any_notification<F>(&self, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.inner
            .any_notification_handlers
            .lock()
            .await
            .push(Arc::new(handler));
    }

    /// Registers a handler for an inbound request method. If the handler
    /// future never resolves the client never sends a response; this is the
    /// deferred-response mechanic cross-call tool continuation relies on.
    pub async fn on_request<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_request_with_id(method, move |_id, params| handler(params)).await;
    }

    /// Like [`Self::on_request`] but also passes the inbound request's id, for
    /// handlers that need to correlate a parked call with the request that
    /// created it (see `crate::pool::ParkedCall`).
    pub async fn on_request_with_id<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(RequestId, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: RequestHandler = Arc::new(move |id, params| Box::pin(handler(id, params)));
        self.inner
            .request_handlers
            .lock()
            .await
            .insert(method.to_string(), boxed);
    }

    /// Clears all session-scoped handlers/listeners. Used by the Worker on
    /// `release()` so a reused transport doesn't leak a prior call's
    /// handlers into the next one.
    pub async fn clear_handlers(&self) {
        self.inner.request_handlers.lock().await.clear();
        self.inner.notification_handlers.lock().await.clear();
        self.inner.any_notification_handlers.lock().await.clear();
    }

    async fn reject_all_pending(&self, error: RpcError) {
        let mut guard = self.inner.pending.lock().await;
        for (_, tx) in guard.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

impl Clone for RpcError {
    fn clone(&self) -> Self {
        match self {
            RpcError::Transport(t) => RpcError::Transport(crate::error::TransportError::Unavailable(t.to_string())),
            RpcError::Rpc { code, message, data } => RpcError::Rpc {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            RpcError::Timeout(d) => RpcError::Timeout(*d),
            RpcError::Disconnected => RpcError::Disconnected,
            RpcError::ChannelClosed => RpcError::ChannelClosed,
        }
    }
}

async fn handle_transport_event(inner: Arc<Inner>, event: TransportEvent) {
    match event {
        TransportEvent::Message(message) => handle_message(inner, message).await,
        TransportEvent::Error(cause) => {
            warn!("transport error: {cause}");
        }
        TransportEvent::Close { .. } => {
            let mut guard = inner.pending.lock().await;
            for (_, tx) in guard.drain() {
                let _ = tx.send(Err(RpcError::Disconnected));
            }
        }
    }
}

async fn handle_message(inner: Arc<Inner>, message: Message) {
    match message {
        Message::Success { id, result } => {
            if let Some(tx) = inner.pending.lock().await.remove(&id) {
                let _ = tx.send(Ok(result));
            }
        }
        Message::Error { id, error } => {
            if let Some(tx) = inner.pending.lock().await.remove(&id) {
                let _ = tx.send(Err(RpcError::Rpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }));
            }
        }
        Message::Notification { method, params } => {
            let specific = inner.notification_handlers.lock().await.get(&method).cloned();
            if let Some(handlers) = specific {
                for handler in handlers {
                    handler(params.clone());
                }
            }
            let any = inner.any_notification_handlers.lock().await.clone();
            for handler in any {
                handler(params.clone());
            }
        }
        Message::Request { id, method, params } => {
            respond_to_request(inner, id, method, params).await;
        }
    }
}

async fn respond_to_request(inner: Arc<Inner>, id: RequestId, method: String, params: Option<Value>) {
    let handler = inner.request_handlers.lock().await.get(&method).cloned();
    let Some(handler) = handler else {
        debug!("no handler registered for inbound method `{method}`");
        let response = Message::Error {
            id,
            error: RpcErrorObject {
                code: ERROR_METHOD_NOT_FOUND,
                message: format!("method not found: {method}"),
                data: None,
            },
        };
        let _ = inner.transport.send_message(&response).await;
        return;
    };

    let fut = handler(id.clone(), params);
    match fut.await {
        Ok(result) => {
            let response = Message::Success { id, result };
            let _ = inner.transport.send_message(&response).await;
        }
        Err(err) => {
            let response = Message::Error {
                id,
                error: RpcErrorObject {
                    code: ERROR_INTERNAL,
                    message: err.0,
                    data: None,
                },
            };
            let _ = inner.transport.send_message(&response).await;
        }
    }
}

/// Helper for deferring an inbound request's response to a later call. A
/// tool-call handler that wants to "park" the request returns
/// `std::future::pending()` from [`RpcClient::on_request`]'s future; this
/// type exists only to document the pattern (see `crate::pool::ParkedCall`).
#[async_trait]
pub trait DeferredResponder: Send + Sync {
    async fn respond(&self, result: HandlerResult);
}
