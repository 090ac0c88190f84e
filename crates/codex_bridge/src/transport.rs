//! The [`Transport`] contract: a framed, bidirectional byte channel that
//! emits decoded [`Message`]s and accepts encoded ones. Two concrete
//! variants exist: subprocess stdio (line-delimited JSON) and WebSocket
//! (text frames). Malformed frames are surfaced as `error` events and
//! skipped; they never tear down the transport.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::protocol::{decode_message, Message};

/// An event emitted by a [`Transport`] to its subscribers.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Message(Message),
    Error(String),
    Close {
        code: Option<i32>,
        signal: Option<String>,
    },
}

type Listener = Box<dyn Fn(TransportEvent) + Send + Sync>;

/// Shared subscriber registry used by every transport implementation so the
/// "session-scoped listeners" invariant (cleared on `release()`/disconnect)
/// is trivial to implement: callers hold the returned unsubscribe token and
/// drop it when a call ends.
#[derive(Clone, Default)]
pub struct Listeners {
    next_id: Arc<AtomicU64>,
    entries: Arc<Mutex<HashMap<u64, Listener>>>,
}

pub struct Unsubscribe {
    id: u64,
    entries: Arc<Mutex<HashMap<u64, Listener>>>,
}

impl Unsubscribe {
    pub fn cancel(self) {
        let entries = self.entries.clone();
        let id = self.id;
        tokio::spawn(async move {
            entries.lock().await.remove(&id);
        });
    }
}

impl Listeners {
    pub async fn subscribe(&self, handler: Listener) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.clone();
        entries.lock().await.insert(id, handler);
        Unsubscribe { id, entries }
    }

    pub async fn emit(&self, event: TransportEvent) {
        let guard = self.entries.lock().await;
        for handler in guard.values() {
            handler(event.clone());
        }
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

/// Contract shared by every byte-channel implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self);
    async fn send_message(&self, message: &Message) -> Result<()>;
    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send_message(&Message::Notification {
            method: method.to_string(),
            params,
        })
        .await
    }
    fn listeners(&self) -> &Listeners;
}

/// Spawns a subprocess and frames stdio as line-delimited JSON. No
/// notification-hook specialization lives here; that's one layer up in
/// [`crate::rpc::RpcClient`].
pub struct StdioTransport {
    command: std::sync::Mutex<Option<Command>>,
    command_debug: String,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    child: Arc<Mutex<Option<Child>>>,
    listeners: Listeners,
    shutdown_grace: Duration,
}

/// Parameters needed to spawn the sidecar subprocess.
pub struct StdioTransportConfig {
    pub program: std::path::PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<std::path::PathBuf>,
    pub shutdown_grace: Duration,
}

impl StdioTransport {
    pub fn new(config: StdioTransportConfig) -> Self {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }
        let command_debug = format!("{command:?}");

        Self {
            command: std::sync::Mutex::new(Some(command)),
            command_debug,
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            child: Arc::new(Mutex::new(None)),
            listeners: Listeners::default(),
            shutdown_grace: config.shutdown_grace,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        let mut command = self
            .command
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Unavailable("transport already connected".into()))?;

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            command: self.command_debug.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Unavailable("child stdout unavailable".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Unavailable("child stdin unavailable".into()))?;
        let stderr = child.stderr.take();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_handle = tokio::spawn(writer_task(stdin, writer_rx));
        let reader_handle = tokio::spawn(reader_task(stdout, self.listeners.clone()));
        let stderr_handle = stderr.map(|stderr| tokio::spawn(stderr_task(stderr, self.listeners.clone())));

        let mut tasks = vec![writer_handle, reader_handle];
        if let Some(handle) = stderr_handle {
            tasks.push(handle);
        }

        *self.writer.lock().await = Some(writer_tx);
        *self.tasks.lock().await = tasks;
        *self.child.lock().await = Some(child);

        Ok(())
    }

    async fn disconnect(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.writer.lock().await.take();

        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            let _ = child.start_kill();
            let _ = time::timeout(self.shutdown_grace, child.wait()).await;
        }
    }

    async fn send_message(&self, message: &Message) -> Result<()> {
        let line = serde_json::to_string(&message.to_value())?;
        let guard = self.writer.lock().await;
        let writer = guard.as_ref().ok_or(TransportError::NotConnected)?;
        writer
            .send(line)
            .map_err(|_| TransportError::NotConnected)?;
        Ok(())
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn reader_task(stdout: ChildStdout, listeners: Listeners) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                dispatch_line(&line, &listeners).await;
            }
            Ok(None) => break,
            Err(err) => {
                listeners
                    .emit(TransportEvent::Error(err.to_string()))
                    .await;
                break;
            }
        }
    }
    listeners
        .emit(TransportEvent::Close {
            code: None,
            signal: None,
        })
        .await;
}

async fn stderr_task(stderr: ChildStderr, listeners: Listeners) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("sidecar stderr: {line}");
        listeners.emit(TransportEvent::Error(line)).await;
    }
}

async fn dispatch_line(line: &str, listeners: &Listeners) {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            warn!("malformed frame from sidecar: {err}");
            listeners
                .emit(TransportEvent::Error(format!("malformed frame: {err}")))
                .await;
            return;
        }
    };

    match decode_message(value) {
        Some(message) => listeners.emit(TransportEvent::Message(message)).await,
        None => {
            warn!("frame did not look like JSON-RPC: {line}");
            listeners
                .emit(TransportEvent::Error("frame was not JSON-RPC".into()))
                .await;
        }
    }
}

/// Native text-frame WebSocket transport, for app servers exposed over a
/// socket instead of a spawned subprocess.
pub struct WebSocketTransport {
    url: String,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listeners: Listeners,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            listeners: Listeners::default(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<()> {
        let (stream, _response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|err| TransportError::Unavailable(err.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        let writer_handle = tokio::spawn(async move {
            while let Some(text) = writer_rx.recv().await {
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let listeners = self.listeners.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => dispatch_line(&text, &listeners).await,
                    Ok(WsMessage::Close(frame)) => {
                        listeners
                            .emit(TransportEvent::Close {
                                code: frame.as_ref().map(|f| u16::from(f.code) as i32),
                                signal: None,
                            })
                            .await;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        listeners
                            .emit(TransportEvent::Error(err.to_string()))
                            .await;
                        break;
                    }
                }
            }
        });

        *self.writer.lock().await = Some(writer_tx);
        *self.tasks.lock().await = vec![writer_handle, reader_handle];
        Ok(())
    }

    async fn disconnect(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.writer.lock().await.take();
    }

    async fn send_message(&self, message: &Message) -> Result<()> {
        let line = serde_json::to_string(&message.to_value())?;
        let guard = self.writer.lock().await;
        let writer = guard.as_ref().ok_or(TransportError::NotConnected)?;
        writer
            .send(line)
            .map_err(|_| TransportError::NotConnected)?;
        Ok(())
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_receives_emitted_events() {
        let listeners = Listeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _unsub = listeners
            .subscribe(Box::new(move |event| {
                let seen = seen_clone.clone();
                tokio::spawn(async move {
                    seen.lock().await.push(format!("{event:?}"));
                });
            }))
            .await;
        listeners
            .emit(TransportEvent::Error("boom".into()))
            .await;
        tokio::task::yield_now().await;
        assert!(!seen.lock().await.is_empty());
    }
}
