use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transport is not connected")]
    NotConnected,
    #[error("peer is unavailable: {0}")]
    Unavailable(String),
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer returned error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer disconnected with the request still pending")]
    Disconnected,
    #[error("response channel closed unexpectedly")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool has been shut down")]
    Shutdown,
    #[error("pool is exhausted and waiting for a free worker is disabled")]
    Exhausted,
    #[error("a global pool named `{key}` already exists with incompatible settings")]
    IncompatibleSettings { key: String },
    #[error("waiter was cancelled before a worker became available")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("generation aborted")]
    Aborted,
    #[error("handler failed: {0}")]
    HandlerFailure(String),
    #[error("compaction failed: {0}")]
    CompactionFailed(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
