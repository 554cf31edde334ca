//! Error types for the market recorder

use std::path::PathBuf;
use thiserror::Error;

/// Market recorder errors
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to open {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Sequence gap: book at {last_update_id}, delta covers [{first_update_id}, {final_update_id}]")]
    SequenceGap {
        last_update_id: u64,
        first_update_id: u64,
        final_update_id: u64,
    },

    #[error("Snapshot fetch failed after {attempts} attempts")]
    SnapshotRetriesExhausted { attempts: u32 },

    #[error("Order book desynchronized after {resyncs} resyncs")]
    ResyncLimitExceeded { resyncs: u32 },

    #[error("Queue {queue} overflowed at capacity {capacity}")]
    QueueOverflow { queue: String, capacity: usize },

    #[error("Queue closed")]
    QueueClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Gave up reconnecting after {attempts} attempts")]
    MaxReconnectAttemptsExceeded { attempts: u32 },

    #[error("Pipeline {0} failed")]
    PipelineFailed(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RecorderError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RecorderError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for RecorderError {
    fn from(err: serde_json::Error) -> Self {
        RecorderError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for RecorderError {
    fn from(err: reqwest::Error) -> Self {
        RecorderError::RestApiError(err.to_string())
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        RecorderError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for RecorderError {
    fn from(err: config::ConfigError) -> Self {
        RecorderError::ConfigError(err.to_string())
    }
}

impl From<prometheus::Error> for RecorderError {
    fn from(err: prometheus::Error) -> Self {
        RecorderError::ConfigError(format!("metrics registration: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
