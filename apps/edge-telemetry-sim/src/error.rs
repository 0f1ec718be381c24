use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal at startup: the simulator cannot publish without a usable dataset and config.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read dataset {path}: {source}")]
    DatasetUnreadable {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("dataset row {row}: {message}")]
    InvalidRow { row: usize, message: String },
    #[error("no readings for device {device_id} (available: {available})")]
    NoReadingsForDevice { device_id: String, available: String },
    #[error("invalid {key}: {message}")]
    InvalidSetting { key: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("not connected")]
    NotConnected,
    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },
    #[error("encode payload for {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
#[error("inference failed after {elapsed:?}: {message}")]
pub struct InferenceError {
    pub elapsed: Duration,
    pub message: String,
}

impl InferenceError {
    pub fn new(elapsed: Duration, message: impl Into<String>) -> Self {
        Self {
            elapsed,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("create metrics dir {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize metrics: {0}")]
    Serialize(#[from] serde_json::Error),
}
