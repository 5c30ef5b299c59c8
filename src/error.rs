use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum InterchangeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Startup configuration problems. These are fatal: the loop is never entered.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required registration info: {0}")]
    MissingRegistration(&'static str),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse registration info: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Channel or connection dropped; retried inside the transport.
    #[error("Transient broker error: {0}")]
    Transient(String),

    /// Authentication or permission failure; never retried.
    #[error("Fatal broker error: {0}")]
    Fatal(String),

    #[error("Transport already closed")]
    Closed,
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine has not been started")]
    NotStarted,

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Task {task_id} rejected: {reason}")]
    Rejected { task_id: Uuid, reason: String },
}

/// An inbound payload that could not be decoded into the expected message.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Undecodable payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Expected a {expected} message, got {found}")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, InterchangeError>;
