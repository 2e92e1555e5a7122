//! Error types for the parallelizer

use thiserror::Error;

/// Result type alias using the parallelizer Error
pub type Result<T> = std::result::Result<T, Error>;

/// Parallelizer error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Message for unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Outbox for {0} is full")]
    Saturated(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Collection of {worker} differs from master")]
    CollectionDivergence { worker: String, diff: String },

    #[error("Worker {worker} exited with status {code}")]
    WorkerCrash { worker: String, code: i32 },

    #[error("Failed to spawn worker {worker}: {reason}")]
    Spawn { worker: String, reason: String },

    #[error("Test runner error: {0}")]
    Runner(String),

    #[error("Invalid report: {0}")]
    ReportDeserialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Session aborted: {0}")]
    SessionAborted(String),

    #[error("Instructed to die by master")]
    Died,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error ends the whole session rather than one worker
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SessionAborted(_))
    }
}
