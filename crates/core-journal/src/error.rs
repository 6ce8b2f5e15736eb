//! Error types for delivery log operations

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for delivery log operations
pub type Result<T> = std::result::Result<T, JournalError>;

/// Errors that can occur while reading or writing the delivery log
#[derive(Error, Debug)]
pub enum JournalError {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line in a log file could not be decoded
    #[error("Malformed line {line} in {path}: {reason}")]
    MalformedLine {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    /// Connection has never been registered with the log
    #[error("Connection not registered with the delivery log: {0}")]
    UnknownConnection(String),

    /// Two connections would write to the same log file
    #[error("Connection {connection} would share log file {path} with {existing}")]
    LogPathCollision {
        connection: String,
        existing: String,
        path: PathBuf,
    },

    /// Replay pointer would move past the end of the log
    #[error("Pointer {offset} for {connection} is beyond the {entries} logged entries")]
    PointerOutOfRange {
        connection: String,
        offset: u64,
        entries: u64,
    },
}
