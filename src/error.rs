//! Error types for bedrock
//!
//! A single error type shared by the lock manager, the commit coordinator and the
//! paged store. Lock failures and storage invariant violations are surfaced to the
//! caller; participant failures are normally absorbed by the coordinator's retry loop.

use std::fmt;
use std::io;

/// Unified error type for bedrock operations
#[derive(Debug)]
pub enum BedrockError {
    /// I/O error (data files, index, manifest, commit log)
    Io(io::Error),
    /// A lock wait exceeded the deadlock timeout with no conversion attempted
    DeadlockDetected(String),
    /// A read-to-write conversion could not complete before the deadlock timeout
    ResourceLocked(String),
    /// Storage lookup miss
    RecordNotFound(String),
    /// Key already present (committed or pending) in the table
    DuplicateKey(String),
    /// No free row could be placed, or a row image does not fit the row size
    OutOfSpace(String),
    /// A participant answered Prepare/Commit/Abort with an error
    Participant(String),
    /// Bad magic, wrong geometry or undecodable bytes on disk
    Corrupt(String),
    /// Table-related error (not found, already exists, bad name)
    Table(String),
    /// Transaction state error (unknown transaction, conflicting pending change)
    Transaction(String),
    /// Serialization error (manifest, record encoding)
    Encoding(String),
    /// Generic internal error
    Internal(String),
}

impl BedrockError {
    pub fn table_not_found(table: &str) -> Self {
        BedrockError::Table(format!("Table '{}' doesn't exist", table))
    }

    pub fn table_already_exists(table: &str) -> Self {
        BedrockError::Table(format!("Table '{}' already exists", table))
    }

    pub fn record_not_found(table: &str, key: &str) -> Self {
        BedrockError::RecordNotFound(format!("Record '{}' not found in '{}'", key, table))
    }

    pub fn duplicate_key(table: &str, key: &str) -> Self {
        BedrockError::DuplicateKey(format!("Duplicate entry '{}' in '{}'", key, table))
    }

    pub fn corrupt(what: impl Into<String>) -> Self {
        BedrockError::Corrupt(what.into())
    }

    /// True for the two lock-wait failures; callers normally abort the transaction.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            BedrockError::DeadlockDetected(_) | BedrockError::ResourceLocked(_)
        )
    }
}

impl fmt::Display for BedrockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BedrockError::Io(e) => write!(f, "I/O error: {}", e),
            BedrockError::DeadlockDetected(msg) => write!(f, "Deadlock detected: {}", msg),
            BedrockError::ResourceLocked(msg) => write!(f, "Resource locked: {}", msg),
            BedrockError::RecordNotFound(msg) => write!(f, "{}", msg),
            BedrockError::DuplicateKey(msg) => write!(f, "{}", msg),
            BedrockError::OutOfSpace(msg) => write!(f, "Out of space: {}", msg),
            BedrockError::Participant(msg) => write!(f, "Participant error: {}", msg),
            BedrockError::Corrupt(msg) => write!(f, "Corrupt data: {}", msg),
            BedrockError::Table(msg) => write!(f, "{}", msg),
            BedrockError::Transaction(msg) => write!(f, "{}", msg),
            BedrockError::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            BedrockError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for BedrockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BedrockError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BedrockError {
    fn from(e: io::Error) -> Self {
        BedrockError::Io(e)
    }
}

impl From<serde_json::Error> for BedrockError {
    fn from(e: serde_json::Error) -> Self {
        BedrockError::Encoding(e.to_string())
    }
}

impl From<bincode::Error> for BedrockError {
    fn from(e: bincode::Error) -> Self {
        BedrockError::Encoding(e.to_string())
    }
}

impl From<tempfile::PersistError> for BedrockError {
    fn from(e: tempfile::PersistError) -> Self {
        BedrockError::Io(e.error)
    }
}

/// Result type alias for bedrock operations
pub type Result<T> = std::result::Result<T, BedrockError>;
