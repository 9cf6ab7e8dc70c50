//! Core error types for calsync-core.
//!
//! This module defines the error hierarchy shared by the storage layer,
//! configuration, and the local side of the sync engine. Remote-side
//! failures live in [`crate::sync::SyncError`] and are wrapped here.

use std::path::PathBuf;
use thiserror::Error;

use crate::sync::types::{ActionId, SyncError};

/// Core error type for calsync-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local invariant violations
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Remote calendar errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// The background sync service is no longer accepting commands
    #[error("Sync service is not running")]
    ServiceStopped,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// A persisted blob could not be serialized
    #[error("Failed to encode blob '{key}': {message}")]
    Encode { key: String, message: String },
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Local invariant violations, rejected at the queue or store boundary.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// Outbound sync requested for a remotely imported event
    #[error("Event '{entity_id}' is not locally authored and cannot be synced outbound")]
    NotRemarkable { entity_id: String },

    /// The referenced event does not exist
    #[error("Event '{entity_id}' not found")]
    EntityNotFound { entity_id: String },

    /// An event with this id already exists
    #[error("Event '{entity_id}' already exists")]
    DuplicateEntity { entity_id: String },

    /// The referenced action does not exist
    #[error("Action {action_id} not found")]
    ActionNotFound { action_id: ActionId },

    /// The action is not in the dead-letter view
    #[error("Action {action_id} is not dead-lettered")]
    NotDeadLettered { action_id: ActionId },

    /// Invalid time range
    #[error("Invalid time range: end_time ({end}) must not precede start_time ({start})")]
    InvalidTimeRange {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg) => {
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
                {
                    StorageError::Locked
                } else {
                    StorageError::QueryFailed(err.to_string())
                }
            }
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
