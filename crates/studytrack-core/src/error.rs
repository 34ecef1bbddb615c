//! Core error types for studytrack-core.
//!
//! Callers see validation, conflict and not-found errors with the precise
//! reason; storage failures propagate as [`DatabaseError`]. Invariant repairs
//! in the reconciler are never surfaced here, they are logged instead.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for studytrack-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input shape or range
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Requested block overlaps an existing block of the same student
    #[error("Block {requested_start} - {requested_end} conflicts with existing block '{existing_id}' ({existing_start} - {existing_end})")]
    Conflict {
        existing_id: String,
        existing_start: chrono::DateTime<chrono::Utc>,
        existing_end: chrono::DateTime<chrono::Utc>,
        requested_start: chrono::DateTime<chrono::Utc>,
        requested_end: chrono::DateTime<chrono::Utc>,
    },

    /// Missing block, activity or student
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

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

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
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

    /// Stored value could not be decoded
    #[error("Corrupt value in column '{column}': {message}")]
    Corrupt { column: &'static str, message: String },

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// A thread panicked while holding the connection
    #[error("Database connection poisoned")]
    Poisoned,
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

    /// Could not determine the data directory
    #[error("Could not determine data directory: {0}")]
    DataDir(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid time range
    #[error("Invalid time range: end ({end}) must be greater than start ({start})")]
    InvalidTimeRange {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    /// Block start is not in the future
    #[error("Start ({start}) must be after the current time ({now})")]
    StartNotInFuture {
        start: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    },

    /// Activity exists but cannot be assigned
    #[error("Activity '{0}' is not assignable")]
    ActivityNotAssignable(String),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _msg) => {
                if code.code == rusqlite::ErrorCode::DatabaseLocked
                    || code.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
