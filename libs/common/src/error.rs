//! Custom error types for the common library
//!
//! This module defines application-specific error types that can be used
//! throughout the pipeline.

use sqlx::Error as SqlxError;
use thiserror::Error;

/// Custom error type for database operations
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error occurred during database connection
    #[error("Database connection error: {0}")]
    Connection(#[source] SqlxError),

    /// Error occurred during database query execution
    #[error("Database query error: {0}")]
    Query(#[source] SqlxError),

    /// Configuration error
    #[error("Database configuration error: {0}")]
    Configuration(String),
}

/// Type alias for Result with DatabaseError
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Errors raised by the object storage service
#[derive(Error, Debug)]
pub enum StorageError {
    /// The storage service refused to sign an upload (quota, auth, ...)
    #[error("Failed to sign upload: {0}")]
    Signing(String),

    /// Writing an object failed
    #[error("Failed to upload object: {0}")]
    Upload(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while inspecting media with the metadata prober
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to run prober: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Prober exited with {0}")]
    Failed(String),

    #[error("Unreadable prober output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Media has no readable duration")]
    MissingDuration,
}
