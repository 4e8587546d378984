//! Error types for kiosk-store.

use std::path::PathBuf;

/// Result type for kiosk-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kiosk-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Account not found in database.
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// A stored value could not be decoded.
    #[error("Invalid stored value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    /// The database was written by a newer version of this crate.
    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
