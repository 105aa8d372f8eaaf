//! Error taxonomies for storage and delivery
//!
//! Engine-native errors never escape the store: everything coming out of
//! `rusqlite`, `tokio_rusqlite` or `serde_json` is translated into
//! [`StoreError`] here.

use rusqlite::ffi;
use thiserror::Error;

/// Storage error type.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("foreign key violation")]
    ForeignKeyViolation,

    #[error("check constraint violated")]
    CheckConstraintViolated,

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("missing record key")]
    MissingKey,

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("database busy")]
    Busy,

    #[error("database connection closed")]
    ConnectionClosed,

    /// Engine error with no closer translation
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Stable short label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound => "not_found",
            StoreError::DuplicateKey => "duplicate_key",
            StoreError::ForeignKeyViolation => "foreign_key_violation",
            StoreError::CheckConstraintViolated => "check_constraint_violated",
            StoreError::InvalidTransaction(_) => "invalid_transaction",
            StoreError::MissingKey => "missing_key",
            StoreError::InvalidValue(_) => "invalid_value",
            StoreError::InvalidData(_) => "invalid_data",
            StoreError::Busy => "busy",
            StoreError::ConnectionClosed => "connection_closed",
            StoreError::Sqlite(_) => "sqlite",
            StoreError::Io(_) => "io",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            rusqlite::Error::SqliteFailure(failure, message) => {
                translate_failure(failure, message)
            }
            rusqlite::Error::ToSqlConversionFailure(e) => StoreError::InvalidValue(e.to_string()),
            rusqlite::Error::FromSqlConversionFailure(column, _, e) => {
                StoreError::InvalidData(format!("column {column}: {e}"))
            }
            rusqlite::Error::InvalidColumnType(column, name, ty) => {
                StoreError::InvalidData(format!("column {column} ({name}) has type {ty}"))
            }
            rusqlite::Error::IntegralValueOutOfRange(column, value) => {
                StoreError::InvalidData(format!("column {column}: {value} out of range"))
            }
            other => StoreError::Sqlite(other),
        }
    }
}

fn translate_failure(failure: ffi::Error, message: Option<String>) -> StoreError {
    match failure.code {
        ffi::ErrorCode::ConstraintViolation => match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                StoreError::DuplicateKey
            }
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => StoreError::ForeignKeyViolation,
            ffi::SQLITE_CONSTRAINT_CHECK => StoreError::CheckConstraintViolated,
            ffi::SQLITE_CONSTRAINT_NOTNULL => {
                StoreError::InvalidValue(message.unwrap_or_else(|| "NOT NULL".to_string()))
            }
            _ => StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, message)),
        },
        ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked => StoreError::Busy,
        _ => match message {
            Some(msg) if msg.contains("transaction") => StoreError::InvalidTransaction(msg),
            message => StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, message)),
        },
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::Rusqlite(e) => StoreError::from(e),
            tokio_rusqlite::Error::Close((_, e)) => StoreError::from(e),
            tokio_rusqlite::Error::ConnectionClosed => StoreError::ConnectionClosed,
            other => StoreError::InvalidTransaction(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::InvalidData(e.to_string())
    }
}

/// Delivery error type.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("no API key available")]
    MissingApiKey,

    #[error("failed to encode write request: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("failed to compress write request: {0}")]
    Compress(#[from] snap::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("remote endpoint returned status {0}")]
    Status(u16),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<PushError> },

    #[error("delivery cancelled")]
    Cancelled,
}

impl PushError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PushError::Request(_) | PushError::Timeout | PushError::Status(_)
        )
    }
}
