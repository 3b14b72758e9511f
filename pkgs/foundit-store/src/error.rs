//! Error types for store operations

use sea_orm::DbErr;
use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Row already exists: {0}")]
    Conflict(String),
    #[error("Row not found: {0}")]
    NotFound(String),
    #[error("Invalid row: {0}")]
    InvalidRow(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Map an insert error onto `Conflict` when it is a unique/primary key violation
    pub(crate) fn from_insert(err: DbErr, what: impl Into<String>) -> Self {
        let unique = matches!(
            err.sql_err(),
            Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
        ) || err.to_string().contains("UNIQUE constraint failed");

        if unique {
            StoreError::Conflict(what.into())
        } else {
            StoreError::Database(err)
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
