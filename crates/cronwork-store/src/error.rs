// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cronwork-store.
//!
//! Every store failure is transient from the caller's point of view: the
//! archive/clean state machine counts it against the table's retry ceiling
//! and the log drain leaves the source file in place.

use thiserror::Error;

/// Result type using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by [`Store`](crate::Store) implementations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A statement failed inside the database.
    #[error("Database error during '{operation}' on '{table}': {details}")]
    Query {
        /// The operation that failed (select, insert, delete).
        operation: &'static str,
        /// The table the statement targeted.
        table: String,
        /// Error details.
        details: String,
    },

    /// A table or column name cannot be used as an SQL identifier.
    #[error("Invalid identifier '{name}'")]
    InvalidIdentifier {
        /// The rejected identifier.
        name: String,
    },

    /// The table does not exist in this store.
    #[error("Table '{table}' not found")]
    UnknownTable {
        /// The missing table.
        table: String,
    },

    /// A column value could not be decoded into a row value.
    #[error("Failed to decode column '{column}': {details}")]
    Decode {
        /// The column being decoded.
        column: String,
        /// Error details.
        details: String,
    },

    /// The store refused the operation (scripted failure, closed pool).
    #[error("Store unavailable for '{operation}' on '{table}'")]
    Unavailable {
        /// The operation that was refused.
        operation: &'static str,
        /// The table the operation targeted.
        table: String,
    },

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migrate(String),
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Query { .. } => "DATABASE_ERROR",
            Self::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
            Self::UnknownTable { .. } => "UNKNOWN_TABLE",
            Self::Decode { .. } => "DECODE_ERROR",
            Self::Unavailable { .. } => "STORE_UNAVAILABLE",
            Self::Migrate(_) => "MIGRATION_ERROR",
        }
    }

    pub(crate) fn query(operation: &'static str, table: &str, err: sqlx::Error) -> Self {
        Self::Query {
            operation,
            table: table.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migrate(err.to_string())
    }
}
