//! Unit-of-work contract the reconciliation engine writes through.
//!
//! One [`UnitOfWork`] spans one run: every dimension lookup, identity match,
//! insert and patch happens inside it, and nothing is visible outside until
//! [`UnitOfWork::commit`]. Rows are isolated from each other with a savepoint
//! so a failing row can be undone without losing the rows before it.

use async_trait::async_trait;
use recon_core::{Columns, DimensionKind, FactTable, FieldDiff, StoredFact, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },
    #[error("database error{}: {message}", .code.as_deref().map(|c| format!(" {c}")).unwrap_or_default())]
    Database {
        code: Option<String>,
        message: String,
    },
    #[error("store connection unavailable: {0}")]
    Connection(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("invalid store operation: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Fatal errors end the run and roll the whole unit of work back. Anything
    /// else only fails the row that triggered it.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Connection(_) => true,
            // 08xxx: connection exception, 25P02: transaction already aborted,
            // 57Pxx: operator intervention (shutdown, cancel).
            StoreError::Database { code: Some(code), .. } => {
                code.starts_with("08") || code == "25P02" || code.starts_with("57P")
            }
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            },
            sqlx::Error::Database(db) => StoreError::Database {
                code: db.code().map(|c| c.to_string()),
                message: db.message().to_string(),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// Another writer already holds the unique key.
    Conflict,
}

/// One airport/city code from the reference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirportEntry {
    pub code: String,
    pub city: Option<String>,
    pub country: String,
}

#[async_trait]
pub trait UnitOfWork: Send {
    /// Case-insensitive lookup of a dimension row by business key.
    async fn find_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<Option<i64>, StoreError>;

    /// Insert-if-absent for get-or-create dimensions. Never raises on a
    /// duplicate key; reports [`InsertOutcome::Conflict`] instead.
    async fn create_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<InsertOutcome, StoreError>;

    async fn upsert_airport(&mut self, entry: &AirportEntry) -> Result<InsertOutcome, StoreError>;

    /// First fact row (lowest id) whose columns equal every lookup value,
    /// absent matching absent.
    async fn find_fact(
        &mut self,
        table: &FactTable,
        lookup: &[(&'static str, Value)],
    ) -> Result<Option<StoredFact>, StoreError>;

    async fn insert_fact(
        &mut self,
        table: &FactTable,
        columns: &Columns,
    ) -> Result<i64, StoreError>;

    /// Writes exactly the diffed columns; every other column keeps its value.
    async fn patch_fact(
        &mut self,
        table: &FactTable,
        id: i64,
        diff: &FieldDiff,
    ) -> Result<(), StoreError>;

    async fn savepoint(&mut self) -> Result<(), StoreError>;
    async fn release_savepoint(&mut self) -> Result<(), StoreError>;
    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReconStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_fatal() {
        assert!(StoreError::Connection("reset".into()).is_fatal());
        assert!(StoreError::Database {
            code: Some("08006".into()),
            message: "connection failure".into()
        }
        .is_fatal());
        assert!(StoreError::Database {
            code: Some("25P02".into()),
            message: "current transaction is aborted".into()
        }
        .is_fatal());
    }

    #[test]
    fn constraint_and_data_errors_are_row_level() {
        assert!(!StoreError::UniqueViolation {
            constraint: "balances_reservation_id_key".into()
        }
        .is_fatal());
        assert!(!StoreError::Database {
            code: Some("22001".into()),
            message: "value too long".into()
        }
        .is_fatal());
        assert!(!StoreError::Invalid("bad column".into()).is_fatal());
    }

    #[test]
    fn database_error_message_includes_code() {
        let err = StoreError::Database {
            code: Some("23503".into()),
            message: "fk violation".into(),
        };
        assert_eq!(err.to_string(), "database error 23503: fk violation");
    }
}
