//! Error types for the storage layer.

use thiserror::Error;

use crate::error::{ErrorCode, ErrorKind};
use crate::model::ParseEnumError;

/// Unique index on `wallet_transactions.idempotency_key`.
pub const LEDGER_IDEMPOTENCY_KEY: &str = "wallet_transactions.idempotency_key";
/// Unique index on `wallets.customer_id`.
pub const WALLET_CUSTOMER: &str = "wallets.customer_id";
/// Unique index on `orders.order_no`.
pub const ORDER_NO: &str = "orders.order_no";
/// Unique index on `orders(customer_id, idempotency_key)`.
pub const ORDER_CUSTOMER_IDEMPOTENCY_KEY: &str = "orders.customer_id, orders.idempotency_key";
/// A unique index this crate does not know by name.
pub const UNKNOWN_INDEX: &str = "unknown";

const KNOWN_INDEXES: [&str; 4] = [
    LEDGER_IDEMPOTENCY_KEY,
    WALLET_CUSTOMER,
    ORDER_NO,
    ORDER_CUSTOMER_IDEMPOTENCY_KEY,
];

// SQLITE_BUSY and SQLITE_LOCKED primary result codes.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint {0} violated")]
    UniqueViolation(&'static str),

    #[error("timed out waiting for the database")]
    LockTimeout,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("no transaction in context")]
    NoTransaction,

    #[error("row {0} not found")]
    RowNotFound(String),

    #[error("savepoint {0} not found")]
    SavepointNotFound(String),

    #[error("corrupt row: {0}")]
    Decode(#[from] ParseEnumError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_unique_violation(&self, constraint: &str) -> bool {
        matches!(self, StoreError::UniqueViolation(c) if *c == constraint)
    }
}

/// Name the unique index from SQLite's `UNIQUE constraint failed: <cols>` message.
fn unique_index(message: &str) -> &'static str {
    let columns = message.rsplit(": ").next().unwrap_or_default();
    KNOWN_INDEXES
        .into_iter()
        .find(|index| *index == columns)
        .unwrap_or(UNKNOWN_INDEX)
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut => StoreError::LockTimeout,
            sqlx::Error::RowNotFound => StoreError::RowNotFound("query returned no rows".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::UniqueViolation(unique_index(db.message()))
            }
            sqlx::Error::Database(db) => {
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<i64>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(SQLITE_BUSY | SQLITE_LOCKED) => StoreError::LockTimeout,
                    _ => StoreError::Database(e),
                }
            }
            _ => StoreError::Database(e),
        }
    }
}

impl ErrorCode for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::LockTimeout | StoreError::DeadlineExceeded => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            StoreError::LockTimeout => "lock_timeout",
            StoreError::DeadlineExceeded => "timeout",
            _ => "internal",
        }
    }
}
