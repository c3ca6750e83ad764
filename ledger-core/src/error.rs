//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE for `unique_violation`
pub(crate) const PG_UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE for `foreign_key_violation`
pub(crate) const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

/// SQLSTATE for `lock_not_available` (raised when `lock_timeout` expires)
pub(crate) const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE for `numeric_value_out_of_range` (bigint balance overflow)
pub(crate) const PG_NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Referenced row does not exist
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Table / entity name
        entity: &'static str,
        /// Lookup key that missed
        key: String,
    },

    /// Unique constraint violated
    #[error("Unique constraint violated: {constraint}")]
    Conflict {
        /// Name of the violated constraint (e.g. `users_username_key`)
        constraint: String,
    },

    /// Foreign key constraint violated
    #[error("Foreign key constraint violated: {constraint}")]
    ForeignKeyViolation {
        /// Name of the violated constraint
        constraint: String,
    },

    /// Row lock could not be acquired in time; the transaction was aborted
    #[error("Lock wait timed out on account {account_id}")]
    LockTimeout {
        /// Account whose row lock was contended
        account_id: i64,
    },

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Unit of work ran past its deadline
    #[error("Deadline exceeded after {after_ms}ms")]
    DeadlineExceeded {
        /// Configured deadline
        after_ms: u64,
    },

    /// Transfer parameters rejected before touching the store
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    /// Debit would leave the account below zero
    #[error("Insufficient funds in account {account_id}: balance {balance}, debit {amount}")]
    InsufficientFunds {
        /// Debited account
        account_id: i64,
        /// Balance before the debit
        balance: i64,
        /// Requested debit
        amount: i64,
    },

    /// Balance arithmetic overflowed i64
    #[error("Balance overflow on account {account_id}")]
    BalanceOverflow {
        /// Account being updated
        account_id: i64,
    },

    /// Account currency differs from the requested one
    #[error("Account {account_id} currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch {
        /// Account checked
        account_id: i64,
        /// Currency of the account
        expected: String,
        /// Currency of the request
        actual: String,
    },

    /// User-facing duplicate (mapped from [`Error::Conflict`] by the service layer)
    #[error("{0}")]
    AlreadyExists(String),

    /// After-create hook rejected the new row
    #[error("After-create hook failed: {0}")]
    AfterCreate(#[source] anyhow::Error),

    /// Database error passed through from sqlx
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::NotFound`]
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Error::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// True for unique-constraint violations
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Constraint name carried by conflict / foreign key errors
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Error::Conflict { constraint } | Error::ForeignKeyViolation { constraint } => {
                Some(constraint)
            }
            _ => None,
        }
    }

    /// Errors a caller may reasonably retry (lock contention, pool/connection trouble)
    pub fn is_transient(&self) -> bool {
        match self {
            Error::LockTimeout { .. } => true,
            Error::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
                // serialization_failure / deadlock_detected
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_carries_constraint() {
        let err = Error::Conflict {
            constraint: "users_username_key".to_string(),
        };
        assert!(err.is_conflict());
        assert_eq!(err.constraint(), Some("users_username_key"));
        assert!(err.to_string().contains("users_username_key"));
    }

    #[test]
    fn test_not_found_is_not_conflict() {
        let err = Error::not_found("account", 42);
        assert!(!err.is_conflict());
        assert_eq!(err.constraint(), None);
        assert_eq!(err.to_string(), "account not found: 42");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::LockTimeout { account_id: 1 }.is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
