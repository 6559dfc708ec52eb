// src/error.rs
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Result type for wallet operations
pub type Result<T> = std::result::Result<T, WalletError>;

#[derive(Error, Debug)]
pub enum WalletError {
    /// Rejected before any unit of work opens
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    /// Another request holding the same idempotency key is still in flight
    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),

    /// Same key reused for a different user, path or body
    #[error("Idempotency key mismatch: {0}")]
    IdempotencyKeyMismatch(String),

    /// Internal invariant violation, e.g. a balance row missing after `ensure`
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Unit of work timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WalletError {
    /// Stable machine-readable code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            Self::IdempotencyKeyMismatch(_) => "IDEMPOTENCY_KEY_MISMATCH",
            Self::NotFound(_) => "NOT_FOUND",
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "INTERNAL_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// HTTP-style status the request layer should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::IdempotencyConflict(_) => 409,
            Self::InsufficientBalance { .. } | Self::IdempotencyKeyMismatch(_) => 422,
            Self::LockTimeout(_) | Self::Timeout(_) | Self::Storage(_) => 503,
            Self::NotFound(_) | Self::Serialization(_) | Self::Config(_) => 500,
        }
    }

    /// Whether the whole operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IdempotencyConflict(_) | Self::LockTimeout(_) | Self::Timeout(_) | Self::Storage(_)
        )
    }

    /// Domain outcomes are answered with a structured response; everything
    /// else is an opaque failure.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InsufficientBalance { .. }
                | Self::IdempotencyConflict(_)
                | Self::IdempotencyKeyMismatch(_)
        )
    }

    pub fn to_response_body(&self) -> serde_json::Value {
        let message = if self.is_domain() {
            self.to_string()
        } else {
            // Driver details stay in the logs.
            "internal error".to_string()
        };
        serde_json::json!({
            "code": self.code(),
            "message": message,
        })
    }
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for WalletError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                // lock_not_available, query_canceled (statement_timeout)
                Some("55P03") | Some("57014") => return Self::LockTimeout(db.message().to_string()),
                // SQLITE_BUSY, SQLITE_LOCKED
                Some("5") | Some("6") => return Self::LockTimeout(db.message().to_string()),
                _ => {}
            }
        }
        if let sqlx::Error::PoolTimedOut = err {
            return Self::LockTimeout("connection pool exhausted".to_string());
        }
        Self::Storage(err.to_string())
    }
}
