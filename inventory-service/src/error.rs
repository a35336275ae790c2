//! Error taxonomy for the stock ledger.
//!
//! Validation and business-rule errors are final: retrying the same call
//! cannot succeed. `Transaction` covers everything the storage layer can fail
//! with (pool exhaustion, lock waits, commit failures) and is surfaced as-is;
//! callers decide whether to retry. Cache failures have their own type in
//! [`crate::cache`] and never reach this enum.

use std::fmt::Display;

use thiserror::Error;
use uuid::Uuid;

pub type InventoryResult<T> = Result<T, InventoryError>;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: String,
        requested: i32,
        available: i32,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("reservation already exists for order {order_id} and product {product_id}")]
    DuplicateReservation { order_id: String, product_id: String },

    #[error("reservation {reservation_id} cannot move from {from} to {to}")]
    InvalidTransition {
        reservation_id: Uuid,
        from: String,
        to: String,
    },

    #[error("compensation failed for order {order_id}: {message}")]
    CompensationFailed { order_id: String, message: String },

    #[error("{context}: {message}")]
    Transaction { context: String, message: String },
}

impl InventoryError {
    pub fn transaction(context: impl Into<String>, err: impl Display) -> Self {
        InventoryError::Transaction {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Wraps a storage failure with the operation it happened in. Business
    /// errors pass through untouched.
    pub fn context(self, context: &str) -> Self {
        match self {
            InventoryError::Transaction {
                context: inner,
                message,
            } => InventoryError::Transaction {
                context: format!("{context}: {inner}"),
                message,
            },
            other => other,
        }
    }

    /// Whether redelivering the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InventoryError::Transaction { .. } | InventoryError::CompensationFailed { .. }
        )
    }
}

impl From<diesel::result::Error> for InventoryError {
    fn from(err: diesel::result::Error) -> Self {
        InventoryError::transaction("database", err)
    }
}
