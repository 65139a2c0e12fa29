//! Domain Error Types
//!
//! Typed ledger errors. Callers branch on [`ErrorKind`] instead of inspecting
//! messages.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::amount::{AmountError, Currency};
use super::context::Interruption;

/// Error taxonomy shared by the ledger and the reconciliation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unbalanced request; never retryable
    Validation,
    /// Unknown account, transaction, report or exception
    NotFound,
    /// State transition not allowed (double reversal, double resolution, overlapping run)
    Conflict,
    /// Business rule: source balance too low
    InsufficientFunds,
    /// Storage hiccup, timeout or cancellation; the caller may retry
    Transient,
    /// An external provider call failed
    ExternalService,
    /// Bug or corrupted data
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::ExternalService)
    }
}

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid transaction: {0}")]
    Validation(String),

    #[error("Unbalanced entries in {currency}: debits {debits}, credits {credits}")]
    Unbalanced {
        currency: Currency,
        debits: Decimal,
        credits: Decimal,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("Transaction {0} is already reversed")]
    AlreadyReversed(Uuid),

    #[error("Insufficient funds in account {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: Uuid,
        required: Decimal,
        available: Decimal,
    },

    #[error("Legacy balance mirror failed: {0}")]
    ShadowMirror(String),

    #[error("Legacy balance discrepancy for user {user_id}: {details}")]
    ShadowDiscrepancy { user_id: Uuid, details: String },

    #[error("Operation interrupted: {0}")]
    Interrupted(#[from] Interruption),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted ledger data: {0}")]
    Corrupted(String),
}

impl LedgerError {
    pub fn insufficient_funds(account_id: Uuid, required: Decimal, available: Decimal) -> Self {
        Self::InsufficientFunds {
            account_id,
            required,
            available,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Unbalanced { .. } | Self::InvalidAmount(_) => {
                ErrorKind::Validation
            }
            Self::AccountNotFound(_) | Self::TransactionNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyReversed(_) | Self::ShadowDiscrepancy { .. } => ErrorKind::Conflict,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::Interrupted(_) | Self::Database(_) | Self::ShadowMirror(_) => ErrorKind::Transient,
            Self::Serialization(_) | Self::Corrupted(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
