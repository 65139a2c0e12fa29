//! Reconciliation errors

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ErrorKind, Interruption, LedgerError};

use super::model::RunType;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("A {0} reconciliation run is already in progress")]
    RunInProgress(RunType),

    #[error("Report not found: {0}")]
    ReportNotFound(Uuid),

    #[error("Exception not found: {0}")]
    ExceptionNotFound(Uuid),

    #[error("Exception {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Operation interrupted: {0}")]
    Interrupted(#[from] Interruption),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted reconciliation data: {0}")]
    Corrupted(String),
}

impl ReconciliationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RunInProgress(_) | Self::AlreadyResolved(_) => ErrorKind::Conflict,
            Self::ReportNotFound(_) | Self::ExceptionNotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Provider(_) => ErrorKind::ExternalService,
            Self::Interrupted(_) | Self::Database(_) => ErrorKind::Transient,
            Self::Ledger(e) => e.kind(),
            Self::Serialization(_) | Self::Corrupted(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type ReconciliationResult<T> = Result<T, ReconciliationError>;
