//! Operation Context
//!
//! Carries tracing metadata plus the cancellation token and deadline that
//! bound every ledger and reconciliation operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why an operation stopped before completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interruption {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Context for an operation, used for tracing and cancellation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Correlation ID for request tracing
    pub correlation_id: Uuid,

    /// Service or operator that initiated the operation
    pub initiated_by: Option<String>,

    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OperationContext {
    /// Create a new context with a fresh correlation ID and no deadline
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            initiated_by: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_initiator(mut self, initiated_by: impl Into<String>) -> Self {
        self.initiated_by = Some(initiated_by.into());
        self
    }

    /// Bound the operation to complete within `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Derive a context whose cancellation follows this one but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id,
            initiated_by: self.initiated_by.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first. The future is dropped on interruption.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Interruption>,
    {
        if self.cancel.is_cancelled() {
            return Err(Interruption::Cancelled.into());
        }

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interruption::Cancelled.into()),
            _ = deadline => Err(Interruption::DeadlineExceeded.into()),
            result = fut => result,
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}
