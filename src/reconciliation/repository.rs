//! Reconciliation storage contract

use async_trait::async_trait;
use uuid::Uuid;

use super::error::ReconciliationResult;
use super::model::{CheckRecord, ReconciliationException, ReconciliationReport, Severity};

#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    async fn create_report(&self, report: &ReconciliationReport) -> ReconciliationResult<()>;

    /// Overwrite status, counts, error message and completion time
    async fn update_report(&self, report: &ReconciliationReport) -> ReconciliationResult<()>;

    async fn get_report(&self, report_id: Uuid) -> ReconciliationResult<Option<ReconciliationReport>>;

    /// Most recent first
    async fn list_reports(&self, limit: i64) -> ReconciliationResult<Vec<ReconciliationReport>>;

    async fn save_check(&self, check: &CheckRecord) -> ReconciliationResult<()>;

    /// Checks of a report in registration order
    async fn get_report_checks(&self, report_id: Uuid) -> ReconciliationResult<Vec<CheckRecord>>;

    async fn save_exception(&self, exception: &ReconciliationException) -> ReconciliationResult<()>;

    async fn get_exception(&self, exception_id: Uuid) -> ReconciliationResult<Option<ReconciliationException>>;

    async fn get_report_exceptions(&self, report_id: Uuid) -> ReconciliationResult<Vec<ReconciliationException>>;

    /// Unresolved exceptions, optionally of one severity, oldest first
    async fn get_unresolved_exceptions(
        &self,
        severity: Option<Severity>,
    ) -> ReconciliationResult<Vec<ReconciliationException>>;

    /// Resolve only if still unresolved; losing a race yields `AlreadyResolved`.
    async fn resolve_exception(
        &self,
        exception_id: Uuid,
        resolved_by: &str,
        notes: &str,
    ) -> ReconciliationResult<ReconciliationException>;
}
