//! PostgreSQL reconciliation repository

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::error::{ReconciliationError, ReconciliationResult};
use super::model::{CheckRecord, ReconciliationException, ReconciliationReport, Severity};
use super::repository::ReconciliationRepository;

const REPORT_COLUMNS: &str = "id, run_type, status, total_checks, passed_checks, failed_checks, \
     exceptions_count, error_message, started_at, completed_at";

const CHECK_COLUMNS: &str = "id, report_id, position, check_type, expected, actual, difference, \
     tolerance, currency, passed, error_message, findings, execution_time_ms, created_at";

const EXCEPTION_COLUMNS: &str = "id, report_id, check_id, check_type, severity, description, \
     expected, actual, difference, currency, auto_corrected, correction_action, resolved_at, \
     resolved_by, resolution_notes, created_at";

#[derive(Debug, Clone)]
pub struct PgReconciliationRepository {
    pool: PgPool,
}

impl PgReconciliationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconciliationRepository for PgReconciliationRepository {
    async fn create_report(&self, report: &ReconciliationReport) -> ReconciliationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_reports (
                id, run_type, status, total_checks, passed_checks, failed_checks,
                exceptions_count, error_message, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(report.id)
        .bind(report.run_type.as_str())
        .bind(report.status.as_str())
        .bind(report.total_checks)
        .bind(report.passed_checks)
        .bind(report.failed_checks)
        .bind(report.exceptions_count)
        .bind(&report.error_message)
        .bind(report.started_at)
        .bind(report.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_report(&self, report: &ReconciliationReport) -> ReconciliationResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE reconciliation_reports
            SET status = $2,
                total_checks = $3,
                passed_checks = $4,
                failed_checks = $5,
                exceptions_count = $6,
                error_message = $7,
                completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(report.id)
        .bind(report.status.as_str())
        .bind(report.total_checks)
        .bind(report.passed_checks)
        .bind(report.failed_checks)
        .bind(report.exceptions_count)
        .bind(&report.error_message)
        .bind(report.completed_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(ReconciliationError::ReportNotFound(report.id));
        }
        Ok(())
    }

    async fn get_report(&self, report_id: Uuid) -> ReconciliationResult<Option<ReconciliationReport>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM reconciliation_reports WHERE id = $1",
            REPORT_COLUMNS
        ))
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(report_from_row).transpose()
    }

    async fn list_reports(&self, limit: i64) -> ReconciliationResult<Vec<ReconciliationReport>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reconciliation_reports ORDER BY started_at DESC LIMIT $1",
            REPORT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(report_from_row).collect()
    }

    async fn save_check(&self, check: &CheckRecord) -> ReconciliationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_checks (
                id, report_id, position, check_type, expected, actual, difference,
                tolerance, currency, passed, error_message, findings, execution_time_ms, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(check.id)
        .bind(check.report_id)
        .bind(check.position)
        .bind(check.check_type.as_str())
        .bind(check.expected)
        .bind(check.actual)
        .bind(check.difference)
        .bind(check.tolerance)
        .bind(&check.currency)
        .bind(check.passed)
        .bind(&check.error_message)
        .bind(serde_json::to_value(&check.findings)?)
        .bind(check.execution_time_ms)
        .bind(check.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_report_checks(&self, report_id: Uuid) -> ReconciliationResult<Vec<CheckRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reconciliation_checks WHERE report_id = $1 ORDER BY position",
            CHECK_COLUMNS
        ))
        .bind(report_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(check_from_row).collect()
    }

    async fn save_exception(&self, exception: &ReconciliationException) -> ReconciliationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_exceptions (
                id, report_id, check_id, check_type, severity, description,
                expected, actual, difference, currency, auto_corrected, correction_action,
                resolved_at, resolved_by, resolution_notes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(exception.id)
        .bind(exception.report_id)
        .bind(exception.check_id)
        .bind(exception.check_type.as_str())
        .bind(exception.severity.as_str())
        .bind(&exception.description)
        .bind(exception.expected)
        .bind(exception.actual)
        .bind(exception.difference)
        .bind(&exception.currency)
        .bind(exception.auto_corrected)
        .bind(&exception.correction_action)
        .bind(exception.resolved_at)
        .bind(&exception.resolved_by)
        .bind(&exception.resolution_notes)
        .bind(exception.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_exception(&self, exception_id: Uuid) -> ReconciliationResult<Option<ReconciliationException>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM reconciliation_exceptions WHERE id = $1",
            EXCEPTION_COLUMNS
        ))
        .bind(exception_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(exception_from_row).transpose()
    }

    async fn get_report_exceptions(&self, report_id: Uuid) -> ReconciliationResult<Vec<ReconciliationException>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reconciliation_exceptions WHERE report_id = $1 ORDER BY created_at, id",
            EXCEPTION_COLUMNS
        ))
        .bind(report_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(exception_from_row).collect()
    }

    async fn get_unresolved_exceptions(
        &self,
        severity: Option<Severity>,
    ) -> ReconciliationResult<Vec<ReconciliationException>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reconciliation_exceptions \
             WHERE resolved_at IS NULL AND ($1::text IS NULL OR severity = $1) \
             ORDER BY created_at, id",
            EXCEPTION_COLUMNS
        ))
        .bind(severity.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(exception_from_row).collect()
    }

    async fn resolve_exception(
        &self,
        exception_id: Uuid,
        resolved_by: &str,
        notes: &str,
    ) -> ReconciliationResult<ReconciliationException> {
        let row = sqlx::query(&format!(
            "UPDATE reconciliation_exceptions \
             SET resolved_at = NOW(), resolved_by = $2, resolution_notes = $3 \
             WHERE id = $1 AND resolved_at IS NULL \
             RETURNING {}",
            EXCEPTION_COLUMNS
        ))
        .bind(exception_id)
        .bind(resolved_by)
        .bind(notes)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => exception_from_row(&row),
            None => match self.get_exception(exception_id).await? {
                Some(_) => Err(ReconciliationError::AlreadyResolved(exception_id)),
                None => Err(ReconciliationError::ExceptionNotFound(exception_id)),
            },
        }
    }
}

// =========================================================================
// Row mapping
// =========================================================================

fn report_from_row(row: &PgRow) -> ReconciliationResult<ReconciliationReport> {
    let run_type: String = row.try_get("run_type")?;
    let status: String = row.try_get("status")?;

    Ok(ReconciliationReport {
        id: row.try_get("id")?,
        run_type: run_type.parse()?,
        status: status.parse()?,
        total_checks: row.try_get("total_checks")?,
        passed_checks: row.try_get("passed_checks")?,
        failed_checks: row.try_get("failed_checks")?,
        exceptions_count: row.try_get("exceptions_count")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn check_from_row(row: &PgRow) -> ReconciliationResult<CheckRecord> {
    let check_type: String = row.try_get("check_type")?;
    let findings: serde_json::Value = row.try_get("findings")?;

    Ok(CheckRecord {
        id: row.try_get("id")?,
        report_id: row.try_get("report_id")?,
        position: row.try_get("position")?,
        check_type: check_type.parse()?,
        expected: row.try_get("expected")?,
        actual: row.try_get("actual")?,
        difference: row.try_get("difference")?,
        tolerance: row.try_get("tolerance")?,
        currency: row.try_get("currency")?,
        passed: row.try_get("passed")?,
        error_message: row.try_get("error_message")?,
        findings: serde_json::from_value(findings)?,
        execution_time_ms: row.try_get("execution_time_ms")?,
        created_at: row.try_get("created_at")?,
    })
}

fn exception_from_row(row: &PgRow) -> ReconciliationResult<ReconciliationException> {
    let check_type: String = row.try_get("check_type")?;
    let severity: String = row.try_get("severity")?;

    Ok(ReconciliationException {
        id: row.try_get("id")?,
        report_id: row.try_get("report_id")?,
        check_id: row.try_get("check_id")?,
        check_type: check_type.parse()?,
        severity: severity.parse()?,
        description: row.try_get("description")?,
        expected: row.try_get("expected")?,
        actual: row.try_get("actual")?,
        difference: row.try_get("difference")?,
        currency: row.try_get("currency")?,
        auto_corrected: row.try_get("auto_corrected")?,
        correction_action: row.try_get("correction_action")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
        resolution_notes: row.try_get("resolution_notes")?,
        created_at: row.try_get("created_at")?,
    })
}
