//! Reconciliation Service
//!
//! Runs the registered checks, records one check row per execution, and turns
//! every failed check into an exception. A check that errors or times out is
//! recorded as failed; it never aborts the run. Only a storage failure while
//! persisting the run marks the report `failed`.

use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use chrono::Utc;
use tokio_util::task::TaskTracker;

use crate::domain::OperationContext;
use crate::metrics::MetricsRecorder;

use super::alert::{AlertSink, ReconciliationAlert};
use super::check::{CheckOutcome, ReconciliationCheck};
use super::error::{ReconciliationError, ReconciliationResult};
use super::model::{
    CheckRecord, ReconciliationException, ReconciliationReport, ReportStatus, RunType, Severity,
};
use super::repository::ReconciliationRepository;

/// Currency recorded for checks that produced no outcome
const NO_CURRENCY: &str = "n/a";

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Upper bound for a single check execution
    pub check_timeout: Duration,
    /// Flag Low exceptions as auto-corrected
    pub auto_correct_low: bool,
    pub enable_alerting: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(30),
            auto_correct_low: true,
            enable_alerting: true,
        }
    }
}

/// Result of executing one check, before persistence
struct CheckExecution {
    position: i32,
    check: Arc<dyn ReconciliationCheck>,
    result: ReconciliationResult<CheckOutcome>,
    elapsed: Duration,
}

/// Releases the single-flight slot of a run type on drop
struct RunGuard {
    in_flight: Arc<Mutex<HashSet<RunType>>>,
    run_type: RunType,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.run_type);
    }
}

pub struct ReconciliationService {
    repository: Arc<dyn ReconciliationRepository>,
    checks: Vec<Arc<dyn ReconciliationCheck>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    metrics: Arc<dyn MetricsRecorder>,
    config: ReconciliationConfig,
    in_flight: Arc<Mutex<HashSet<RunType>>>,
    /// Alert deliveries detached from the runs that raised them
    alert_tasks: TaskTracker,
}

impl ReconciliationService {
    pub fn new(
        repository: Arc<dyn ReconciliationRepository>,
        checks: Vec<Arc<dyn ReconciliationCheck>>,
        metrics: Arc<dyn MetricsRecorder>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            repository,
            checks,
            alert_sink: None,
            metrics,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            alert_tasks: TaskTracker::new(),
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// Whether a run of this type is currently executing
    pub fn is_running(&self, run_type: RunType) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.contains(&run_type)
    }

    fn acquire(&self, run_type: RunType) -> ReconciliationResult<RunGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(run_type) {
            return Err(ReconciliationError::RunInProgress(run_type));
        }
        Ok(RunGuard {
            in_flight: Arc::clone(&self.in_flight),
            run_type,
        })
    }

    /// Execute every registered check and persist the outcome.
    ///
    /// Returns the finalized report, whose status is `completed` or `failed`.
    /// Errors only when a run of the same type is already in flight or the
    /// report itself cannot be created.
    pub async fn run_reconciliation(
        &self,
        ctx: &OperationContext,
        run_type: RunType,
    ) -> ReconciliationResult<ReconciliationReport> {
        let _guard = self.acquire(run_type)?;
        let started = Instant::now();

        let mut report = ReconciliationReport::new(run_type);
        self.repository.create_report(&report).await?;
        self.metrics.run_started(run_type.as_str());

        tracing::info!(
            report_id = %report.id,
            run_type = %run_type,
            checks = self.checks.len(),
            correlation_id = %ctx.correlation_id,
            "Reconciliation run started"
        );

        let outcome = self.execute_run(ctx, &mut report).await;

        match outcome {
            Ok(()) => {
                report.transition(ReportStatus::Completed)?;
                if let Err(e) = self.repository.update_report(&report).await {
                    tracing::error!(report_id = %report.id, error = %e, "Failed to finalize report");
                    report.fail(format!("failed to finalize report: {}", e));
                }
            }
            Err(e) => {
                tracing::error!(report_id = %report.id, error = %e, "Reconciliation run failed");
                report.fail(e.to_string());
                if let Err(update_err) = self.repository.update_report(&report).await {
                    tracing::error!(
                        report_id = %report.id,
                        error = %update_err,
                        "Failed to record report failure"
                    );
                }
            }
        }

        let elapsed = started.elapsed();
        self.metrics
            .run_finished(run_type.as_str(), report.status.as_str(), elapsed);

        tracing::info!(
            report_id = %report.id,
            run_type = %run_type,
            status = %report.status,
            total_checks = report.total_checks,
            passed_checks = report.passed_checks,
            failed_checks = report.failed_checks,
            exceptions = report.exceptions_count,
            duration_ms = elapsed.as_millis() as u64,
            "Reconciliation run finished"
        );

        Ok(report)
    }

    async fn execute_run(
        &self,
        ctx: &OperationContext,
        report: &mut ReconciliationReport,
    ) -> ReconciliationResult<()> {
        report.transition(ReportStatus::InProgress)?;
        self.repository.update_report(report).await?;

        let executions = join_all(
            self.checks
                .iter()
                .enumerate()
                .map(|(position, check)| self.execute_check(ctx, position as i32, Arc::clone(check))),
        )
        .await;

        for execution in executions {
            let exceptions = self.persist_execution(report, execution).await?;
            self.repository.update_report(report).await?;
            self.dispatch_alerts(&exceptions);
        }

        Ok(())
    }

    async fn execute_check(
        &self,
        ctx: &OperationContext,
        position: i32,
        check: Arc<dyn ReconciliationCheck>,
    ) -> CheckExecution {
        let mut check_ctx = ctx.child().with_timeout(self.config.check_timeout);
        if let (Some(run_deadline), Some(check_deadline)) = (ctx.deadline(), check_ctx.deadline()) {
            check_ctx = check_ctx.with_deadline(run_deadline.min(check_deadline));
        }
        let started = Instant::now();
        let result = check_ctx.run(check.execute(&check_ctx)).await;
        let elapsed = started.elapsed();

        if let Err(e) = &result {
            tracing::warn!(
                check_type = %check.check_type(),
                error = %e,
                duration_ms = elapsed.as_millis() as u64,
                "Reconciliation check errored"
            );
        }

        CheckExecution {
            position,
            check,
            result,
            elapsed,
        }
    }

    /// Persist the check row and its exception, if any, and count them on the
    /// report.
    async fn persist_execution(
        &self,
        report: &mut ReconciliationReport,
        execution: CheckExecution,
    ) -> ReconciliationResult<Vec<ReconciliationException>> {
        let CheckExecution {
            position,
            check,
            result,
            elapsed,
        } = execution;
        let check_type = check.check_type();
        let tolerance = check.tolerance();

        let record = match &result {
            Ok(outcome) => CheckRecord {
                id: Uuid::new_v4(),
                report_id: report.id,
                position,
                check_type,
                expected: outcome.expected,
                actual: outcome.actual,
                difference: outcome.difference(),
                tolerance,
                currency: outcome.currency.clone(),
                passed: outcome.passes(tolerance),
                error_message: None,
                findings: outcome.findings.clone(),
                execution_time_ms: elapsed.as_millis() as i64,
                created_at: Utc::now(),
            },
            Err(e) => CheckRecord {
                id: Uuid::new_v4(),
                report_id: report.id,
                position,
                check_type,
                expected: Decimal::ZERO,
                actual: Decimal::ZERO,
                difference: Decimal::ZERO,
                tolerance,
                currency: NO_CURRENCY.to_string(),
                passed: false,
                error_message: Some(e.to_string()),
                findings: Vec::new(),
                execution_time_ms: elapsed.as_millis() as i64,
                created_at: Utc::now(),
            },
        };

        self.repository.save_check(&record).await?;
        self.metrics
            .check_executed(check_type.as_str(), record.passed, elapsed);
        self.metrics
            .discrepancy(check_type.as_str(), &record.currency, record.difference);

        let mut exceptions = Vec::new();
        if !record.passed {
            let severity = Severity::for_discrepancy(record.difference, check.min_severity());
            let mut exception =
                ReconciliationException::from_check(&record, severity, describe(&record));

            if severity == Severity::Low && self.config.auto_correct_low {
                exception.flag_auto_corrected(format!(
                    "difference of {} {} within auto-correction threshold, flagged for review",
                    record.difference, record.currency
                ));
                self.metrics.auto_corrected(check_type.as_str());
                tracing::info!(
                    report_id = %report.id,
                    check_type = %check_type,
                    difference = %record.difference,
                    "Low severity exception auto-corrected"
                );
            }

            self.repository.save_exception(&exception).await?;

            tracing::warn!(
                report_id = %report.id,
                exception_id = %exception.id,
                check_type = %check_type,
                severity = %severity,
                expected = %record.expected,
                actual = %record.actual,
                difference = %record.difference,
                currency = %record.currency,
                "Reconciliation exception recorded"
            );
            exceptions.push(exception);
        } else {
            tracing::debug!(
                report_id = %report.id,
                check_type = %check_type,
                difference = %record.difference,
                "Reconciliation check passed"
            );
        }

        report.record_check(record.passed, exceptions.len() as i32);
        Ok(exceptions)
    }

    /// Hand qualifying exceptions to the alert sink without waiting for
    /// delivery.
    fn dispatch_alerts(&self, exceptions: &[ReconciliationException]) {
        if !self.config.enable_alerting {
            return;
        }
        let Some(sink) = &self.alert_sink else {
            return;
        };

        for exception in exceptions.iter().filter(|e| e.severity.requires_alert()) {
            let alert = ReconciliationAlert::from(exception);
            let sink = Arc::clone(sink);
            let metrics = Arc::clone(&self.metrics);

            self.alert_tasks.spawn(async move {
                let delivered = match sink.send(&alert).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(
                            exception_id = %alert.exception_id,
                            severity = %alert.severity,
                            error = %e,
                            "Failed to dispatch reconciliation alert"
                        );
                        false
                    }
                };
                metrics.alert_dispatched(alert.severity.as_str(), delivered);
            });
        }
    }

    /// Wait until every alert dispatched so far has been delivered or failed
    pub async fn flush_alerts(&self) {
        self.alert_tasks.close();
        self.alert_tasks.wait().await;
        self.alert_tasks.reopen();
    }

    pub async fn get_report(&self, report_id: Uuid) -> ReconciliationResult<ReconciliationReport> {
        self.repository
            .get_report(report_id)
            .await?
            .ok_or(ReconciliationError::ReportNotFound(report_id))
    }

    pub async fn get_report_checks(&self, report_id: Uuid) -> ReconciliationResult<Vec<CheckRecord>> {
        self.get_report(report_id).await?;
        self.repository.get_report_checks(report_id).await
    }

    pub async fn get_report_exceptions(
        &self,
        report_id: Uuid,
    ) -> ReconciliationResult<Vec<ReconciliationException>> {
        self.get_report(report_id).await?;
        self.repository.get_report_exceptions(report_id).await
    }

    pub async fn list_reports(&self, limit: i64) -> ReconciliationResult<Vec<ReconciliationReport>> {
        if limit <= 0 {
            return Err(ReconciliationError::Validation(
                "limit must be positive".to_string(),
            ));
        }
        self.repository.list_reports(limit).await
    }

    pub async fn get_unresolved_exceptions(
        &self,
        severity: Option<Severity>,
    ) -> ReconciliationResult<Vec<ReconciliationException>> {
        self.repository.get_unresolved_exceptions(severity).await
    }

    pub async fn resolve_exception(
        &self,
        exception_id: Uuid,
        resolved_by: &str,
        notes: &str,
    ) -> ReconciliationResult<ReconciliationException> {
        if resolved_by.trim().is_empty() {
            return Err(ReconciliationError::Validation(
                "resolved_by is required".to_string(),
            ));
        }

        let exception = self
            .repository
            .resolve_exception(exception_id, resolved_by, notes)
            .await?;

        tracing::info!(
            exception_id = %exception_id,
            resolved_by = %resolved_by,
            "Reconciliation exception resolved"
        );
        Ok(exception)
    }
}

fn describe(record: &CheckRecord) -> String {
    if let Some(error) = &record.error_message {
        return format!("{} check could not complete: {}", record.check_type, error);
    }

    let mut description = format!(
        "{} mismatch: expected {} {}, actual {}, difference {} (tolerance {})",
        record.check_type,
        record.expected,
        record.currency,
        record.actual,
        record.difference,
        record.tolerance
    );
    if !record.findings.is_empty() {
        description.push_str("; ");
        description.push_str(&record.findings.join("; "));
    }
    description
}
