//! Reconciliation records: reports, per-check results, and exceptions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::ReconciliationError;

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Hourly,
    Daily,
    Manual,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Hourly => "hourly",
            RunType::Daily => "daily",
            RunType::Manual => "manual",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(RunType::Hourly),
            "daily" => Ok(RunType::Daily),
            "manual" => Ok(RunType::Manual),
            other => Err(ReconciliationError::Corrupted(format!("unknown run type '{}'", other))),
        }
    }
}

/// Report lifecycle: `pending -> in_progress -> completed | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::InProgress => "in_progress",
            ReportStatus::Completed => "completed",
            ReportStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Completed | ReportStatus::Failed)
    }

    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        matches!(
            (self, next),
            (ReportStatus::Pending, ReportStatus::InProgress)
                | (ReportStatus::Pending, ReportStatus::Failed)
                | (ReportStatus::InProgress, ReportStatus::Completed)
                | (ReportStatus::InProgress, ReportStatus::Failed)
        )
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReportStatus::Pending),
            "in_progress" => Ok(ReportStatus::InProgress),
            "completed" => Ok(ReportStatus::Completed),
            "failed" => Ok(ReportStatus::Failed),
            other => Err(ReconciliationError::Corrupted(format!("unknown report status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    LedgerConsistency,
    CustodianBalance,
    BrokerageBalance,
    DepositTotals,
    ConversionCompleteness,
    WithdrawalTotals,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::LedgerConsistency => "ledger_consistency",
            CheckType::CustodianBalance => "custodian_balance",
            CheckType::BrokerageBalance => "brokerage_balance",
            CheckType::DepositTotals => "deposit_totals",
            CheckType::ConversionCompleteness => "conversion_completeness",
            CheckType::WithdrawalTotals => "withdrawal_totals",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ledger_consistency" => Ok(CheckType::LedgerConsistency),
            "custodian_balance" => Ok(CheckType::CustodianBalance),
            "brokerage_balance" => Ok(CheckType::BrokerageBalance),
            "deposit_totals" => Ok(CheckType::DepositTotals),
            "conversion_completeness" => Ok(CheckType::ConversionCompleteness),
            "withdrawal_totals" => Ok(CheckType::WithdrawalTotals),
            other => Err(ReconciliationError::Corrupted(format!("unknown check type '{}'", other))),
        }
    }
}

// =========================================================================
// Severity
// =========================================================================

/// Ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Upper bounds (inclusive) of the Low, Medium and High tiers
pub const LOW_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 0);
pub const MEDIUM_THRESHOLD: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
pub const HIGH_THRESHOLD: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);

/// `resolved_by` recorded on auto-corrected exceptions
pub const AUTO_CORRECTION_RESOLVER: &str = "system";

impl Severity {
    /// Tier for an absolute difference. Bounds are inclusive: exactly $1 is Low.
    pub fn classify(difference: Decimal) -> Severity {
        let abs = difference.abs();
        if abs <= LOW_THRESHOLD {
            Severity::Low
        } else if abs <= MEDIUM_THRESHOLD {
            Severity::Medium
        } else if abs <= HIGH_THRESHOLD {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    /// Tier of `difference`, raised to at least `floor`
    pub fn for_discrepancy(difference: Decimal, floor: Severity) -> Severity {
        Self::classify(difference).max(floor)
    }

    pub fn requires_alert(&self) -> bool {
        *self >= Severity::High
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ReconciliationError::Corrupted(format!("unknown severity '{}'", other))),
        }
    }
}

// =========================================================================
// Records
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub id: Uuid,
    pub run_type: RunType,
    pub status: ReportStatus,
    pub total_checks: i32,
    pub passed_checks: i32,
    pub failed_checks: i32,
    pub exceptions_count: i32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReconciliationReport {
    pub fn new(run_type: RunType) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_type,
            status: ReportStatus::Pending,
            total_checks: 0,
            passed_checks: 0,
            failed_checks: 0,
            exceptions_count: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: ReportStatus) -> Result<(), ReconciliationError> {
        if !self.status.can_transition_to(next) {
            return Err(ReconciliationError::Corrupted(format!(
                "report {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Count one executed check
    pub fn record_check(&mut self, passed: bool, exceptions: i32) {
        self.total_checks += 1;
        if passed {
            self.passed_checks += 1;
        } else {
            self.failed_checks += 1;
        }
        self.exceptions_count += exceptions;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = ReportStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}

/// One executed check within a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub id: Uuid,
    pub report_id: Uuid,
    /// Registration order within the report
    pub position: i32,
    pub check_type: CheckType,
    pub expected: Decimal,
    pub actual: Decimal,
    /// `actual - expected`
    pub difference: Decimal,
    pub tolerance: Decimal,
    pub currency: String,
    pub passed: bool,
    pub error_message: Option<String>,
    /// Structural violations found alongside the totals
    pub findings: Vec<String>,
    pub execution_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationException {
    pub id: Uuid,
    pub report_id: Uuid,
    pub check_id: Uuid,
    pub check_type: CheckType,
    pub severity: Severity,
    pub description: String,
    pub expected: Decimal,
    pub actual: Decimal,
    pub difference: Decimal,
    pub currency: String,
    pub auto_corrected: bool,
    pub correction_action: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReconciliationException {
    pub fn from_check(check: &CheckRecord, severity: Severity, description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            report_id: check.report_id,
            check_id: check.id,
            check_type: check.check_type,
            severity,
            description,
            expected: check.expected,
            actual: check.actual,
            difference: check.difference,
            currency: check.currency.clone(),
            auto_corrected: false,
            correction_action: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Flag a Low exception as handled without touching any balance. The
    /// exception is closed on behalf of the system.
    pub fn flag_auto_corrected(&mut self, action: impl Into<String>) {
        self.auto_corrected = true;
        self.correction_action = Some(action.into());
        self.resolved_at = Some(Utc::now());
        self.resolved_by = Some(AUTO_CORRECTION_RESOLVER.to_string());
    }

    /// One-way transition to resolved
    pub fn mark_resolved(
        &mut self,
        resolved_by: impl Into<String>,
        notes: impl Into<String>,
    ) -> Result<(), ReconciliationError> {
        if self.is_resolved() {
            return Err(ReconciliationError::AlreadyResolved(self.id));
        }
        self.resolved_at = Some(Utc::now());
        self.resolved_by = Some(resolved_by.into());
        self.resolution_notes = Some(notes.into());
        Ok(())
    }
}
