//! Reconciliation module
//!
//! Proves the ledger against itself and against the external systems of
//! record, and records every discrepancy as an exception.

pub mod alert;
pub mod check;
pub mod checks;
pub mod error;
pub mod model;
pub mod postgres;
pub mod providers;
pub mod repository;
pub mod service;

pub use alert::{AlertSink, LogAlertSink, ReconciliationAlert, WebhookAlertSink};
pub use check::{CheckOutcome, ReconciliationCheck};
pub use checks::{
    standard_checks, BrokerageBalanceCheck, CheckTolerances, ConversionCompletenessCheck,
    CustodianBalanceCheck, DepositTotalsCheck, LedgerConsistencyCheck, WithdrawalTotalsCheck,
};
pub use error::{ReconciliationError, ReconciliationResult};
pub use model::{
    CheckRecord, CheckType, ReconciliationException, ReconciliationReport, ReportStatus, RunType,
    Severity,
};
pub use postgres::PgReconciliationRepository;
pub use providers::{
    AuxiliaryRecords, BrokerageBalanceProvider, CustodianBalanceProvider, HttpTotalProvider,
    PgAuxiliaryRecords, UnconfiguredProvider,
};
pub use repository::ReconciliationRepository;
pub use service::{ReconciliationConfig, ReconciliationService};
