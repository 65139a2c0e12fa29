//! ledger_recon Library
//!
//! Double-entry custody ledger and the reconciliation engine that proves it
//! against the custodian, the brokerage, and the platform's own records.

pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod reconciliation;

pub use config::Config;
pub use domain::{
    Account, AccountType, Amount, Currency, ErrorKind, LedgerError, LedgerResult, OperationContext,
};
pub use error::{AppError, AppResult};
pub use jobs::{ReconciliationScheduler, SchedulerConfig, SchedulerError, SchedulerStatus};
pub use ledger::{Ledger, LedgerIntegration, LedgerService};
pub use memory::MemoryStore;
pub use metrics::{MetricsRecorder, NoopMetrics, PrometheusMetrics};
pub use reconciliation::{ReconciliationError, ReconciliationService, RunType, Severity};
