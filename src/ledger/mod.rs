//! Ledger module
//!
//! Double-entry ledger: storage contract, posting rules, the service, and the
//! decorators and facades built on top of it.

pub mod integration;
pub mod posting;
pub mod postgres;
pub mod repository;
pub mod service;
pub mod shadow;

pub use integration::{DepositDetails, LedgerIntegration};
pub use postgres::PgLedgerRepository;
pub use repository::{
    BalanceDrift, CurrencyEntryTotals, LedgerRepository, UnbalancedTransaction,
};
pub use service::{Ledger, LedgerService};
pub use shadow::{
    compare_balances, BalanceDiscrepancy, LegacyBalance, LegacyBalanceStore, LegacyDeltas,
    PgLegacyBalanceStore, ShadowLedger,
};
