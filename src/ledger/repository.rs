//! Ledger storage contract
//!
//! Implemented by [`super::PgLedgerRepository`] and by the in-process
//! [`crate::memory::MemoryStore`]. Both must commit a transaction, its entries
//! and the balance updates as one unit, and both must turn a duplicate
//! idempotency key into a replayed receipt instead of an error.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    Account, AccountType, Currency, Entry, EntryDirection, LedgerResult, Transaction,
    TransactionReceipt, TransactionType,
};

/// Ledger-wide debit and credit totals for one currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CurrencyEntryTotals {
    pub currency: Currency,
    pub debits: Decimal,
    pub credits: Decimal,
}

/// A transaction whose entries do not net to zero in some currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnbalancedTransaction {
    pub transaction_id: Uuid,
    pub currency: Currency,
    pub debits: Decimal,
    pub credits: Decimal,
}

/// An account whose stored balance differs from the signed sum of its entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceDrift {
    pub account_id: Uuid,
    pub recorded: Decimal,
    pub derived: Decimal,
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    // =========================================================================
    // Accounts
    // =========================================================================

    /// Return the account for `(user_id, account_type)`, creating it if absent.
    /// Concurrent callers observe the same account.
    async fn get_or_create_account(
        &self,
        user_id: Option<Uuid>,
        account_type: AccountType,
    ) -> LedgerResult<Account>;

    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Option<Account>>;

    async fn get_user_accounts(&self, user_id: Uuid) -> LedgerResult<Vec<Account>>;

    async fn get_system_accounts(&self) -> LedgerResult<Vec<Account>>;

    // =========================================================================
    // Transactions
    // =========================================================================

    async fn find_transaction_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> LedgerResult<Option<Transaction>>;

    async fn get_transaction(&self, transaction_id: Uuid) -> LedgerResult<Option<Transaction>>;

    async fn get_entries(&self, transaction_id: Uuid) -> LedgerResult<Vec<Entry>>;

    /// Atomically insert the transaction and its entries and apply the balance
    /// deltas. A duplicate idempotency key yields the stored transaction with
    /// `replayed = true` and changes nothing.
    async fn commit_transaction(
        &self,
        transaction: Transaction,
        entries: Vec<Entry>,
    ) -> LedgerResult<TransactionReceipt>;

    /// Atomically post the mirror of `transaction_id` and mark it reversed.
    async fn commit_reversal(&self, transaction_id: Uuid, reason: &str) -> LedgerResult<TransactionReceipt>;

    // =========================================================================
    // Aggregates (read-only, used by reconciliation)
    // =========================================================================

    async fn entry_totals_by_currency(&self) -> LedgerResult<Vec<CurrencyEntryTotals>>;

    async fn unbalanced_transactions(&self) -> LedgerResult<Vec<UnbalancedTransaction>>;

    /// Entries whose transaction or account does not exist
    async fn orphaned_entry_count(&self) -> LedgerResult<i64>;

    async fn accounts_with_balance_drift(&self) -> LedgerResult<Vec<BalanceDrift>>;

    async fn total_balance_by_account_type(&self, account_type: AccountType) -> LedgerResult<Decimal>;

    /// Sum of entry amounts on `account_type` accounts, posted on `direction`,
    /// within completed transactions of `transaction_type`
    async fn sum_entries(
        &self,
        transaction_type: TransactionType,
        account_type: AccountType,
        direction: EntryDirection,
    ) -> LedgerResult<Decimal>;

    /// The subset of `reference_ids` with no `transaction_type` transaction
    async fn missing_references(
        &self,
        transaction_type: TransactionType,
        reference_ids: &[String],
    ) -> LedgerResult<Vec<String>>;
}
