//! In-process storage backend
//!
//! Implements every storage trait over one async mutex, which gives the same
//! all-or-nothing commit and serialized balance updates as the PostgreSQL
//! repositories. Used by the tests and for running without a database.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::transaction::build_reversal;
use crate::domain::{
    Account, AccountType, Balance, Currency, Entry, EntryDirection, LedgerError, LedgerResult,
    Transaction, TransactionReceipt, TransactionStatus, TransactionType,
};
use crate::ledger::posting::{check_reversible, plan_postings};
use crate::ledger::{
    BalanceDrift, CurrencyEntryTotals, LedgerRepository, LegacyBalance, LegacyBalanceStore,
    LegacyDeltas, UnbalancedTransaction,
};
use crate::reconciliation::{
    AuxiliaryRecords, CheckRecord, ReconciliationError, ReconciliationException,
    ReconciliationReport, ReconciliationRepository, ReconciliationResult, Severity,
};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    account_index: HashMap<(Option<Uuid>, AccountType), Uuid>,
    transactions: HashMap<Uuid, Transaction>,
    idempotency_keys: HashMap<String, Uuid>,
    /// Insertion order
    entries: Vec<Entry>,

    reports: HashMap<Uuid, ReconciliationReport>,
    checks: Vec<CheckRecord>,
    exceptions: Vec<ReconciliationException>,

    deposits: Vec<Decimal>,
    withdrawals: Vec<Decimal>,
    conversion_jobs: Vec<String>,

    legacy: HashMap<Uuid, LegacyBalance>,
    legacy_mirrored: HashSet<Uuid>,

    fail_check_writes: bool,
}

impl State {
    fn entries_of(&self, transaction_id: Uuid) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    fn receipt(&self, transaction_id: Uuid, replayed: bool) -> LedgerResult<TransactionReceipt> {
        let transaction = self
            .transactions
            .get(&transaction_id)
            .cloned()
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        Ok(TransactionReceipt {
            entries: self.entries_of(transaction_id),
            transaction,
            replayed,
        })
    }

    /// Validate and apply the balance effect of `entries`, touching nothing on
    /// error.
    fn post(&mut self, entries: &[Entry]) -> LedgerResult<()> {
        let locked: HashMap<Uuid, Account> = entries
            .iter()
            .filter_map(|e| self.accounts.get(&e.account_id))
            .map(|a| (a.id, a.clone()))
            .collect();

        let updates = plan_postings(&locked, entries)?;
        let now = Utc::now();
        for update in updates {
            if let Some(account) = self.accounts.get_mut(&update.account_id) {
                account.balance = update.new_balance;
                account.updated_at = now;
            }
        }
        Ok(())
    }

    fn insert(&mut self, transaction: Transaction, entries: Vec<Entry>) {
        self.idempotency_keys
            .insert(transaction.idempotency_key.clone(), transaction.id);
        self.transactions.insert(transaction.id, transaction);
        self.entries.extend(entries);
    }

    fn guard_check_write(&self) -> ReconciliationResult<()> {
        if self.fail_check_writes {
            return Err(ReconciliationError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

/// Shared in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Seeding and fault injection
    // =========================================================================

    /// Store a transaction header without any validation
    pub async fn insert_raw_transaction(&self, transaction: Transaction) {
        let mut state = self.state.lock().await;
        state
            .idempotency_keys
            .insert(transaction.idempotency_key.clone(), transaction.id);
        state.transactions.insert(transaction.id, transaction);
    }

    /// Store an entry without validation or balance effect
    pub async fn insert_raw_entry(&self, entry: Entry) {
        self.state.lock().await.entries.push(entry);
    }

    /// Overwrite a stored balance, bypassing the entries
    pub async fn set_raw_balance(&self, account_id: Uuid, balance: Decimal) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        account.balance = Balance::new(balance);
        Ok(())
    }

    pub async fn record_deposit(&self, amount: Decimal) {
        self.state.lock().await.deposits.push(amount);
    }

    pub async fn record_withdrawal(&self, amount: Decimal) {
        self.state.lock().await.withdrawals.push(amount);
    }

    pub async fn record_conversion_job(&self, job_id: impl Into<String>) {
        self.state.lock().await.conversion_jobs.push(job_id.into());
    }

    /// Make check and exception writes fail until turned off again
    pub async fn fail_check_writes(&self, fail: bool) {
        self.state.lock().await.fail_check_writes = fail;
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

// =========================================================================
// Ledger
// =========================================================================

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn get_or_create_account(
        &self,
        user_id: Option<Uuid>,
        account_type: AccountType,
    ) -> LedgerResult<Account> {
        let candidate = Account::open(user_id, account_type)?;
        let mut state = self.state.lock().await;

        if let Some(id) = state.account_index.get(&(user_id, account_type)) {
            if let Some(account) = state.accounts.get(id) {
                return Ok(account.clone());
            }
        }

        state.account_index.insert((user_id, account_type), candidate.id);
        state.accounts.insert(candidate.id, candidate.clone());
        Ok(candidate)
    }

    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&account_id).cloned())
    }

    async fn get_user_accounts(&self, user_id: Uuid) -> LedgerResult<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|a| a.user_id == Some(user_id))
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.account_type.as_str());
        Ok(accounts)
    }

    async fn get_system_accounts(&self) -> LedgerResult<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|a| a.is_system())
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.account_type.as_str());
        Ok(accounts)
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .idempotency_keys
            .get(idempotency_key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> LedgerResult<Option<Transaction>> {
        Ok(self.state.lock().await.transactions.get(&transaction_id).cloned())
    }

    async fn get_entries(&self, transaction_id: Uuid) -> LedgerResult<Vec<Entry>> {
        Ok(self.state.lock().await.entries_of(transaction_id))
    }

    async fn commit_transaction(
        &self,
        transaction: Transaction,
        entries: Vec<Entry>,
    ) -> LedgerResult<TransactionReceipt> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.idempotency_keys.get(&transaction.idempotency_key).copied() {
            return state.receipt(existing, true);
        }

        state.post(&entries)?;
        state.insert(transaction.clone(), entries.clone());

        Ok(TransactionReceipt {
            transaction,
            entries,
            replayed: false,
        })
    }

    async fn commit_reversal(&self, transaction_id: Uuid, reason: &str) -> LedgerResult<TransactionReceipt> {
        let mut state = self.state.lock().await;

        let original = state
            .transactions
            .get(&transaction_id)
            .cloned()
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        check_reversible(&original)?;

        let entries = state.entries_of(transaction_id);
        let (reversal, mirrored) = build_reversal(&original, &entries, reason);
        if state.idempotency_keys.contains_key(&reversal.idempotency_key) {
            return Err(LedgerError::AlreadyReversed(transaction_id));
        }

        state.post(&mirrored)?;
        state.insert(reversal.clone(), mirrored.clone());
        if let Some(original) = state.transactions.get_mut(&transaction_id) {
            original.status = TransactionStatus::Reversed;
            original.updated_at = Utc::now();
        }

        Ok(TransactionReceipt {
            transaction: reversal,
            entries: mirrored,
            replayed: false,
        })
    }

    async fn entry_totals_by_currency(&self) -> LedgerResult<Vec<CurrencyEntryTotals>> {
        let state = self.state.lock().await;
        let mut totals = BTreeMap::new();
        for entry in &state.entries {
            let t = totals.entry(entry.currency).or_insert(CurrencyEntryTotals {
                currency: entry.currency,
                debits: Decimal::ZERO,
                credits: Decimal::ZERO,
            });
            match entry.direction {
                EntryDirection::Debit => t.debits += entry.amount,
                EntryDirection::Credit => t.credits += entry.amount,
            }
        }
        Ok(totals.into_values().collect())
    }

    async fn unbalanced_transactions(&self) -> LedgerResult<Vec<UnbalancedTransaction>> {
        let state = self.state.lock().await;
        let mut sums: BTreeMap<(Uuid, Currency), (Decimal, Decimal)> = BTreeMap::new();
        for entry in &state.entries {
            let (debits, credits) = sums
                .entry((entry.transaction_id, entry.currency))
                .or_insert((Decimal::ZERO, Decimal::ZERO));
            match entry.direction {
                EntryDirection::Debit => *debits += entry.amount,
                EntryDirection::Credit => *credits += entry.amount,
            }
        }

        Ok(sums
            .into_iter()
            .filter(|(_, (debits, credits))| debits != credits)
            .map(|((transaction_id, currency), (debits, credits))| UnbalancedTransaction {
                transaction_id,
                currency,
                debits,
                credits,
            })
            .collect())
    }

    async fn orphaned_entry_count(&self) -> LedgerResult<i64> {
        let state = self.state.lock().await;
        let count = state
            .entries
            .iter()
            .filter(|e| {
                !state.transactions.contains_key(&e.transaction_id)
                    || !state.accounts.contains_key(&e.account_id)
            })
            .count();
        Ok(count as i64)
    }

    async fn accounts_with_balance_drift(&self) -> LedgerResult<Vec<BalanceDrift>> {
        let state = self.state.lock().await;
        let mut derived: HashMap<Uuid, Decimal> = HashMap::new();
        for entry in &state.entries {
            if let Some(account) = state.accounts.get(&entry.account_id) {
                *derived.entry(account.id).or_insert(Decimal::ZERO) +=
                    account.signed_amount(entry.direction, entry.amount);
            }
        }

        let mut drifts: Vec<BalanceDrift> = state
            .accounts
            .values()
            .filter_map(|account| {
                let derived = derived.get(&account.id).copied().unwrap_or(Decimal::ZERO);
                (account.balance.value() != derived).then(|| BalanceDrift {
                    account_id: account.id,
                    recorded: account.balance.value(),
                    derived,
                })
            })
            .collect();
        drifts.sort_by_key(|d| d.account_id);
        Ok(drifts)
    }

    async fn total_balance_by_account_type(&self, account_type: AccountType) -> LedgerResult<Decimal> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .filter(|a| a.account_type == account_type)
            .map(|a| a.balance.value())
            .sum())
    }

    async fn sum_entries(
        &self,
        transaction_type: TransactionType,
        account_type: AccountType,
        direction: EntryDirection,
    ) -> LedgerResult<Decimal> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.direction == direction)
            .filter(|e| {
                state.transactions.get(&e.transaction_id).is_some_and(|t| {
                    t.transaction_type == transaction_type && t.status == TransactionStatus::Completed
                })
            })
            .filter(|e| {
                state
                    .accounts
                    .get(&e.account_id)
                    .is_some_and(|a| a.account_type == account_type)
            })
            .map(|e| e.amount)
            .sum())
    }

    async fn missing_references(
        &self,
        transaction_type: TransactionType,
        reference_ids: &[String],
    ) -> LedgerResult<Vec<String>> {
        let state = self.state.lock().await;
        let present: HashSet<&str> = state
            .transactions
            .values()
            .filter(|t| t.transaction_type == transaction_type)
            .filter_map(|t| t.reference_id.as_deref())
            .collect();

        let mut missing: Vec<String> = reference_ids
            .iter()
            .filter(|r| !present.contains(r.as_str()))
            .cloned()
            .collect();
        missing.sort();
        Ok(missing)
    }
}

// =========================================================================
// Legacy balances
// =========================================================================

#[async_trait]
impl LegacyBalanceStore for MemoryStore {
    async fn get_legacy_balance(&self, user_id: Uuid) -> LedgerResult<Option<LegacyBalance>> {
        Ok(self.state.lock().await.legacy.get(&user_id).cloned())
    }

    async fn apply_transaction(&self, transaction_id: Uuid, deltas: &LegacyDeltas) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        if !state.legacy_mirrored.insert(transaction_id) {
            return Ok(false);
        }

        for (&user_id, &(pending_deposits, buying_power)) in deltas {
            let row = state.legacy.entry(user_id).or_insert_with(|| LegacyBalance {
                user_id,
                pending_deposits: Decimal::ZERO,
                buying_power: Decimal::ZERO,
                updated_at: Utc::now(),
            });
            row.pending_deposits += pending_deposits;
            row.buying_power += buying_power;
            row.updated_at = Utc::now();
        }
        Ok(true)
    }
}

// =========================================================================
// Auxiliary records
// =========================================================================

#[async_trait]
impl AuxiliaryRecords for MemoryStore {
    async fn completed_deposit_total(&self) -> ReconciliationResult<Decimal> {
        Ok(self.state.lock().await.deposits.iter().copied().sum())
    }

    async fn completed_withdrawal_total(&self) -> ReconciliationResult<Decimal> {
        Ok(self.state.lock().await.withdrawals.iter().copied().sum())
    }

    async fn completed_conversion_job_ids(&self) -> ReconciliationResult<Vec<String>> {
        Ok(self.state.lock().await.conversion_jobs.clone())
    }
}

// =========================================================================
// Reconciliation
// =========================================================================

#[async_trait]
impl ReconciliationRepository for MemoryStore {
    async fn create_report(&self, report: &ReconciliationReport) -> ReconciliationResult<()> {
        let mut state = self.state.lock().await;
        state.reports.insert(report.id, report.clone());
        Ok(())
    }

    async fn update_report(&self, report: &ReconciliationReport) -> ReconciliationResult<()> {
        let mut state = self.state.lock().await;
        match state.reports.get_mut(&report.id) {
            Some(stored) => {
                *stored = report.clone();
                Ok(())
            }
            None => Err(ReconciliationError::ReportNotFound(report.id)),
        }
    }

    async fn get_report(&self, report_id: Uuid) -> ReconciliationResult<Option<ReconciliationReport>> {
        Ok(self.state.lock().await.reports.get(&report_id).cloned())
    }

    async fn list_reports(&self, limit: i64) -> ReconciliationResult<Vec<ReconciliationReport>> {
        let state = self.state.lock().await;
        let mut reports: Vec<ReconciliationReport> = state.reports.values().cloned().collect();
        reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        reports.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(reports)
    }

    async fn save_check(&self, check: &CheckRecord) -> ReconciliationResult<()> {
        let mut state = self.state.lock().await;
        state.guard_check_write()?;
        state.checks.push(check.clone());
        Ok(())
    }

    async fn get_report_checks(&self, report_id: Uuid) -> ReconciliationResult<Vec<CheckRecord>> {
        let state = self.state.lock().await;
        let mut checks: Vec<CheckRecord> = state
            .checks
            .iter()
            .filter(|c| c.report_id == report_id)
            .cloned()
            .collect();
        checks.sort_by_key(|c| c.position);
        Ok(checks)
    }

    async fn save_exception(&self, exception: &ReconciliationException) -> ReconciliationResult<()> {
        let mut state = self.state.lock().await;
        state.guard_check_write()?;
        state.exceptions.push(exception.clone());
        Ok(())
    }

    async fn get_exception(&self, exception_id: Uuid) -> ReconciliationResult<Option<ReconciliationException>> {
        let state = self.state.lock().await;
        Ok(state.exceptions.iter().find(|e| e.id == exception_id).cloned())
    }

    async fn get_report_exceptions(&self, report_id: Uuid) -> ReconciliationResult<Vec<ReconciliationException>> {
        let state = self.state.lock().await;
        Ok(state
            .exceptions
            .iter()
            .filter(|e| e.report_id == report_id)
            .cloned()
            .collect())
    }

    async fn get_unresolved_exceptions(
        &self,
        severity: Option<Severity>,
    ) -> ReconciliationResult<Vec<ReconciliationException>> {
        let state = self.state.lock().await;
        Ok(state
            .exceptions
            .iter()
            .filter(|e| !e.is_resolved())
            .filter(|e| severity.map_or(true, |s| e.severity == s))
            .cloned()
            .collect())
    }

    async fn resolve_exception(
        &self,
        exception_id: Uuid,
        resolved_by: &str,
        notes: &str,
    ) -> ReconciliationResult<ReconciliationException> {
        let mut state = self.state.lock().await;
        let exception = state
            .exceptions
            .iter_mut()
            .find(|e| e.id == exception_id)
            .ok_or(ReconciliationError::ExceptionNotFound(exception_id))?;

        exception.mark_resolved(resolved_by, notes)?;
        Ok(exception.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Amount, CreateTransactionRequest};
    use rust_decimal_macros::dec;

    async fn user_and_buffer(store: &MemoryStore) -> (Account, Account) {
        let user = store
            .get_or_create_account(Some(Uuid::new_v4()), AccountType::UsdcBalance)
            .await
            .unwrap();
        let buffer = store
            .get_or_create_account(None, AccountType::SystemBufferUsdc)
            .await
            .unwrap();
        (user, buffer)
    }

    fn deposit(key: &str, user: &Account, buffer: &Account, amount: Decimal) -> (Transaction, Vec<Entry>) {
        let request = CreateTransactionRequest::new(TransactionType::Deposit, key, "deposit")
            .debit(buffer.id, Amount::new(amount).unwrap(), Currency::Usdc)
            .credit(user.id, Amount::new(amount).unwrap(), Currency::Usdc);
        let hash = request.request_hash().unwrap();
        request.to_records(hash)
    }

    #[tokio::test]
    async fn test_get_or_create_account_is_stable() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let a = store
            .get_or_create_account(Some(user_id), AccountType::FiatExposure)
            .await
            .unwrap();
        let b = store
            .get_or_create_account(Some(user_id), AccountType::FiatExposure)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_commit_applies_balances_and_replays() {
        let store = MemoryStore::new();
        let (user, buffer) = user_and_buffer(&store).await;

        let (tx, entries) = deposit("dep-1", &user, &buffer, dec!(25));
        let first = store.commit_transaction(tx, entries).await.unwrap();
        assert!(!first.replayed);

        let (tx, entries) = deposit("dep-1", &user, &buffer, dec!(25));
        let second = store.commit_transaction(tx, entries).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.transaction.id, first.transaction.id);

        let user = store.get_account(user.id).await.unwrap().unwrap();
        let buffer = store.get_account(buffer.id).await.unwrap().unwrap();
        assert_eq!(user.balance.value(), dec!(25));
        assert_eq!(buffer.balance.value(), dec!(25));
        assert_eq!(store.entry_count().await, 2);
        assert!(store.accounts_with_balance_drift().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_posting_leaves_nothing_behind() {
        let store = MemoryStore::new();
        let (user, buffer) = user_and_buffer(&store).await;

        // Withdrawal from an empty user account
        let request = CreateTransactionRequest::new(TransactionType::Withdrawal, "wd-1", "withdraw")
            .debit(user.id, Amount::new(dec!(5)).unwrap(), Currency::Usdc)
            .credit(buffer.id, Amount::new(dec!(5)).unwrap(), Currency::Usdc);
        let hash = request.request_hash().unwrap();
        let (tx, entries) = request.to_records(hash);

        let err = store.commit_transaction(tx, entries).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(store.transaction_count().await, 0);
        assert_eq!(store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_raw_entry_shows_up_as_unbalanced_and_drift() {
        let store = MemoryStore::new();
        let (user, buffer) = user_and_buffer(&store).await;
        let (tx, entries) = deposit("dep-2", &user, &buffer, dec!(100));
        let receipt = store.commit_transaction(tx, entries).await.unwrap();

        let mut extra = receipt.entries[0].clone();
        extra.id = Uuid::new_v4();
        extra.amount = dec!(1);
        store.insert_raw_entry(extra).await;

        assert_eq!(store.unbalanced_transactions().await.unwrap().len(), 1);
        assert_eq!(store.accounts_with_balance_drift().await.unwrap().len(), 1);
        assert_eq!(store.orphaned_entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_references() {
        let store = MemoryStore::new();
        let missing = store
            .missing_references(TransactionType::Conversion, &["job-2".to_string(), "job-1".to_string()])
            .await
            .unwrap();
        assert_eq!(missing, vec!["job-1".to_string(), "job-2".to_string()]);
    }
}
