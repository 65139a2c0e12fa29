//! Shadow ledger
//!
//! During the migration off the legacy `balances` table every ledger write is
//! mirrored into it, and balance reads compare the two views. The decorator
//! wraps any [`Ledger`]; the comparison itself is the pure
//! [`compare_balances`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    Account, AccountType, Amount, CreateTransactionRequest, LedgerError, LedgerResult,
    OperationContext, SystemBuffers, Transaction, TransactionReceipt, UserBalances,
};

use super::service::Ledger;

// =========================================================================
// Legacy store
// =========================================================================

/// Row of the legacy balances table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyBalance {
    pub user_id: Uuid,
    /// USDC the legacy system tracks as deposited
    pub pending_deposits: Decimal,
    /// USD buying power at the brokerage
    pub buying_power: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Per-user `(pending_deposits, buying_power)` deltas
pub type LegacyDeltas = BTreeMap<Uuid, (Decimal, Decimal)>;

#[async_trait]
pub trait LegacyBalanceStore: Send + Sync {
    async fn get_legacy_balance(&self, user_id: Uuid) -> LedgerResult<Option<LegacyBalance>>;

    /// Add the deltas of one ledger transaction, creating rows when missing.
    /// All or nothing, and at most once per transaction: returns `false`
    /// when the transaction was already applied.
    async fn apply_transaction(&self, transaction_id: Uuid, deltas: &LegacyDeltas) -> LedgerResult<bool>;
}

/// Legacy store on the `balances` table
#[derive(Debug, Clone)]
pub struct PgLegacyBalanceStore {
    pool: PgPool,
}

impl PgLegacyBalanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LegacyBalanceStore for PgLegacyBalanceStore {
    async fn get_legacy_balance(&self, user_id: Uuid) -> LedgerResult<Option<LegacyBalance>> {
        let row: Option<(Uuid, Decimal, Decimal, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT user_id, pending_deposits, buying_power, updated_at
            FROM balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id, pending_deposits, buying_power, updated_at)| LegacyBalance {
            user_id,
            pending_deposits,
            buying_power,
            updated_at,
        }))
    }

    async fn apply_transaction(&self, transaction_id: Uuid, deltas: &LegacyDeltas) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO legacy_mirrored_transactions (transaction_id, mirrored_at)
            VALUES ($1, NOW())
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(transaction_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (user_id, (pending_deposits, buying_power)) in deltas {
            sqlx::query(
                r#"
                INSERT INTO balances (user_id, pending_deposits, buying_power, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (user_id) DO UPDATE SET
                    pending_deposits = balances.pending_deposits + EXCLUDED.pending_deposits,
                    buying_power = balances.buying_power + EXCLUDED.buying_power,
                    updated_at = NOW()
                "#,
            )
            .bind(user_id)
            .bind(pending_deposits)
            .bind(buying_power)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

// =========================================================================
// Comparison
// =========================================================================

/// One field on which the ledger and the legacy table disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceDiscrepancy {
    pub field: &'static str,
    pub ledger: Decimal,
    pub legacy: Decimal,
}

impl BalanceDiscrepancy {
    pub fn difference(&self) -> Decimal {
        self.ledger - self.legacy
    }
}

impl fmt::Display for BalanceDiscrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: ledger={} legacy={} diff={}",
            self.field,
            self.ledger,
            self.legacy,
            self.difference()
        )
    }
}

/// Compare like with like: USDC against pending deposits, fiat exposure
/// against buying power.
pub fn compare_balances(ledger: &UserBalances, legacy: &LegacyBalance) -> Vec<BalanceDiscrepancy> {
    let pairs = [
        ("usdc_balance", ledger.usdc_balance, legacy.pending_deposits),
        ("fiat_exposure", ledger.fiat_exposure, legacy.buying_power),
    ];

    pairs
        .into_iter()
        .filter(|(_, l, r)| l != r)
        .map(|(field, ledger, legacy)| BalanceDiscrepancy {
            field,
            ledger,
            legacy,
        })
        .collect()
}

/// Per-user legacy deltas implied by a committed transaction
pub fn legacy_deltas(receipt: &TransactionReceipt, accounts: &HashMap<Uuid, Account>) -> LegacyDeltas {
    let mut deltas = LegacyDeltas::new();
    for entry in &receipt.entries {
        let Some(account) = accounts.get(&entry.account_id) else {
            continue;
        };
        let Some(user_id) = account.user_id else {
            continue;
        };
        let signed = account.signed_amount(entry.direction, entry.amount);
        match account.account_type {
            AccountType::UsdcBalance => deltas.entry(user_id).or_default().0 += signed,
            AccountType::FiatExposure => deltas.entry(user_id).or_default().1 += signed,
            _ => {}
        }
    }
    deltas.retain(|_, (p, b)| !p.is_zero() || !b.is_zero());
    deltas
}

// =========================================================================
// Decorator
// =========================================================================

/// Ledger decorator that dual-writes into the legacy balances table
pub struct ShadowLedger<L> {
    inner: L,
    legacy: Arc<dyn LegacyBalanceStore>,
    strict: bool,
}

impl<L: Ledger> ShadowLedger<L> {
    /// In strict mode, mirror failures and discrepancies are returned as
    /// errors instead of being logged. A write whose mirror failed is mirrored
    /// again when the caller retries it with the same idempotency key.
    pub fn new(inner: L, legacy: Arc<dyn LegacyBalanceStore>, strict: bool) -> Self {
        Self { inner, legacy, strict }
    }

    async fn mirror(&self, ctx: &OperationContext, receipt: TransactionReceipt) -> LedgerResult<TransactionReceipt> {
        if let Err(e) = self.try_mirror(ctx, &receipt).await {
            tracing::error!(
                transaction_id = %receipt.transaction.id,
                correlation_id = %ctx.correlation_id,
                error = %e,
                "Shadow mode: failed to update legacy balance"
            );
            if self.strict {
                return Err(LedgerError::ShadowMirror(e.to_string()));
            }
        }

        Ok(receipt)
    }

    async fn try_mirror(&self, ctx: &OperationContext, receipt: &TransactionReceipt) -> LedgerResult<()> {
        let mut accounts = HashMap::new();
        for entry in &receipt.entries {
            if !accounts.contains_key(&entry.account_id) {
                let account = self.inner.get_account(ctx, entry.account_id).await?;
                accounts.insert(account.id, account);
            }
        }

        let deltas = legacy_deltas(receipt, &accounts);
        if deltas.is_empty() {
            return Ok(());
        }

        let applied = self.legacy.apply_transaction(receipt.transaction.id, &deltas).await?;
        if !applied {
            tracing::debug!(
                transaction_id = %receipt.transaction.id,
                "Shadow mode: transaction already mirrored"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<L: Ledger> Ledger for ShadowLedger<L> {
    async fn create_transaction(
        &self,
        ctx: &OperationContext,
        request: CreateTransactionRequest,
    ) -> LedgerResult<TransactionReceipt> {
        let receipt = self.inner.create_transaction(ctx, request).await?;
        self.mirror(ctx, receipt).await
    }

    async fn get_or_create_user_account(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        account_type: AccountType,
    ) -> LedgerResult<Account> {
        self.inner.get_or_create_user_account(ctx, user_id, account_type).await
    }

    async fn get_system_account(
        &self,
        ctx: &OperationContext,
        account_type: AccountType,
    ) -> LedgerResult<Account> {
        self.inner.get_system_account(ctx, account_type).await
    }

    async fn get_account(&self, ctx: &OperationContext, account_id: Uuid) -> LedgerResult<Account> {
        self.inner.get_account(ctx, account_id).await
    }

    async fn get_transaction(
        &self,
        ctx: &OperationContext,
        transaction_id: Uuid,
    ) -> LedgerResult<Transaction> {
        self.inner.get_transaction(ctx, transaction_id).await
    }

    async fn reserve_for_investment(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
    ) -> LedgerResult<TransactionReceipt> {
        let receipt = self
            .inner
            .reserve_for_investment(ctx, user_id, amount, reference_id)
            .await?;
        self.mirror(ctx, receipt).await
    }

    async fn release_reservation(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
    ) -> LedgerResult<TransactionReceipt> {
        let receipt = self
            .inner
            .release_reservation(ctx, user_id, amount, reference_id)
            .await?;
        self.mirror(ctx, receipt).await
    }

    async fn reverse_transaction(
        &self,
        ctx: &OperationContext,
        transaction_id: Uuid,
        reason: &str,
    ) -> LedgerResult<TransactionReceipt> {
        let receipt = self.inner.reverse_transaction(ctx, transaction_id, reason).await?;
        self.mirror(ctx, receipt).await
    }

    async fn get_user_balances(&self, ctx: &OperationContext, user_id: Uuid) -> LedgerResult<UserBalances> {
        let balances = self.inner.get_user_balances(ctx, user_id).await?;

        match self.legacy.get_legacy_balance(user_id).await {
            Ok(Some(legacy)) => {
                let discrepancies = compare_balances(&balances, &legacy);
                if !discrepancies.is_empty() {
                    let details = discrepancies
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    tracing::warn!(
                        user_id = %user_id,
                        correlation_id = %ctx.correlation_id,
                        discrepancies = %details,
                        "Shadow mode: balance discrepancies detected"
                    );
                    if self.strict {
                        return Err(LedgerError::ShadowDiscrepancy { user_id, details });
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(user_id = %user_id, "Shadow mode: no legacy balance row");
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Shadow mode: failed to get legacy balance"
                );
            }
        }

        Ok(balances)
    }

    async fn get_system_buffers(&self, ctx: &OperationContext) -> LedgerResult<SystemBuffers> {
        self.inner.get_system_buffers(ctx).await
    }
}
