//! Ledger Service
//!
//! Entry point for every money movement. Validates requests, resolves
//! idempotency, and hands balanced entries to the repository for an atomic
//! commit.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::transaction::reversal_key;
use crate::domain::{
    Account, AccountType, Amount, CreateTransactionRequest, Currency, LedgerError, LedgerResult,
    OperationContext, SystemBuffers, Transaction, TransactionMetadata, TransactionReceipt,
    TransactionType, UserBalances,
};
use crate::metrics::MetricsRecorder;

use super::repository::LedgerRepository;

/// Operations the rest of the platform performs against the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_transaction(
        &self,
        ctx: &OperationContext,
        request: CreateTransactionRequest,
    ) -> LedgerResult<TransactionReceipt>;

    async fn get_or_create_user_account(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        account_type: AccountType,
    ) -> LedgerResult<Account>;

    async fn get_system_account(
        &self,
        ctx: &OperationContext,
        account_type: AccountType,
    ) -> LedgerResult<Account>;

    async fn get_account(&self, ctx: &OperationContext, account_id: Uuid) -> LedgerResult<Account>;

    async fn get_transaction(
        &self,
        ctx: &OperationContext,
        transaction_id: Uuid,
    ) -> LedgerResult<Transaction>;

    /// Move `amount` from fiat exposure into pending investment
    async fn reserve_for_investment(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
    ) -> LedgerResult<TransactionReceipt>;

    /// Return a reservation to fiat exposure
    async fn release_reservation(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
    ) -> LedgerResult<TransactionReceipt>;

    async fn reverse_transaction(
        &self,
        ctx: &OperationContext,
        transaction_id: Uuid,
        reason: &str,
    ) -> LedgerResult<TransactionReceipt>;

    async fn get_user_balances(&self, ctx: &OperationContext, user_id: Uuid) -> LedgerResult<UserBalances>;

    async fn get_system_buffers(&self, ctx: &OperationContext) -> LedgerResult<SystemBuffers>;
}

/// Ledger backed by a [`LedgerRepository`]
#[derive(Clone)]
pub struct LedgerService {
    repository: Arc<dyn LedgerRepository>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl LedgerService {
    pub fn new(repository: Arc<dyn LedgerRepository>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { repository, metrics }
    }

    /// Create the house accounts up front so the first posting does not race
    /// on them.
    pub async fn provision_system_accounts(&self, ctx: &OperationContext) -> LedgerResult<Vec<Account>> {
        let mut accounts = Vec::with_capacity(AccountType::SYSTEM_TYPES.len());
        for account_type in AccountType::SYSTEM_TYPES {
            accounts.push(self.get_system_account(ctx, account_type).await?);
        }
        tracing::info!(count = accounts.len(), "System accounts provisioned");
        Ok(accounts)
    }

    async fn replay(
        &self,
        existing: Transaction,
        request_hash: &str,
        ctx: &OperationContext,
    ) -> LedgerResult<TransactionReceipt> {
        warn_on_payload_mismatch(&existing, request_hash, ctx);
        let entries = self.repository.get_entries(existing.id).await?;

        tracing::debug!(
            transaction_id = %existing.id,
            idempotency_key = %existing.idempotency_key,
            correlation_id = %ctx.correlation_id,
            "Idempotent replay, returning existing transaction"
        );
        self.metrics
            .transaction_recorded(existing.transaction_type.as_str(), true);

        Ok(TransactionReceipt {
            transaction: existing,
            entries,
            replayed: true,
        })
    }

    /// Shared body of reserve and release: `from` -> `to` within one user
    #[allow(clippy::too_many_arguments)]
    async fn move_between_user_accounts(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
        from: AccountType,
        to: AccountType,
        transaction_type: TransactionType,
        idempotency_key: String,
    ) -> LedgerResult<TransactionReceipt> {
        if reference_id.trim().is_empty() {
            return Err(LedgerError::Validation("reference id is required".to_string()));
        }

        // A retry must replay even if the balance has since moved
        if let Some(existing) = self
            .repository
            .find_transaction_by_idempotency_key(&idempotency_key)
            .await?
        {
            let entries = self.repository.get_entries(existing.id).await?;
            self.metrics
                .transaction_recorded(existing.transaction_type.as_str(), true);
            return Ok(TransactionReceipt {
                transaction: existing,
                entries,
                replayed: true,
            });
        }

        let source = self.repository.get_or_create_account(Some(user_id), from).await?;
        let target = self.repository.get_or_create_account(Some(user_id), to).await?;

        if !source.balance.is_sufficient_for(&amount) {
            tracing::info!(
                user_id = %user_id,
                account_id = %source.id,
                required = %amount,
                available = %source.balance,
                "Insufficient funds for {}",
                transaction_type
            );
            return Err(LedgerError::insufficient_funds(
                source.id,
                amount.value(),
                source.balance.value(),
            ));
        }

        let metadata = match transaction_type {
            TransactionType::Reservation => TransactionMetadata::Reservation {
                reference_id: reference_id.to_string(),
            },
            _ => TransactionMetadata::Release {
                reference_id: reference_id.to_string(),
            },
        };

        let request = CreateTransactionRequest::new(
            transaction_type,
            idempotency_key,
            format!("{} for {}", transaction_type, reference_id),
        )
        .debit(source.id, amount, Currency::Usd)
        .credit(target.id, amount, Currency::Usd)
        .with_user(user_id)
        .with_reference(reference_id, "investment")
        .with_metadata(metadata);

        self.create_transaction(ctx, request).await
    }
}

fn warn_on_payload_mismatch(existing: &Transaction, request_hash: &str, ctx: &OperationContext) {
    if existing.request_hash != request_hash {
        tracing::warn!(
            transaction_id = %existing.id,
            idempotency_key = %existing.idempotency_key,
            correlation_id = %ctx.correlation_id,
            "Idempotency key reused with a different payload; returning the original transaction"
        );
    }
}

#[async_trait]
impl Ledger for LedgerService {
    async fn create_transaction(
        &self,
        ctx: &OperationContext,
        request: CreateTransactionRequest,
    ) -> LedgerResult<TransactionReceipt> {
        if request.transaction_type == TransactionType::Reversal {
            return Err(LedgerError::Validation(
                "reversals are created through reverse_transaction".to_string(),
            ));
        }
        request.validate()?;
        let request_hash = request.request_hash()?;

        ctx.run(async {
            if let Some(existing) = self
                .repository
                .find_transaction_by_idempotency_key(&request.idempotency_key)
                .await?
            {
                return self.replay(existing, &request_hash, ctx).await;
            }

            let (transaction, entries) = request.to_records(request_hash.clone());
            let receipt = self.repository.commit_transaction(transaction, entries).await?;

            if receipt.replayed {
                // Lost the race to a concurrent request with the same key
                warn_on_payload_mismatch(&receipt.transaction, &request_hash, ctx);
            } else {
                tracing::info!(
                    transaction_id = %receipt.transaction.id,
                    transaction_type = %receipt.transaction.transaction_type,
                    entries = receipt.entries.len(),
                    correlation_id = %ctx.correlation_id,
                    "Transaction committed"
                );
            }
            self.metrics
                .transaction_recorded(receipt.transaction.transaction_type.as_str(), receipt.replayed);

            Ok(receipt)
        })
        .await
    }

    async fn get_or_create_user_account(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        account_type: AccountType,
    ) -> LedgerResult<Account> {
        if account_type.is_system() {
            return Err(LedgerError::Validation(format!(
                "{} is a system account type",
                account_type
            )));
        }
        ctx.run(self.repository.get_or_create_account(Some(user_id), account_type))
            .await
    }

    async fn get_system_account(
        &self,
        ctx: &OperationContext,
        account_type: AccountType,
    ) -> LedgerResult<Account> {
        if !account_type.is_system() {
            return Err(LedgerError::Validation(format!(
                "{} is a user account type",
                account_type
            )));
        }
        ctx.run(self.repository.get_or_create_account(None, account_type))
            .await
    }

    async fn get_account(&self, ctx: &OperationContext, account_id: Uuid) -> LedgerResult<Account> {
        ctx.run(self.repository.get_account(account_id))
            .await?
            .ok_or(LedgerError::AccountNotFound(account_id))
    }

    async fn get_transaction(
        &self,
        ctx: &OperationContext,
        transaction_id: Uuid,
    ) -> LedgerResult<Transaction> {
        ctx.run(self.repository.get_transaction(transaction_id))
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))
    }

    async fn reserve_for_investment(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
    ) -> LedgerResult<TransactionReceipt> {
        ctx.run(self.move_between_user_accounts(
            ctx,
            user_id,
            amount,
            reference_id,
            AccountType::FiatExposure,
            AccountType::PendingInvestment,
            TransactionType::Reservation,
            format!("reserve-{}-{}", user_id, reference_id),
        ))
        .await
    }

    async fn release_reservation(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
    ) -> LedgerResult<TransactionReceipt> {
        ctx.run(self.move_between_user_accounts(
            ctx,
            user_id,
            amount,
            reference_id,
            AccountType::PendingInvestment,
            AccountType::FiatExposure,
            TransactionType::Release,
            format!("release-{}-{}", user_id, reference_id),
        ))
        .await
    }

    async fn reverse_transaction(
        &self,
        ctx: &OperationContext,
        transaction_id: Uuid,
        reason: &str,
    ) -> LedgerResult<TransactionReceipt> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation("reversal reason is required".to_string()));
        }

        let receipt = ctx
            .run(self.repository.commit_reversal(transaction_id, reason))
            .await?;

        tracing::info!(
            transaction_id = %transaction_id,
            reversal_id = %receipt.transaction.id,
            idempotency_key = %reversal_key(transaction_id),
            correlation_id = %ctx.correlation_id,
            reason,
            "Transaction reversed"
        );
        self.metrics
            .transaction_recorded(TransactionType::Reversal.as_str(), false);

        Ok(receipt)
    }

    async fn get_user_balances(&self, ctx: &OperationContext, user_id: Uuid) -> LedgerResult<UserBalances> {
        let accounts = ctx.run(self.repository.get_user_accounts(user_id)).await?;
        Ok(UserBalances::from_accounts(user_id, &accounts))
    }

    async fn get_system_buffers(&self, ctx: &OperationContext) -> LedgerResult<SystemBuffers> {
        let accounts = ctx.run(self.repository.get_system_accounts()).await?;
        Ok(SystemBuffers::from_accounts(&accounts))
    }
}
