//! Ledger integration
//!
//! Typed entry points for the domain flows that move customer value. Each
//! builds a balanced request with an idempotency key derived from the
//! external reference, so a redelivered event replays instead of posting
//! twice.

use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    AccountType, Amount, CreateTransactionRequest, Currency, LedgerError, LedgerResult,
    OperationContext, TransactionMetadata, TransactionReceipt, TransactionType, UserBalances,
};

use super::service::Ledger;

/// On-chain details of an inbound deposit
#[derive(Debug, Clone, Default)]
pub struct DepositDetails {
    pub chain: Option<String>,
    pub tx_hash: Option<String>,
}

#[derive(Clone)]
pub struct LedgerIntegration {
    ledger: Arc<dyn Ledger>,
}

impl LedgerIntegration {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Credit a confirmed USDC deposit against the custodial buffer
    pub async fn credit_user_usdc(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
        details: DepositDetails,
    ) -> LedgerResult<TransactionReceipt> {
        require_reference(reference_id)?;
        tracing::info!(user_id = %user_id, amount = %amount, reference_id, "Crediting user USDC");

        let user = self
            .ledger
            .get_or_create_user_account(ctx, user_id, AccountType::UsdcBalance)
            .await?;
        let buffer = self
            .ledger
            .get_system_account(ctx, AccountType::SystemBufferUsdc)
            .await?;

        let request = CreateTransactionRequest::new(
            TransactionType::Deposit,
            format!("credit-usdc-{}", reference_id),
            format!("USDC deposit {}", reference_id),
        )
        .credit(user.id, amount, Currency::Usdc)
        .debit(buffer.id, amount, Currency::Usdc)
        .with_user(user_id)
        .with_reference(reference_id, "deposit")
        .with_metadata(TransactionMetadata::Deposit {
            chain: details.chain,
            tx_hash: details.tx_hash,
        });

        self.ledger.create_transaction(ctx, request).await
    }

    /// Convert USDC into brokerage buying power at `rate` USD per USDC.
    ///
    /// Posted as four legs through the FX clearing accounts so each currency
    /// balances on its own.
    pub async fn move_funds_to_fiat_exposure(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        usdc_amount: Amount,
        rate: Decimal,
        reference_id: &str,
    ) -> LedgerResult<TransactionReceipt> {
        require_reference(reference_id)?;
        let usd_amount = usdc_amount.convert(rate)?;
        tracing::info!(
            user_id = %user_id,
            usdc_amount = %usdc_amount,
            usd_amount = %usd_amount,
            rate = %rate,
            reference_id,
            "Moving funds to fiat exposure"
        );

        let usdc = self
            .ledger
            .get_or_create_user_account(ctx, user_id, AccountType::UsdcBalance)
            .await?;
        let fiat = self
            .ledger
            .get_or_create_user_account(ctx, user_id, AccountType::FiatExposure)
            .await?;
        let clearing_usdc = self
            .ledger
            .get_system_account(ctx, AccountType::FxClearingUsdc)
            .await?;
        let clearing_usd = self
            .ledger
            .get_system_account(ctx, AccountType::FxClearingUsd)
            .await?;

        let request = CreateTransactionRequest::new(
            TransactionType::Conversion,
            format!("move-fiat-{}", reference_id),
            format!("USDC to USD conversion {}", reference_id),
        )
        .debit(usdc.id, usdc_amount, Currency::Usdc)
        .credit(clearing_usdc.id, usdc_amount, Currency::Usdc)
        .debit(clearing_usd.id, usd_amount, Currency::Usd)
        .credit(fiat.id, usd_amount, Currency::Usd)
        .with_user(user_id)
        .with_reference(reference_id, "conversion_job")
        .with_metadata(TransactionMetadata::Conversion {
            from_currency: Currency::Usdc,
            to_currency: Currency::Usd,
            rate,
        });

        self.ledger.create_transaction(ctx, request).await
    }

    /// Debit a user's USDC for an outbound withdrawal
    pub async fn record_withdrawal(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        reference_id: &str,
        destination: Option<String>,
    ) -> LedgerResult<TransactionReceipt> {
        require_reference(reference_id)?;
        tracing::info!(user_id = %user_id, amount = %amount, reference_id, "Recording withdrawal");

        let user = self
            .ledger
            .get_or_create_user_account(ctx, user_id, AccountType::UsdcBalance)
            .await?;
        let buffer = self
            .ledger
            .get_system_account(ctx, AccountType::SystemBufferUsdc)
            .await?;

        let request = CreateTransactionRequest::new(
            TransactionType::Withdrawal,
            format!("withdrawal-{}", reference_id),
            format!("USDC withdrawal {}", reference_id),
        )
        .debit(user.id, amount, Currency::Usdc)
        .credit(buffer.id, amount, Currency::Usdc)
        .with_user(user_id)
        .with_reference(reference_id, "withdrawal")
        .with_metadata(TransactionMetadata::Withdrawal { destination });

        self.ledger.create_transaction(ctx, request).await
    }

    pub async fn reserve_for_investment(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        order_id: &str,
    ) -> LedgerResult<TransactionReceipt> {
        self.ledger.reserve_for_investment(ctx, user_id, amount, order_id).await
    }

    pub async fn release_reservation(
        &self,
        ctx: &OperationContext,
        user_id: Uuid,
        amount: Amount,
        order_id: &str,
    ) -> LedgerResult<TransactionReceipt> {
        self.ledger.release_reservation(ctx, user_id, amount, order_id).await
    }

    pub async fn get_user_balances(&self, ctx: &OperationContext, user_id: Uuid) -> LedgerResult<UserBalances> {
        self.ledger.get_user_balances(ctx, user_id).await
    }
}

fn require_reference(reference_id: &str) -> LedgerResult<()> {
    if reference_id.trim().is_empty() {
        return Err(LedgerError::Validation("reference id is required".to_string()));
    }
    Ok(())
}
