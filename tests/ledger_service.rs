mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{amount, ctx, funded_user, setup_ledger};
use ledger_recon::domain::{
    AccountType, CreateTransactionRequest, Currency, ErrorKind, TransactionStatus, TransactionType,
};
use ledger_recon::ledger::{
    DepositDetails, Ledger, LedgerIntegration, LegacyBalance, LegacyBalanceStore, LegacyDeltas,
    ShadowLedger,
};
use ledger_recon::{LedgerError, LedgerResult, MemoryStore, OperationContext};

async fn deposit_request(
    ledger: &common::TestLedger,
    user_id: Uuid,
    key: &str,
    debit: rust_decimal::Decimal,
    credit: rust_decimal::Decimal,
) -> CreateTransactionRequest {
    let user = ledger
        .service
        .get_or_create_user_account(&ctx(), user_id, AccountType::UsdcBalance)
        .await
        .unwrap();
    let buffer = ledger
        .service
        .get_system_account(&ctx(), AccountType::SystemBufferUsdc)
        .await
        .unwrap();

    CreateTransactionRequest::new(TransactionType::Deposit, key, "test deposit")
        .debit(buffer.id, amount(debit), Currency::Usdc)
        .credit(user.id, amount(credit), Currency::Usdc)
        .with_user(user_id)
}

#[tokio::test]
async fn test_deposit_updates_user_and_buffer() {
    let ledger = setup_ledger().await;
    let user_id = funded_user(&ledger, dec!(100)).await;

    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(100));
    assert_eq!(balances.fiat_exposure, dec!(0));
    assert_eq!(balances.pending_investment, dec!(0));

    let buffers = ledger.service.get_system_buffers(&ctx()).await.unwrap();
    assert_eq!(buffers.system_buffer_usdc, dec!(100));
}

#[tokio::test]
async fn test_unbalanced_request_is_rejected_without_side_effects() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();
    let request = deposit_request(&ledger, user_id, "unbalanced-1", dec!(100), dec!(99)).await;

    let err = ledger
        .service
        .create_transaction(&ctx(), request)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Unbalanced { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(ledger.store.transaction_count().await, 0);
    assert_eq!(ledger.store.entry_count().await, 0);

    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(0));
}

#[tokio::test]
async fn test_single_entry_request_is_rejected() {
    let ledger = setup_ledger().await;
    let buffer = ledger
        .service
        .get_system_account(&ctx(), AccountType::SystemBufferUsdc)
        .await
        .unwrap();
    let request = CreateTransactionRequest::new(TransactionType::Deposit, "one-leg", "one leg")
        .debit(buffer.id, amount(dec!(10)), Currency::Usdc);

    let err = ledger
        .service
        .create_transaction(&ctx(), request)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_currency_mismatch_is_rejected() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();
    let user = ledger
        .service
        .get_or_create_user_account(&ctx(), user_id, AccountType::UsdcBalance)
        .await
        .unwrap();
    let buffer = ledger
        .service
        .get_system_account(&ctx(), AccountType::SystemBufferFiat)
        .await
        .unwrap();

    // USD legs posted against a USDC account
    let request = CreateTransactionRequest::new(TransactionType::Deposit, "wrong-ccy", "wrong currency")
        .debit(buffer.id, amount(dec!(10)), Currency::Usd)
        .credit(user.id, amount(dec!(10)), Currency::Usd);

    let err = ledger
        .service
        .create_transaction(&ctx(), request)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(ledger.store.transaction_count().await, 0);
}

#[tokio::test]
async fn test_unknown_account_is_not_found() {
    let ledger = setup_ledger().await;
    let buffer = ledger
        .service
        .get_system_account(&ctx(), AccountType::SystemBufferUsdc)
        .await
        .unwrap();
    let request = CreateTransactionRequest::new(TransactionType::Deposit, "ghost", "ghost account")
        .debit(buffer.id, amount(dec!(10)), Currency::Usdc)
        .credit(Uuid::new_v4(), amount(dec!(10)), Currency::Usdc);

    let err = ledger
        .service
        .create_transaction(&ctx(), request)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(ledger.store.transaction_count().await, 0);
}

#[tokio::test]
async fn test_direct_reversal_type_is_rejected() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();
    let mut request = deposit_request(&ledger, user_id, "fake-reversal", dec!(5), dec!(5)).await;
    request.transaction_type = TransactionType::Reversal;

    let err = ledger
        .service
        .create_transaction(&ctx(), request)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_idempotent_replay_returns_original() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();

    let first = ledger
        .service
        .create_transaction(&ctx(), deposit_request(&ledger, user_id, "dep-1", dec!(50), dec!(50)).await)
        .await
        .unwrap();
    assert!(!first.replayed);

    let second = ledger
        .service
        .create_transaction(&ctx(), deposit_request(&ledger, user_id, "dep-1", dec!(50), dec!(50)).await)
        .await
        .unwrap();
    assert!(second.replayed);
    assert_eq!(second.transaction.id, first.transaction.id);
    assert_eq!(second.entries.len(), 2);

    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(50));
    assert_eq!(ledger.store.transaction_count().await, 1);
    assert_eq!(ledger.store.entry_count().await, 2);
}

#[tokio::test]
async fn test_replay_with_different_payload_returns_original() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();

    let first = ledger
        .service
        .create_transaction(&ctx(), deposit_request(&ledger, user_id, "dep-2", dec!(50), dec!(50)).await)
        .await
        .unwrap();
    let second = ledger
        .service
        .create_transaction(&ctx(), deposit_request(&ledger, user_id, "dep-2", dec!(75), dec!(75)).await)
        .await
        .unwrap();

    assert!(second.replayed);
    assert_eq!(second.transaction.id, first.transaction.id);
    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(50));
}

#[tokio::test]
async fn test_concurrent_requests_with_same_key_post_once() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let request = deposit_request(&ledger, user_id, "dep-race", dec!(20), dec!(20)).await;
        let service = Arc::clone(&ledger.service);
        handles.push(tokio::spawn(async move {
            service.create_transaction(&ctx(), request).await
        }));
    }

    let mut ids = Vec::new();
    let mut fresh = 0;
    for handle in handles {
        let receipt = handle.await.unwrap().unwrap();
        if !receipt.replayed {
            fresh += 1;
        }
        ids.push(receipt.transaction.id);
    }

    assert_eq!(fresh, 1);
    assert!(ids.iter().all(|id| *id == ids[0]));
    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(20));
}

#[tokio::test]
async fn test_concurrent_deposits_are_not_lost() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for i in 0..20 {
        let integration = ledger.integration.clone();
        handles.push(tokio::spawn(async move {
            integration
                .credit_user_usdc(
                    &ctx(),
                    user_id,
                    amount(dec!(5)),
                    &format!("chain-tx-{}", i),
                    DepositDetails::default(),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(100));
}

#[tokio::test]
async fn test_withdrawal_beyond_balance_is_rejected() {
    let ledger = setup_ledger().await;
    let user_id = funded_user(&ledger, dec!(30)).await;
    let before = ledger.store.transaction_count().await;

    let err = ledger
        .integration
        .record_withdrawal(&ctx(), user_id, amount(dec!(31)), "wd-1", None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert_eq!(ledger.store.transaction_count().await, before);

    ledger
        .integration
        .record_withdrawal(&ctx(), user_id, amount(dec!(30)), "wd-2", Some("0xabc".to_string()))
        .await
        .unwrap();
    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(0));
}

#[tokio::test]
async fn test_fx_conversion_moves_usdc_into_fiat_exposure() {
    let ledger = setup_ledger().await;
    let user_id = funded_user(&ledger, dec!(100)).await;

    let receipt = ledger
        .integration
        .move_funds_to_fiat_exposure(&ctx(), user_id, amount(dec!(100)), dec!(0.9995), "job-1")
        .await
        .unwrap();
    assert_eq!(receipt.entries.len(), 4);
    assert_eq!(receipt.transaction.transaction_type, TransactionType::Conversion);
    assert_eq!(receipt.transaction.reference_id.as_deref(), Some("job-1"));

    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(0));
    assert_eq!(balances.fiat_exposure, dec!(99.95));
}

#[tokio::test]
async fn test_reserve_and_release() {
    let ledger = setup_ledger().await;
    let user_id = funded_user(&ledger, dec!(100)).await;
    ledger
        .integration
        .move_funds_to_fiat_exposure(&ctx(), user_id, amount(dec!(100)), dec!(1), "job-2")
        .await
        .unwrap();

    ledger
        .integration
        .reserve_for_investment(&ctx(), user_id, amount(dec!(40)), "order-1")
        .await
        .unwrap();
    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.fiat_exposure, dec!(60));
    assert_eq!(balances.pending_investment, dec!(40));

    let release = ledger
        .integration
        .release_reservation(&ctx(), user_id, amount(dec!(40)), "order-1")
        .await
        .unwrap();
    assert_eq!(
        release.transaction.idempotency_key,
        format!("release-{}-order-1", user_id)
    );

    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.fiat_exposure, dec!(100));
    assert_eq!(balances.pending_investment, dec!(0));
}

#[tokio::test]
async fn test_reservation_reference_is_scoped_to_user() {
    let ledger = setup_ledger().await;
    let mut users = Vec::new();
    for job in ["job-a", "job-b"] {
        let user_id = funded_user(&ledger, dec!(100)).await;
        ledger
            .integration
            .move_funds_to_fiat_exposure(&ctx(), user_id, amount(dec!(100)), dec!(1), job)
            .await
            .unwrap();
        users.push(user_id);
    }

    let first = ledger
        .integration
        .reserve_for_investment(&ctx(), users[0], amount(dec!(30)), "order-shared")
        .await
        .unwrap();
    let second = ledger
        .integration
        .reserve_for_investment(&ctx(), users[1], amount(dec!(50)), "order-shared")
        .await
        .unwrap();

    assert!(!second.replayed);
    assert_ne!(first.transaction.id, second.transaction.id);

    let balances = ledger.service.get_user_balances(&ctx(), users[1]).await.unwrap();
    assert_eq!(balances.pending_investment, dec!(50));
    assert_eq!(balances.fiat_exposure, dec!(50));
}

#[tokio::test]
async fn test_reserve_beyond_fiat_exposure_is_rejected() {
    let ledger = setup_ledger().await;
    let user_id = funded_user(&ledger, dec!(100)).await;
    let before = ledger.store.transaction_count().await;

    let err = ledger
        .integration
        .reserve_for_investment(&ctx(), user_id, amount(dec!(50)), "order-2")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert_eq!(ledger.store.transaction_count().await, before);
}

#[tokio::test]
async fn test_reversal_restores_balances() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();
    let receipt = ledger
        .integration
        .credit_user_usdc(&ctx(), user_id, amount(dec!(100)), "dep-rev", DepositDetails::default())
        .await
        .unwrap();
    let original_id = receipt.transaction.id;

    let reversal = ledger
        .service
        .reverse_transaction(&ctx(), original_id, "sent to wrong user")
        .await
        .unwrap();
    assert_eq!(reversal.transaction.transaction_type, TransactionType::Reversal);
    assert_eq!(reversal.transaction.idempotency_key, format!("reversal-{}", original_id));

    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(0));
    let buffers = ledger.service.get_system_buffers(&ctx()).await.unwrap();
    assert_eq!(buffers.system_buffer_usdc, dec!(0));

    let original = ledger.service.get_transaction(&ctx(), original_id).await.unwrap();
    assert_eq!(original.status, TransactionStatus::Reversed);

    let err = ledger
        .service
        .reverse_transaction(&ctx(), original_id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyReversed(id) if id == original_id));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = ledger
        .service
        .reverse_transaction(&ctx(), reversal.transaction.id, "undo the undo")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_reverse_unknown_transaction() {
    let ledger = setup_ledger().await;
    let err = ledger
        .service
        .reverse_transaction(&ctx(), Uuid::new_v4(), "missing")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_reversal_requires_reason() {
    let ledger = setup_ledger().await;
    let user_id = Uuid::new_v4();
    let receipt = ledger
        .integration
        .credit_user_usdc(&ctx(), user_id, amount(dec!(10)), "dep-reason", DepositDetails::default())
        .await
        .unwrap();

    let err = ledger
        .service
        .reverse_transaction(&ctx(), receipt.transaction.id, "  ")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_cancelled_context_interrupts_posting() {
    let ledger = setup_ledger().await;
    let cancelled = OperationContext::new();
    cancelled.cancel();

    let err = ledger
        .integration
        .credit_user_usdc(&cancelled, Uuid::new_v4(), amount(dec!(10)), "dep-cancel", DepositDetails::default())
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Interrupted(_)));
    assert!(err.is_retryable());
    assert_eq!(ledger.store.transaction_count().await, 0);
}

#[tokio::test]
async fn test_facade_requires_reference() {
    let ledger = setup_ledger().await;
    let err = ledger
        .integration
        .credit_user_usdc(&ctx(), Uuid::new_v4(), amount(dec!(10)), "", DepositDetails::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_system_account_type_rejected_for_users() {
    let ledger = setup_ledger().await;
    let err = ledger
        .service
        .get_or_create_user_account(&ctx(), Uuid::new_v4(), AccountType::SystemBufferUsdc)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// =========================================================================
// Shadow mode
// =========================================================================

#[tokio::test]
async fn test_shadow_ledger_mirrors_into_legacy_balances() {
    let ledger = setup_ledger().await;
    let shadow = Arc::new(ShadowLedger::new(
        (*ledger.service).clone(),
        Arc::new(ledger.store.clone()),
        true,
    ));
    let integration = LedgerIntegration::new(shadow.clone());
    let user_id = Uuid::new_v4();

    integration
        .credit_user_usdc(&ctx(), user_id, amount(dec!(100)), "dep-shadow", DepositDetails::default())
        .await
        .unwrap();
    integration
        .move_funds_to_fiat_exposure(&ctx(), user_id, amount(dec!(40)), dec!(1), "job-shadow")
        .await
        .unwrap();

    let legacy = ledger.store.get_legacy_balance(user_id).await.unwrap().unwrap();
    assert_eq!(legacy.pending_deposits, dec!(60));
    assert_eq!(legacy.buying_power, dec!(40));

    // Replays do not mirror twice
    integration
        .credit_user_usdc(&ctx(), user_id, amount(dec!(100)), "dep-shadow", DepositDetails::default())
        .await
        .unwrap();
    let legacy = ledger.store.get_legacy_balance(user_id).await.unwrap().unwrap();
    assert_eq!(legacy.pending_deposits, dec!(60));

    let balances = shadow.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(60));
}

#[tokio::test]
async fn test_shadow_discrepancy_is_an_error_only_in_strict_mode() {
    let ledger = setup_ledger().await;
    let user_id = funded_user(&ledger, dec!(100)).await;

    // Legacy table drifted away from the ledger
    let deltas: LegacyDeltas = [(user_id, (dec!(95), dec!(0)))].into_iter().collect();
    ledger
        .store
        .apply_transaction(Uuid::new_v4(), &deltas)
        .await
        .unwrap();

    let strict = ShadowLedger::new((*ledger.service).clone(), Arc::new(ledger.store.clone()), true);
    let err = strict.get_user_balances(&ctx(), user_id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ShadowDiscrepancy { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let lenient = ShadowLedger::new((*ledger.service).clone(), Arc::new(ledger.store.clone()), false);
    let balances = lenient.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(100));
}

/// Legacy store that fails its first `failures` writes
struct FlakyLegacyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

#[async_trait]
impl LegacyBalanceStore for FlakyLegacyStore {
    async fn get_legacy_balance(&self, user_id: Uuid) -> LedgerResult<Option<LegacyBalance>> {
        self.inner.get_legacy_balance(user_id).await
    }

    async fn apply_transaction(&self, transaction_id: Uuid, deltas: &LegacyDeltas) -> LedgerResult<bool> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Validation("legacy table locked".to_string()));
        }
        self.inner.apply_transaction(transaction_id, deltas).await
    }
}

#[tokio::test]
async fn test_strict_shadow_retry_converges_after_mirror_failure() {
    let ledger = setup_ledger().await;
    let legacy = Arc::new(FlakyLegacyStore {
        inner: ledger.store.clone(),
        failures: AtomicUsize::new(1),
    });
    let shadow = Arc::new(ShadowLedger::new((*ledger.service).clone(), legacy.clone(), true));
    let integration = LedgerIntegration::new(shadow.clone());
    let user_id = Uuid::new_v4();

    let err = integration
        .credit_user_usdc(&ctx(), user_id, amount(dec!(70)), "dep-flaky", DepositDetails::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ShadowMirror(_)));
    assert!(err.is_retryable());

    // The ledger write committed, the legacy row did not
    let balances = ledger.service.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(70));
    assert!(legacy.get_legacy_balance(user_id).await.unwrap().is_none());

    let retry = integration
        .credit_user_usdc(&ctx(), user_id, amount(dec!(70)), "dep-flaky", DepositDetails::default())
        .await
        .unwrap();
    assert!(retry.replayed);
    let row = legacy.get_legacy_balance(user_id).await.unwrap().unwrap();
    assert_eq!(row.pending_deposits, dec!(70));

    // Further retries do not apply it again
    integration
        .credit_user_usdc(&ctx(), user_id, amount(dec!(70)), "dep-flaky", DepositDetails::default())
        .await
        .unwrap();
    let row = legacy.get_legacy_balance(user_id).await.unwrap().unwrap();
    assert_eq!(row.pending_deposits, dec!(70));

    let balances = shadow.get_user_balances(&ctx(), user_id).await.unwrap();
    assert_eq!(balances.usdc_balance, dec!(70));
}
