//! Common test utilities
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use ledger_recon::ledger::{DepositDetails, LedgerService};
use ledger_recon::reconciliation::{
    standard_checks, AlertSink, BrokerageBalanceProvider, CheckOutcome, CheckTolerances, CheckType,
    CustodianBalanceProvider, ReconciliationAlert, ReconciliationCheck, ReconciliationConfig,
    ReconciliationError, ReconciliationResult, Severity,
};
use ledger_recon::{
    Amount, LedgerIntegration, MemoryStore, NoopMetrics, OperationContext, ReconciliationService,
};

/// Ledger wired against a fresh in-memory store
pub struct TestLedger {
    pub store: MemoryStore,
    pub service: Arc<LedgerService>,
    pub integration: LedgerIntegration,
}

pub async fn setup_ledger() -> TestLedger {
    let store = MemoryStore::new();
    let service = Arc::new(LedgerService::new(
        Arc::new(store.clone()),
        Arc::new(NoopMetrics),
    ));
    service
        .provision_system_accounts(&ctx())
        .await
        .expect("Failed to provision system accounts");
    let integration = LedgerIntegration::new(service.clone());

    TestLedger {
        store,
        service,
        integration,
    }
}

pub fn ctx() -> OperationContext {
    OperationContext::new().with_initiator("test")
}

pub fn amount(value: Decimal) -> Amount {
    Amount::new(value).expect("valid amount")
}

/// Credit a new user with USDC and return the user id
pub async fn funded_user(ledger: &TestLedger, usdc: Decimal) -> Uuid {
    let user_id = Uuid::new_v4();
    ledger
        .integration
        .credit_user_usdc(
            &ctx(),
            user_id,
            amount(usdc),
            &format!("dep-{}", user_id),
            DepositDetails::default(),
        )
        .await
        .expect("Failed to fund user");
    user_id
}

// =========================================================================
// Provider and sink stubs
// =========================================================================

/// External source reporting a fixed total
pub struct FixedTotal(pub Decimal);

#[async_trait]
impl CustodianBalanceProvider for FixedTotal {
    async fn total_custodial_balance(&self, _ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        Ok(self.0)
    }
}

#[async_trait]
impl BrokerageBalanceProvider for FixedTotal {
    async fn total_buying_power(&self, _ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        Ok(self.0)
    }
}

/// External source that is down
pub struct FailingProvider;

#[async_trait]
impl CustodianBalanceProvider for FailingProvider {
    async fn total_custodial_balance(&self, _ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        Err(ReconciliationError::Provider("custodian unavailable".to_string()))
    }
}

#[async_trait]
impl BrokerageBalanceProvider for FailingProvider {
    async fn total_buying_power(&self, _ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        Err(ReconciliationError::Provider("brokerage unavailable".to_string()))
    }
}

/// External source that answers after a delay
pub struct SlowProvider {
    pub delay: Duration,
    pub total: Decimal,
}

#[async_trait]
impl CustodianBalanceProvider for SlowProvider {
    async fn total_custodial_balance(&self, _ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        tokio::time::sleep(self.delay).await;
        Ok(self.total)
    }
}

#[async_trait]
impl BrokerageBalanceProvider for SlowProvider {
    async fn total_buying_power(&self, _ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        tokio::time::sleep(self.delay).await;
        Ok(self.total)
    }
}

/// Alert sink that keeps every alert it receives
#[derive(Default)]
pub struct RecordingAlertSink {
    pub alerts: Mutex<Vec<ReconciliationAlert>>,
}

impl RecordingAlertSink {
    pub fn received(&self) -> Vec<ReconciliationAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, alert: &ReconciliationAlert) -> ReconciliationResult<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Alert sink whose webhook answers after a delay
pub struct SlowAlertSink {
    delay: Duration,
    delivered: AtomicUsize,
}

impl SlowAlertSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            delivered: AtomicUsize::new(0),
        }
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertSink for SlowAlertSink {
    async fn send(&self, _alert: &ReconciliationAlert) -> ReconciliationResult<()> {
        tokio::time::sleep(self.delay).await;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Alert sink whose webhook is always down
pub struct FailingAlertSink;

#[async_trait]
impl AlertSink for FailingAlertSink {
    async fn send(&self, _alert: &ReconciliationAlert) -> ReconciliationResult<()> {
        Err(ReconciliationError::Provider("webhook returned 500".to_string()))
    }
}

/// Check that takes `delay` to find nothing wrong
pub struct SleepingCheck {
    pub delay: Duration,
}

#[async_trait]
impl ReconciliationCheck for SleepingCheck {
    fn check_type(&self) -> CheckType {
        CheckType::LedgerConsistency
    }

    fn min_severity(&self) -> Severity {
        Severity::Low
    }

    async fn execute(&self, _ctx: &OperationContext) -> ReconciliationResult<CheckOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(CheckOutcome::totals(Decimal::ZERO, Decimal::ZERO, "USDC"))
    }
}

// =========================================================================
// Reconciliation wiring
// =========================================================================

/// Standard check set over the memory store with the given external sources
pub fn checks_with(
    store: &MemoryStore,
    custodian: Arc<dyn CustodianBalanceProvider>,
    brokerage: Arc<dyn BrokerageBalanceProvider>,
) -> Vec<Arc<dyn ReconciliationCheck>> {
    standard_checks(
        Arc::new(store.clone()),
        custodian,
        brokerage,
        Arc::new(store.clone()),
        CheckTolerances::default(),
    )
}

pub fn reconciliation_service(
    store: &MemoryStore,
    checks: Vec<Arc<dyn ReconciliationCheck>>,
    config: ReconciliationConfig,
) -> ReconciliationService {
    ReconciliationService::new(Arc::new(store.clone()), checks, Arc::new(NoopMetrics), config)
}

// =========================================================================
// PostgreSQL
// =========================================================================

/// Setup test database - apply migrations and truncate every table
pub async fn setup_test_db() -> sqlx::PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            ledger_entries, ledger_transactions, ledger_accounts,
            reconciliation_exceptions, reconciliation_checks, reconciliation_reports,
            deposits, withdrawals, conversion_jobs, balances, legacy_mirrored_transactions
        CASCADE
        "#,
    )
    .execute(&pool)
    .await
    .expect("Failed to clean up DB");

    pool
}
