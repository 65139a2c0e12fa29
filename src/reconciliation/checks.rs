//! Standard reconciliation checks

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::domain::{AccountType, Currency, EntryDirection, OperationContext, TransactionType};
use crate::ledger::LedgerRepository;

use super::check::{CheckOutcome, ReconciliationCheck};
use super::error::ReconciliationResult;
use super::model::{CheckType, Severity};
use super::providers::{AuxiliaryRecords, BrokerageBalanceProvider, CustodianBalanceProvider};

/// Individual findings listed per check before collapsing into a count
const MAX_LISTED_FINDINGS: usize = 20;

fn push_capped(findings: &mut Vec<String>, items: Vec<String>, what: &str) {
    let total = items.len();
    findings.extend(items.into_iter().take(MAX_LISTED_FINDINGS));
    if total > MAX_LISTED_FINDINGS {
        findings.push(format!("... and {} more {}", total - MAX_LISTED_FINDINGS, what));
    }
}

// =========================================================================
// Ledger consistency
// =========================================================================

/// Double-entry integrity of the ledger itself
pub struct LedgerConsistencyCheck {
    ledger: Arc<dyn LedgerRepository>,
}

impl LedgerConsistencyCheck {
    pub fn new(ledger: Arc<dyn LedgerRepository>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ReconciliationCheck for LedgerConsistencyCheck {
    fn check_type(&self) -> CheckType {
        CheckType::LedgerConsistency
    }

    fn min_severity(&self) -> Severity {
        Severity::Critical
    }

    async fn execute(&self, _ctx: &OperationContext) -> ReconciliationResult<CheckOutcome> {
        let totals = self.ledger.entry_totals_by_currency().await?;
        let mut findings = Vec::new();

        for t in totals.iter().filter(|t| t.debits != t.credits) {
            findings.push(format!(
                "{} entries unbalanced: debits {} credits {}",
                t.currency, t.debits, t.credits
            ));
        }

        // Headline values come from the currency with the widest gap
        let outcome = totals
            .iter()
            .max_by_key(|t| (t.debits - t.credits).abs())
            .map(|t| CheckOutcome::totals(t.credits, t.debits, t.currency.as_str()))
            .unwrap_or_else(|| {
                CheckOutcome::totals(Decimal::ZERO, Decimal::ZERO, Currency::Usdc.as_str())
            });

        let unbalanced = self.ledger.unbalanced_transactions().await?;
        push_capped(
            &mut findings,
            unbalanced
                .iter()
                .map(|u| {
                    format!(
                        "transaction {} unbalanced in {}: debits {} credits {}",
                        u.transaction_id, u.currency, u.debits, u.credits
                    )
                })
                .collect(),
            "unbalanced transactions",
        );

        let orphaned = self.ledger.orphaned_entry_count().await?;
        if orphaned > 0 {
            findings.push(format!("{} orphaned entries", orphaned));
        }

        let drifts = self.ledger.accounts_with_balance_drift().await?;
        push_capped(
            &mut findings,
            drifts
                .iter()
                .map(|d| {
                    format!(
                        "account {} balance {} differs from entry sum {}",
                        d.account_id, d.recorded, d.derived
                    )
                })
                .collect(),
            "drifted accounts",
        );

        Ok(outcome.with_findings(findings))
    }
}

// =========================================================================
// External balances
// =========================================================================

/// Custodial USDC buffer against the on-chain total
pub struct CustodianBalanceCheck {
    ledger: Arc<dyn LedgerRepository>,
    provider: Arc<dyn CustodianBalanceProvider>,
    tolerance: Decimal,
}

impl CustodianBalanceCheck {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        provider: Arc<dyn CustodianBalanceProvider>,
        tolerance: Decimal,
    ) -> Self {
        Self {
            ledger,
            provider,
            tolerance,
        }
    }
}

#[async_trait]
impl ReconciliationCheck for CustodianBalanceCheck {
    fn check_type(&self) -> CheckType {
        CheckType::CustodianBalance
    }

    fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    fn min_severity(&self) -> Severity {
        Severity::High
    }

    async fn execute(&self, ctx: &OperationContext) -> ReconciliationResult<CheckOutcome> {
        let expected = self
            .ledger
            .total_balance_by_account_type(AccountType::SystemBufferUsdc)
            .await?;
        let actual = self.provider.total_custodial_balance(ctx).await?;
        Ok(CheckOutcome::totals(expected, actual, Currency::Usdc.as_str()))
    }
}

/// Users' fiat exposure against brokerage buying power
pub struct BrokerageBalanceCheck {
    ledger: Arc<dyn LedgerRepository>,
    provider: Arc<dyn BrokerageBalanceProvider>,
    tolerance: Decimal,
}

impl BrokerageBalanceCheck {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        provider: Arc<dyn BrokerageBalanceProvider>,
        tolerance: Decimal,
    ) -> Self {
        Self {
            ledger,
            provider,
            tolerance,
        }
    }
}

#[async_trait]
impl ReconciliationCheck for BrokerageBalanceCheck {
    fn check_type(&self) -> CheckType {
        CheckType::BrokerageBalance
    }

    fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    fn min_severity(&self) -> Severity {
        Severity::High
    }

    async fn execute(&self, ctx: &OperationContext) -> ReconciliationResult<CheckOutcome> {
        let expected = self
            .ledger
            .total_balance_by_account_type(AccountType::FiatExposure)
            .await?;
        let actual = self.provider.total_buying_power(ctx).await?;
        Ok(CheckOutcome::totals(expected, actual, Currency::Usd.as_str()))
    }
}

// =========================================================================
// Auxiliary tables
// =========================================================================

/// Completed deposits against USDC credited to users
pub struct DepositTotalsCheck {
    ledger: Arc<dyn LedgerRepository>,
    records: Arc<dyn AuxiliaryRecords>,
}

impl DepositTotalsCheck {
    pub fn new(ledger: Arc<dyn LedgerRepository>, records: Arc<dyn AuxiliaryRecords>) -> Self {
        Self { ledger, records }
    }
}

#[async_trait]
impl ReconciliationCheck for DepositTotalsCheck {
    fn check_type(&self) -> CheckType {
        CheckType::DepositTotals
    }

    fn min_severity(&self) -> Severity {
        Severity::Medium
    }

    async fn execute(&self, _ctx: &OperationContext) -> ReconciliationResult<CheckOutcome> {
        let expected = self.records.completed_deposit_total().await?;
        let actual = self
            .ledger
            .sum_entries(
                TransactionType::Deposit,
                AccountType::UsdcBalance,
                EntryDirection::Credit,
            )
            .await?;
        Ok(CheckOutcome::totals(expected, actual, Currency::Usdc.as_str()))
    }
}

/// Completed withdrawals against USDC debited from users
pub struct WithdrawalTotalsCheck {
    ledger: Arc<dyn LedgerRepository>,
    records: Arc<dyn AuxiliaryRecords>,
}

impl WithdrawalTotalsCheck {
    pub fn new(ledger: Arc<dyn LedgerRepository>, records: Arc<dyn AuxiliaryRecords>) -> Self {
        Self { ledger, records }
    }
}

#[async_trait]
impl ReconciliationCheck for WithdrawalTotalsCheck {
    fn check_type(&self) -> CheckType {
        CheckType::WithdrawalTotals
    }

    fn min_severity(&self) -> Severity {
        Severity::Medium
    }

    async fn execute(&self, _ctx: &OperationContext) -> ReconciliationResult<CheckOutcome> {
        let expected = self.records.completed_withdrawal_total().await?;
        let actual = self
            .ledger
            .sum_entries(
                TransactionType::Withdrawal,
                AccountType::UsdcBalance,
                EntryDirection::Debit,
            )
            .await?;
        Ok(CheckOutcome::totals(expected, actual, Currency::Usdc.as_str()))
    }
}

/// Every completed conversion job must have a ledger conversion
pub struct ConversionCompletenessCheck {
    ledger: Arc<dyn LedgerRepository>,
    records: Arc<dyn AuxiliaryRecords>,
}

impl ConversionCompletenessCheck {
    pub fn new(ledger: Arc<dyn LedgerRepository>, records: Arc<dyn AuxiliaryRecords>) -> Self {
        Self { ledger, records }
    }
}

#[async_trait]
impl ReconciliationCheck for ConversionCompletenessCheck {
    fn check_type(&self) -> CheckType {
        CheckType::ConversionCompleteness
    }

    fn min_severity(&self) -> Severity {
        Severity::High
    }

    async fn execute(&self, _ctx: &OperationContext) -> ReconciliationResult<CheckOutcome> {
        let job_ids = self.records.completed_conversion_job_ids().await?;
        let missing = self
            .ledger
            .missing_references(TransactionType::Conversion, &job_ids)
            .await?;

        // Values are job counts, not money
        let expected = Decimal::from(job_ids.len());
        let actual = Decimal::from(job_ids.len() - missing.len());

        let mut findings = Vec::new();
        push_capped(
            &mut findings,
            missing
                .iter()
                .map(|id| format!("conversion job {} has no ledger transaction", id))
                .collect(),
            "missing conversions",
        );

        Ok(CheckOutcome::totals(expected, actual, "count").with_findings(findings))
    }
}

/// Tolerances for the external balance checks
#[derive(Debug, Clone, Copy)]
pub struct CheckTolerances {
    pub custodian: Decimal,
    pub brokerage: Decimal,
}

impl Default for CheckTolerances {
    fn default() -> Self {
        Self {
            custodian: Decimal::from(10),
            brokerage: Decimal::from(100),
        }
    }
}

/// The production check set, in execution and reporting order
pub fn standard_checks(
    ledger: Arc<dyn LedgerRepository>,
    custodian: Arc<dyn CustodianBalanceProvider>,
    brokerage: Arc<dyn BrokerageBalanceProvider>,
    records: Arc<dyn AuxiliaryRecords>,
    tolerances: CheckTolerances,
) -> Vec<Arc<dyn ReconciliationCheck>> {
    vec![
        Arc::new(LedgerConsistencyCheck::new(Arc::clone(&ledger))),
        Arc::new(CustodianBalanceCheck::new(
            Arc::clone(&ledger),
            custodian,
            tolerances.custodian,
        )),
        Arc::new(BrokerageBalanceCheck::new(
            Arc::clone(&ledger),
            brokerage,
            tolerances.brokerage,
        )),
        Arc::new(DepositTotalsCheck::new(Arc::clone(&ledger), Arc::clone(&records))),
        Arc::new(ConversionCompletenessCheck::new(Arc::clone(&ledger), Arc::clone(&records))),
        Arc::new(WithdrawalTotalsCheck::new(ledger, records)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_capped() {
        let mut findings = Vec::new();
        let items = (0..25).map(|i| format!("item {}", i)).collect();
        push_capped(&mut findings, items, "items");

        assert_eq!(findings.len(), MAX_LISTED_FINDINGS + 1);
        assert_eq!(findings.last().unwrap(), "... and 5 more items");
    }

    #[test]
    fn test_default_tolerances() {
        let tolerances = CheckTolerances::default();
        assert_eq!(tolerances.custodian, Decimal::from(10));
        assert_eq!(tolerances.brokerage, Decimal::from(100));
    }
}
