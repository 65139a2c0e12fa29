//! Check contract
//!
//! A check re-derives one total from the ledger, fetches the matching total
//! from its source of record, and reports both. Checks never write.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::OperationContext;

use super::error::ReconciliationResult;
use super::model::{CheckType, Severity};

/// Values produced by one check execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub expected: Decimal,
    pub actual: Decimal,
    pub currency: String,
    /// Structural violations; any finding fails the check
    pub findings: Vec<String>,
}

impl CheckOutcome {
    pub fn totals(expected: Decimal, actual: Decimal, currency: impl Into<String>) -> Self {
        Self {
            expected,
            actual,
            currency: currency.into(),
            findings: Vec::new(),
        }
    }

    pub fn with_findings(mut self, findings: Vec<String>) -> Self {
        self.findings.extend(findings);
        self
    }

    pub fn difference(&self) -> Decimal {
        self.actual - self.expected
    }

    pub fn passes(&self, tolerance: Decimal) -> bool {
        self.difference().abs() <= tolerance && self.findings.is_empty()
    }
}

#[async_trait]
pub trait ReconciliationCheck: Send + Sync {
    fn check_type(&self) -> CheckType;

    /// Largest absolute difference still counted as a pass
    fn tolerance(&self) -> Decimal {
        Decimal::ZERO
    }

    /// Lowest severity an exception raised by this check may carry
    fn min_severity(&self) -> Severity;

    async fn execute(&self, ctx: &OperationContext) -> ReconciliationResult<CheckOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_outcome_within_tolerance() {
        let outcome = CheckOutcome::totals(dec!(10000), dec!(9995), "USDC");
        assert_eq!(outcome.difference(), dec!(-5));
        assert!(outcome.passes(dec!(10)));
        assert!(!outcome.passes(dec!(4.99)));
    }

    #[test]
    fn test_findings_fail_even_when_totals_match() {
        let outcome = CheckOutcome::totals(dec!(100), dec!(100), "USD")
            .with_findings(vec!["1 orphaned entries".to_string()]);
        assert!(!outcome.passes(dec!(1000)));
    }
}
