//! External totals consumed by the checks
//!
//! Providers answer one question each. The HTTP adapter reads
//! `{"total": "<decimal>"}` from a configured URL; the auxiliary records come
//! from the deposit, withdrawal and conversion tables owned by other services.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::PgPool;
use std::time::Duration;

use crate::domain::OperationContext;

use super::error::{ReconciliationError, ReconciliationResult};

#[async_trait]
pub trait CustodianBalanceProvider: Send + Sync {
    /// Sum of USDC held across custodial wallets
    async fn total_custodial_balance(&self, ctx: &OperationContext) -> ReconciliationResult<Decimal>;
}

#[async_trait]
pub trait BrokerageBalanceProvider: Send + Sync {
    /// Sum of USD buying power across brokerage accounts
    async fn total_buying_power(&self, ctx: &OperationContext) -> ReconciliationResult<Decimal>;
}

#[async_trait]
pub trait AuxiliaryRecords: Send + Sync {
    async fn completed_deposit_total(&self) -> ReconciliationResult<Decimal>;

    async fn completed_withdrawal_total(&self) -> ReconciliationResult<Decimal>;

    /// Ids of conversion jobs that finished on the provider side
    async fn completed_conversion_job_ids(&self) -> ReconciliationResult<Vec<String>>;
}

// =========================================================================
// HTTP provider
// =========================================================================

#[derive(Debug, Deserialize)]
struct TotalResponse {
    total: Decimal,
}

/// Reads a single total over HTTP
#[derive(Debug, Clone)]
pub struct HttpTotalProvider {
    name: &'static str,
    url: String,
    client: Client,
}

impl HttpTotalProvider {
    pub fn new(name: &'static str, url: impl Into<String>, timeout: Duration) -> ReconciliationResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReconciliationError::Provider(format!("{}: failed to build client: {}", name, e)))?;

        Ok(Self {
            name,
            url: url.into(),
            client,
        })
    }

    async fn fetch_total(&self, ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        let response = self
            .client
            .get(&self.url)
            .header("x-correlation-id", ctx.correlation_id.to_string())
            .send()
            .await
            .map_err(|e| ReconciliationError::Provider(format!("{} request failed: {}", self.name, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReconciliationError::Provider(format!(
                "{} returned {}: {}",
                self.name, status, body
            )));
        }

        let body: TotalResponse = response.json().await.map_err(|e| {
            ReconciliationError::Provider(format!("{} returned an unreadable body: {}", self.name, e))
        })?;

        tracing::debug!(provider = self.name, total = %body.total, "Fetched external total");
        Ok(body.total)
    }
}

#[async_trait]
impl CustodianBalanceProvider for HttpTotalProvider {
    async fn total_custodial_balance(&self, ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        ctx.run(self.fetch_total(ctx)).await
    }
}

#[async_trait]
impl BrokerageBalanceProvider for HttpTotalProvider {
    async fn total_buying_power(&self, ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        ctx.run(self.fetch_total(ctx)).await
    }
}

/// Stand-in when no endpoint is configured; every call fails, so the check
/// shows up as failed rather than silently passing.
#[derive(Debug, Clone)]
pub struct UnconfiguredProvider {
    name: &'static str,
}

impl UnconfiguredProvider {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    fn error(&self) -> ReconciliationError {
        ReconciliationError::Provider(format!("{} endpoint is not configured", self.name))
    }
}

#[async_trait]
impl CustodianBalanceProvider for UnconfiguredProvider {
    async fn total_custodial_balance(&self, _ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        Err(self.error())
    }
}

#[async_trait]
impl BrokerageBalanceProvider for UnconfiguredProvider {
    async fn total_buying_power(&self, _ctx: &OperationContext) -> ReconciliationResult<Decimal> {
        Err(self.error())
    }
}

// =========================================================================
// Auxiliary tables
// =========================================================================

#[derive(Debug, Clone)]
pub struct PgAuxiliaryRecords {
    pool: PgPool,
}

impl PgAuxiliaryRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuxiliaryRecords for PgAuxiliaryRecords {
    async fn completed_deposit_total(&self) -> ReconciliationResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0) FROM deposits WHERE status = 'completed'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn completed_withdrawal_total(&self) -> ReconciliationResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0) FROM withdrawals WHERE status = 'completed'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn completed_conversion_job_ids(&self) -> ReconciliationResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id::text FROM conversion_jobs WHERE status = 'completed' ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_total_response_accepts_string_and_number() {
        let from_str: TotalResponse = serde_json::from_str(r#"{"total": "10000.50"}"#).unwrap();
        assert_eq!(from_str.total, dec!(10000.50));

        let from_num: TotalResponse = serde_json::from_str(r#"{"total": 42}"#).unwrap();
        assert_eq!(from_num.total, dec!(42));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails() {
        let provider = UnconfiguredProvider::new("custodian");
        let err = provider
            .total_custodial_balance(&OperationContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
