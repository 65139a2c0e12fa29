//! Alert dispatch for High and Critical exceptions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use super::error::{ReconciliationError, ReconciliationResult};
use super::model::{CheckType, ReconciliationException, Severity};

/// Payload sent to the alert sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationAlert {
    pub severity: Severity,
    pub check_type: CheckType,
    pub description: String,
    pub expected: Decimal,
    pub actual: Decimal,
    pub difference: Decimal,
    pub currency: String,
    pub report_id: Uuid,
    pub exception_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl From<&ReconciliationException> for ReconciliationAlert {
    fn from(exception: &ReconciliationException) -> Self {
        Self {
            severity: exception.severity,
            check_type: exception.check_type,
            description: exception.description.clone(),
            expected: exception.expected,
            actual: exception.actual,
            difference: exception.difference,
            currency: exception.currency.clone(),
            report_id: exception.report_id,
            exception_id: exception.id,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &ReconciliationAlert) -> ReconciliationResult<()>;
}

/// Posts alerts as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    url: String,
    client: Client,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ReconciliationResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReconciliationError::Provider(format!("failed to build webhook client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &ReconciliationAlert) -> ReconciliationResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| ReconciliationError::Provider(format!("alert webhook failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ReconciliationError::Provider(format!(
                "alert webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &ReconciliationAlert) -> ReconciliationResult<()> {
        tracing::error!(
            severity = %alert.severity,
            check_type = %alert.check_type,
            report_id = %alert.report_id,
            exception_id = %alert.exception_id,
            expected = %alert.expected,
            actual = %alert.actual,
            difference = %alert.difference,
            currency = %alert.currency,
            "RECONCILIATION ALERT: {}",
            alert.description
        );
        Ok(())
    }
}
