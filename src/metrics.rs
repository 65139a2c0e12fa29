//! Metrics
//!
//! Components receive an `Arc<dyn MetricsRecorder>` instead of touching
//! process-wide collectors. [`PrometheusMetrics`] owns its own registry, so
//! several instances can coexist in one process (tests build one each).
//!
//! # Metrics
//!
//! - `ledger_transactions_total{transaction_type, outcome}`
//! - `reconciliation_runs_total{run_type, status}`
//! - `reconciliation_run_duration_seconds{run_type}`
//! - `reconciliation_checks_total{check_type, result}`
//! - `reconciliation_check_duration_seconds{check_type}`
//! - `reconciliation_discrepancy_amount{check_type, currency}`
//! - `reconciliation_auto_corrected_total{check_type}`
//! - `reconciliation_alerts_total{severity, outcome}`

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::Duration;

/// Sink for operational measurements. Every method defaults to a no-op.
pub trait MetricsRecorder: Send + Sync {
    fn transaction_recorded(&self, _transaction_type: &str, _replayed: bool) {}

    fn run_started(&self, _run_type: &str) {}

    fn run_finished(&self, _run_type: &str, _status: &str, _duration: Duration) {}

    fn check_executed(&self, _check_type: &str, _passed: bool, _duration: Duration) {}

    fn discrepancy(&self, _check_type: &str, _currency: &str, _difference: Decimal) {}

    fn auto_corrected(&self, _check_type: &str) {}

    fn alert_dispatched(&self, _severity: &str, _delivered: bool) {}
}

/// Recorder that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {}

/// Prometheus-backed recorder
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    transactions: IntCounterVec,
    runs: IntCounterVec,
    run_duration: HistogramVec,
    checks: IntCounterVec,
    check_duration: HistogramVec,
    discrepancy: GaugeVec,
    auto_corrected: IntCounterVec,
    alerts: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let transactions = IntCounterVec::new(
            Opts::new("ledger_transactions_total", "Ledger transactions by type and outcome"),
            &["transaction_type", "outcome"],
        )?;
        registry.register(Box::new(transactions.clone()))?;

        let runs = IntCounterVec::new(
            Opts::new("reconciliation_runs_total", "Reconciliation runs by type and final status"),
            &["run_type", "status"],
        )?;
        registry.register(Box::new(runs.clone()))?;

        let run_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconciliation_run_duration_seconds",
                "Wall-clock duration of reconciliation runs",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["run_type"],
        )?;
        registry.register(Box::new(run_duration.clone()))?;

        let checks = IntCounterVec::new(
            Opts::new("reconciliation_checks_total", "Executed checks by type and result"),
            &["check_type", "result"],
        )?;
        registry.register(Box::new(checks.clone()))?;

        let check_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconciliation_check_duration_seconds",
                "Duration of individual reconciliation checks",
            )
            .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["check_type"],
        )?;
        registry.register(Box::new(check_duration.clone()))?;

        let discrepancy = GaugeVec::new(
            Opts::new(
                "reconciliation_discrepancy_amount",
                "Latest absolute difference reported by each check",
            ),
            &["check_type", "currency"],
        )?;
        registry.register(Box::new(discrepancy.clone()))?;

        let auto_corrected = IntCounterVec::new(
            Opts::new(
                "reconciliation_auto_corrected_total",
                "Low severity exceptions flagged as auto-corrected",
            ),
            &["check_type"],
        )?;
        registry.register(Box::new(auto_corrected.clone()))?;

        let alerts = IntCounterVec::new(
            Opts::new("reconciliation_alerts_total", "Alerts dispatched by severity and outcome"),
            &["severity", "outcome"],
        )?;
        registry.register(Box::new(alerts.clone()))?;

        Ok(Self {
            registry,
            transactions,
            runs,
            run_duration,
            checks,
            check_duration,
            discrepancy,
            auto_corrected,
            alerts,
        })
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsRecorder for PrometheusMetrics {
    fn transaction_recorded(&self, transaction_type: &str, replayed: bool) {
        let outcome = if replayed { "replayed" } else { "committed" };
        self.transactions
            .with_label_values(&[transaction_type, outcome])
            .inc();
    }

    fn run_started(&self, run_type: &str) {
        self.runs.with_label_values(&[run_type, "started"]).inc();
    }

    fn run_finished(&self, run_type: &str, status: &str, duration: Duration) {
        self.runs.with_label_values(&[run_type, status]).inc();
        self.run_duration
            .with_label_values(&[run_type])
            .observe(duration.as_secs_f64());
    }

    fn check_executed(&self, check_type: &str, passed: bool, duration: Duration) {
        let result = if passed { "passed" } else { "failed" };
        self.checks.with_label_values(&[check_type, result]).inc();
        self.check_duration
            .with_label_values(&[check_type])
            .observe(duration.as_secs_f64());
    }

    fn discrepancy(&self, check_type: &str, currency: &str, difference: Decimal) {
        let value = difference.abs().to_f64().unwrap_or(f64::MAX);
        self.discrepancy
            .with_label_values(&[check_type, currency])
            .set(value);
    }

    fn auto_corrected(&self, check_type: &str) {
        self.auto_corrected.with_label_values(&[check_type]).inc();
    }

    fn alert_dispatched(&self, severity: &str, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "failed" };
        self.alerts.with_label_values(&[severity, outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_metrics_creation() {
        let metrics = PrometheusMetrics::new().unwrap();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_independent_registries() {
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();

        a.transaction_recorded("deposit", false);
        a.transaction_recorded("deposit", false);

        assert_eq!(
            a.transactions.with_label_values(&["deposit", "committed"]).get(),
            2
        );
        assert_eq!(
            b.transactions.with_label_values(&["deposit", "committed"]).get(),
            0
        );
    }

    #[test]
    fn test_record_check_and_discrepancy() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.check_executed("custodian_balance", false, Duration::from_millis(20));
        metrics.discrepancy("custodian_balance", "USDC", dec!(-5));

        assert_eq!(
            metrics
                .checks
                .with_label_values(&["custodian_balance", "failed"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .discrepancy
                .with_label_values(&["custodian_balance", "USDC"])
                .get(),
            5.0
        );

        let text = metrics.encode().unwrap();
        assert!(text.contains("reconciliation_checks_total"));
    }

    #[test]
    fn test_noop_metrics() {
        let metrics = NoopMetrics;
        metrics.run_started("hourly");
        metrics.alert_dispatched("high", true);
    }
}
