//! Scheduled Jobs
//!
//! Periodic reconciliation runs. Hourly and daily triggers are independent
//! background tasks; a manual trigger runs on demand in the caller's task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::domain::OperationContext;
use crate::reconciliation::{
    ReconciliationError, ReconciliationReport, ReconciliationService, RunType,
};

// =========================================================================
// Configuration
// =========================================================================

/// Configuration for the reconciliation scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval for hourly runs (default: 1 hour)
    pub hourly_interval: Duration,
    /// Interval for daily runs (default: 24 hours)
    pub daily_interval: Duration,
    /// How long `stop` waits for in-flight runs (default: 30 seconds)
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hourly_interval: Duration::from_secs(3600),
            daily_interval: Duration::from_secs(86_400),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot returned by [`ReconciliationScheduler::status`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub last_runs: BTreeMap<RunType, DateTime<Utc>>,
    pub next_runs: BTreeMap<RunType, DateTime<Utc>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),
}

// =========================================================================
// Scheduler
// =========================================================================

#[derive(Debug, Default)]
struct Timeline {
    last_runs: BTreeMap<RunType, DateTime<Utc>>,
    next_runs: BTreeMap<RunType, DateTime<Utc>>,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Drives [`ReconciliationService`] on a schedule
pub struct ReconciliationScheduler {
    service: Arc<ReconciliationService>,
    config: SchedulerConfig,
    running: Mutex<Option<Running>>,
    timeline: Arc<Mutex<Timeline>>,
}

impl ReconciliationScheduler {
    pub fn new(service: Arc<ReconciliationService>, config: SchedulerConfig) -> Self {
        Self {
            service,
            config,
            running: Mutex::new(None),
            timeline: Arc::new(Mutex::new(Timeline::default())),
        }
    }

    /// Start the hourly and daily triggers in the background
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        for (run_type, period) in [
            (RunType::Hourly, self.config.hourly_interval),
            (RunType::Daily, self.config.daily_interval),
        ] {
            tracker.spawn(trigger_loop(
                Arc::clone(&self.service),
                run_type,
                period,
                cancel.clone(),
                Arc::clone(&self.timeline),
            ));
        }

        tracing::info!(
            hourly_interval_secs = self.config.hourly_interval.as_secs(),
            daily_interval_secs = self.config.daily_interval.as_secs(),
            "Reconciliation scheduler started"
        );

        *running = Some(Running { cancel, tracker });
        Ok(())
    }

    /// Stop the triggers and wait for in-flight runs and their alerts, up to
    /// the shutdown timeout. A run still going after that keeps running
    /// detached.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let Running { cancel, tracker } = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        cancel.cancel();
        tracker.close();

        let drain = async {
            tracker.wait().await;
            self.service.flush_alerts().await;
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => tracing::info!("Reconciliation scheduler stopped"),
            Err(_) => tracing::warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                in_flight = tracker.len(),
                "Reconciliation scheduler stop timed out; in-flight runs left to finish"
            ),
        }

        self.timeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_runs
            .clear();
        Ok(())
    }

    /// Run a manual reconciliation now
    pub async fn trigger_manual(
        &self,
        ctx: &OperationContext,
    ) -> Result<ReconciliationReport, SchedulerError> {
        tracing::info!(correlation_id = %ctx.correlation_id, "Manual reconciliation triggered");
        let triggered_at = Utc::now();
        let report = self.service.run_reconciliation(ctx, RunType::Manual).await?;
        record_last_run(&self.timeline, RunType::Manual, triggered_at);
        Ok(report)
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        let timeline = self.timeline.lock().unwrap_or_else(|e| e.into_inner());

        SchedulerStatus {
            running,
            last_runs: timeline.last_runs.clone(),
            next_runs: timeline.next_runs.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status().running
    }
}

fn record_last_run(timeline: &Mutex<Timeline>, run_type: RunType, at: DateTime<Utc>) {
    timeline
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .last_runs
        .insert(run_type, at);
}

fn record_next_run(timeline: &Mutex<Timeline>, run_type: RunType, period: Duration) {
    let next = chrono::Duration::from_std(period)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d));
    if let Some(next) = next {
        timeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_runs
            .insert(run_type, next);
    }
}

/// One trigger. The first run fires one period after start. Cancellation is
/// only observed between runs, so a run in progress always completes. Once
/// cancelled the trigger no longer touches the timeline.
async fn trigger_loop(
    service: Arc<ReconciliationService>,
    run_type: RunType,
    period: Duration,
    cancel: CancellationToken,
    timeline: Arc<Mutex<Timeline>>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !cancel.is_cancelled() {
        record_next_run(&timeline, run_type, period);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let ctx = OperationContext::new().with_initiator(format!("scheduler:{}", run_type));
        let triggered_at = Utc::now();

        match service.run_reconciliation(&ctx, run_type).await {
            Ok(report) => {
                tracing::debug!(
                    report_id = %report.id,
                    run_type = %run_type,
                    status = %report.status,
                    "Scheduled reconciliation finished"
                );
                record_last_run(&timeline, run_type, triggered_at);
            }
            Err(ReconciliationError::RunInProgress(_)) => tracing::warn!(
                run_type = %run_type,
                "Previous run still in progress, skipping tick"
            ),
            Err(e) => tracing::error!(
                run_type = %run_type,
                error = %e,
                "Scheduled reconciliation failed"
            ),
        }
    }

    tracing::debug!(run_type = %run_type, "Reconciliation trigger stopped");
}

// =========================================================================
// Tests
// =========================================================================
