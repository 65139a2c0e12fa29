mod common;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;

use common::{
    checks_with, ctx, funded_user, reconciliation_service, setup_ledger, FixedTotal, SleepingCheck,
};
use ledger_recon::reconciliation::{ReconciliationConfig, ReportStatus, RunType};
use ledger_recon::{ReconciliationScheduler, SchedulerConfig, SchedulerError};

async fn scheduler(config: SchedulerConfig) -> (Arc<ReconciliationScheduler>, Arc<ledger_recon::ReconciliationService>) {
    let ledger = setup_ledger().await;
    funded_user(&ledger, dec!(250)).await;
    ledger.store.record_deposit(dec!(250)).await;

    let checks = checks_with(
        &ledger.store,
        Arc::new(FixedTotal(dec!(250))),
        Arc::new(FixedTotal(dec!(0))),
    );
    let service = Arc::new(reconciliation_service(
        &ledger.store,
        checks,
        ReconciliationConfig::default(),
    ));
    let scheduler = Arc::new(ReconciliationScheduler::new(Arc::clone(&service), config));
    (scheduler, service)
}

/// Scheduler whose hourly trigger fires after 50ms and runs one check taking
/// `run_time`
async fn slow_scheduler(
    run_time: Duration,
    shutdown_timeout: Duration,
) -> (Arc<ReconciliationScheduler>, Arc<ledger_recon::ReconciliationService>) {
    let ledger = setup_ledger().await;
    let service = Arc::new(reconciliation_service(
        &ledger.store,
        vec![Arc::new(SleepingCheck { delay: run_time })],
        ReconciliationConfig::default(),
    ));
    let scheduler = Arc::new(ReconciliationScheduler::new(
        Arc::clone(&service),
        SchedulerConfig {
            hourly_interval: Duration::from_millis(50),
            daily_interval: Duration::from_secs(3600),
            shutdown_timeout,
        },
    ));
    (scheduler, service)
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (scheduler, _) = scheduler(SchedulerConfig::default()).await;

    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning)));

    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_running());
    assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
}

#[tokio::test]
async fn test_scheduler_can_restart_after_stop() {
    let (scheduler, _) = scheduler(SchedulerConfig::default()).await;

    scheduler.start().unwrap();
    scheduler.stop().await.unwrap();
    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_reports_next_runs() {
    let (scheduler, _) = scheduler(SchedulerConfig::default()).await;
    assert!(!scheduler.status().running);
    assert!(scheduler.status().next_runs.is_empty());

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let status = scheduler.status();
    assert!(status.running);
    assert!(status.next_runs.contains_key(&RunType::Hourly));
    assert!(status.next_runs.contains_key(&RunType::Daily));
    assert!(status.next_runs[&RunType::Daily] > status.next_runs[&RunType::Hourly]);
    assert!(status.last_runs.is_empty());

    scheduler.stop().await.unwrap();
    assert!(scheduler.status().next_runs.is_empty());
}

#[tokio::test]
async fn test_short_interval_triggers_runs() {
    let (scheduler, service) = scheduler(SchedulerConfig {
        hourly_interval: Duration::from_millis(100),
        daily_interval: Duration::from_secs(3600),
        shutdown_timeout: Duration::from_secs(5),
    })
    .await;

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    scheduler.stop().await.unwrap();

    let reports = service.list_reports(50).await.unwrap();
    assert!(reports.len() >= 2);
    assert!(reports.iter().all(|r| r.run_type == RunType::Hourly));
    assert!(reports.iter().all(|r| r.status == ReportStatus::Completed));

    let status = scheduler.status();
    assert!(status.last_runs.contains_key(&RunType::Hourly));
    assert!(!status.last_runs.contains_key(&RunType::Daily));

    // No triggers after stop
    let count = reports.len();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(service.list_reports(50).await.unwrap().len(), count);
}

#[tokio::test]
async fn test_manual_trigger_runs_immediately() {
    let (scheduler, service) = scheduler(SchedulerConfig::default()).await;

    let report = scheduler.trigger_manual(&ctx()).await.unwrap();
    assert_eq!(report.run_type, RunType::Manual);
    assert_eq!(report.status, ReportStatus::Completed);
    assert_eq!(report.passed_checks, 6);

    let status = scheduler.status();
    assert!(status.last_runs.contains_key(&RunType::Manual));
    assert_eq!(service.get_report(report.id).await.unwrap().id, report.id);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_run() {
    let (scheduler, service) =
        slow_scheduler(Duration::from_millis(300), Duration::from_secs(5)).await;

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(service.is_running(RunType::Hourly));

    scheduler.stop().await.unwrap();

    assert!(!service.is_running(RunType::Hourly));
    let reports = service.list_reports(10).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, ReportStatus::Completed);

    let status = scheduler.status();
    assert!(!status.running);
    assert!(status.next_runs.is_empty());
    assert!(status.last_runs.contains_key(&RunType::Hourly));
}

#[tokio::test]
async fn test_stop_gives_up_after_shutdown_timeout() {
    let (scheduler, service) =
        slow_scheduler(Duration::from_millis(800), Duration::from_millis(100)).await;

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let started = std::time::Instant::now();
    scheduler.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(600));

    // The run keeps going detached
    assert!(service.is_running(RunType::Hourly));
    let reports = service.list_reports(10).await.unwrap();
    assert_eq!(reports[0].status, ReportStatus::InProgress);
    assert!(scheduler.status().next_runs.is_empty());

    tokio::time::sleep(Duration::from_millis(1000)).await;

    let reports = service.list_reports(10).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, ReportStatus::Completed);

    // A run finishing after stop does not bring the schedule back
    let status = scheduler.status();
    assert!(!status.running);
    assert!(status.next_runs.is_empty());
}
