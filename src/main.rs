//! ledger_recon - Custody ledger and reconciliation daemon
//!
//! Provisions the house accounts, runs the hourly and daily reconciliation
//! schedule, and serves health and metrics endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledger_recon::api::{self, OpsState};
use ledger_recon::ledger::{LedgerService, PgLedgerRepository};
use ledger_recon::reconciliation::{
    standard_checks, AlertSink, BrokerageBalanceProvider, CustodianBalanceProvider,
    HttpTotalProvider, LogAlertSink, PgAuxiliaryRecords, PgReconciliationRepository,
    ReconciliationService, UnconfiguredProvider, WebhookAlertSink,
};
use ledger_recon::{db, Config, OperationContext, PrometheusMetrics, ReconciliationScheduler};

/// Initialize tracing/logging
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ledger_recon=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn custodian_provider(config: &Config) -> anyhow::Result<Arc<dyn CustodianBalanceProvider>> {
    Ok(match &config.custodian_balance_url {
        Some(url) => Arc::new(HttpTotalProvider::new("custodian", url, config.provider_timeout)?),
        None => {
            tracing::warn!("CUSTODIAN_BALANCE_URL not set, custodian check will fail");
            Arc::new(UnconfiguredProvider::new("custodian"))
        }
    })
}

fn brokerage_provider(config: &Config) -> anyhow::Result<Arc<dyn BrokerageBalanceProvider>> {
    Ok(match &config.brokerage_balance_url {
        Some(url) => Arc::new(HttpTotalProvider::new("brokerage", url, config.provider_timeout)?),
        None => {
            tracing::warn!("BROKERAGE_BALANCE_URL not set, brokerage check will fail");
            Arc::new(UnconfiguredProvider::new("brokerage"))
        }
    })
}

fn alert_sink(config: &Config) -> anyhow::Result<Arc<dyn AlertSink>> {
    Ok(match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(url, config.provider_timeout)?),
        None => Arc::new(LogAlertSink),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.is_production());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!(environment = %config.environment, "Starting ledger_recon");
    tracing::info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    db::verify_connection(&pool).await?;
    if !db::check_schema(&pool).await? {
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }
    tracing::info!("Database connected successfully");

    let metrics = Arc::new(PrometheusMetrics::new()?);

    // Ledger
    let ledger_repository = Arc::new(PgLedgerRepository::new(pool.clone()));
    let ledger = LedgerService::new(ledger_repository.clone(), metrics.clone());
    let ctx = OperationContext::new().with_initiator("startup");
    ledger.provision_system_accounts(&ctx).await?;

    // Reconciliation
    let checks = standard_checks(
        ledger_repository,
        custodian_provider(&config)?,
        brokerage_provider(&config)?,
        Arc::new(PgAuxiliaryRecords::new(pool.clone())),
        config.tolerances(),
    );
    let service = ReconciliationService::new(
        Arc::new(PgReconciliationRepository::new(pool.clone())),
        checks,
        metrics.clone(),
        config.reconciliation(),
    )
    .with_alert_sink(alert_sink(&config)?);

    let scheduler = Arc::new(ReconciliationScheduler::new(
        Arc::new(service),
        config.scheduler(),
    ));
    scheduler.start()?;

    let app = api::create_router(OpsState {
        metrics,
        scheduler: Arc::clone(&scheduler),
    });

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Server shutting down...");
    scheduler.stop().await?;
    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
