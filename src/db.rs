//! Database module
//!
//! Connection and schema checks. Tables are created by the raw SQL files in
//! `migrations/`.

use sqlx::PgPool;

/// Tables the service reads or writes
const REQUIRED_TABLES: [&str; 11] = [
    "ledger_accounts",
    "ledger_transactions",
    "ledger_entries",
    "reconciliation_reports",
    "reconciliation_checks",
    "reconciliation_exceptions",
    "deposits",
    "withdrawals",
    "conversion_jobs",
    "balances",
    "legacy_mirrored_transactions",
];

/// Verify database connectivity
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let mut missing = Vec::new();

    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            missing.push(table);
        }
    }

    if !missing.is_empty() {
        tracing::error!(?missing, "Required tables do not exist. Please run migrations.");
        return Ok(false);
    }

    Ok(true)
}
