//! PostgreSQL ledger repository
//!
//! Every write runs inside one SQL transaction. The transaction header is
//! inserted first with `ON CONFLICT (idempotency_key) DO NOTHING`; a concurrent
//! duplicate blocks on the unique index and then sees no returned row, which is
//! turned into a replay of the stored transaction. Referenced account rows are
//! locked `FOR UPDATE` in id order before balances move.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::transaction::build_reversal;
use crate::domain::{
    Account, AccountType, Balance, Currency, Entry, EntryDirection, LedgerError, LedgerResult,
    Transaction, TransactionMetadata, TransactionReceipt, TransactionType,
};

use super::posting::{check_reversible, plan_postings};
use super::repository::{
    BalanceDrift, CurrencyEntryTotals, LedgerRepository, UnbalancedTransaction,
};

const ACCOUNT_COLUMNS: &str = "id, user_id, account_type, currency, balance, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, transaction_type, reference_id, reference_type, user_id, \
     idempotency_key, status, description, metadata, request_hash, created_at, updated_at";

const ENTRY_COLUMNS: &str =
    "id, transaction_id, account_id, direction, amount, currency, description, created_at";

/// Ledger repository backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Write helpers (run inside an open SQL transaction)
    // =========================================================================

    /// Insert the header unless the key exists. Returns false on conflict.
    async fn insert_transaction(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        transaction: &Transaction,
    ) -> LedgerResult<bool> {
        let metadata = transaction
            .metadata
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_transactions (
                id, transaction_type, reference_id, reference_type, user_id,
                idempotency_key, status, description, metadata, request_hash,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.transaction_type.as_str())
        .bind(&transaction.reference_id)
        .bind(&transaction.reference_type)
        .bind(transaction.user_id)
        .bind(&transaction.idempotency_key)
        .bind(transaction.status.as_str())
        .bind(&transaction.description)
        .bind(metadata)
        .bind(&transaction.request_hash)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(inserted.is_some())
    }

    /// Lock the referenced accounts, apply the posting rules, then write
    /// entries and balances.
    async fn post_entries(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        entries: &[Entry],
    ) -> LedgerResult<()> {
        let mut account_ids: Vec<Uuid> = entries.iter().map(|e| e.account_id).collect();
        account_ids.sort();
        account_ids.dedup();

        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(&account_ids)
        .fetch_all(&mut **tx)
        .await?;

        let accounts: HashMap<Uuid, Account> = rows
            .iter()
            .map(account_from_row)
            .collect::<LedgerResult<Vec<_>>>()?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();

        let updates = plan_postings(&accounts, entries)?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO ledger_entries (
                    id, transaction_id, account_id, direction, amount, currency, description, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(entry.id)
            .bind(entry.transaction_id)
            .bind(entry.account_id)
            .bind(entry.direction.as_str())
            .bind(entry.amount)
            .bind(entry.currency.as_str())
            .bind(&entry.description)
            .bind(entry.created_at)
            .execute(&mut **tx)
            .await?;
        }

        for update in updates {
            sqlx::query(
                r#"
                UPDATE ledger_accounts
                SET balance = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(update.account_id)
            .bind(update.new_balance.value())
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    async fn replay(&self, idempotency_key: &str) -> LedgerResult<TransactionReceipt> {
        let transaction = self
            .find_transaction_by_idempotency_key(idempotency_key)
            .await?
            .ok_or_else(|| {
                LedgerError::Corrupted(format!(
                    "idempotency key '{}' conflicted but no transaction is stored",
                    idempotency_key
                ))
            })?;
        let entries = self.get_entries(transaction.id).await?;

        Ok(TransactionReceipt {
            transaction,
            entries,
            replayed: true,
        })
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn get_or_create_account(
        &self,
        user_id: Option<Uuid>,
        account_type: AccountType,
    ) -> LedgerResult<Account> {
        let candidate = Account::open(user_id, account_type)?;

        // Unique indexes on (user_id, account_type) and on account_type for
        // house accounts make concurrent creation collapse onto one row
        sqlx::query(
            r#"
            INSERT INTO ledger_accounts (id, user_id, account_type, currency, balance)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(candidate.id)
        .bind(user_id)
        .bind(account_type.as_str())
        .bind(account_type.currency().as_str())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_accounts \
             WHERE user_id IS NOT DISTINCT FROM $1 AND account_type = $2",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .bind(account_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        account_from_row(&row)
    }

    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {} FROM ledger_accounts WHERE id = $1", ACCOUNT_COLUMNS))
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn get_user_accounts(&self, user_id: Uuid) -> LedgerResult<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_accounts WHERE user_id = $1 ORDER BY account_type",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn get_system_accounts(&self) -> LedgerResult<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_accounts WHERE user_id IS NULL ORDER BY account_type",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_transactions WHERE idempotency_key = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> LedgerResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn get_entries(&self, transaction_id: Uuid) -> LedgerResult<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE transaction_id = $1 ORDER BY created_at, id",
            ENTRY_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn commit_transaction(
        &self,
        transaction: Transaction,
        entries: Vec<Entry>,
    ) -> LedgerResult<TransactionReceipt> {
        let mut tx = self.pool.begin().await?;

        if !Self::insert_transaction(&mut tx, &transaction).await? {
            tx.rollback().await?;
            return self.replay(&transaction.idempotency_key).await;
        }

        Self::post_entries(&mut tx, &entries).await?;
        tx.commit().await?;

        Ok(TransactionReceipt {
            transaction,
            entries,
            replayed: false,
        })
    }

    async fn commit_reversal(&self, transaction_id: Uuid, reason: &str) -> LedgerResult<TransactionReceipt> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_transactions WHERE id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        let original = transaction_from_row(&row)?;

        check_reversible(&original)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE transaction_id = $1 ORDER BY created_at, id",
            ENTRY_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_all(&mut *tx)
        .await?;
        let entries = rows.iter().map(entry_from_row).collect::<LedgerResult<Vec<_>>>()?;

        let (reversal, mirrored) = build_reversal(&original, &entries, reason);
        if !Self::insert_transaction(&mut tx, &reversal).await? {
            return Err(LedgerError::AlreadyReversed(transaction_id));
        }

        Self::post_entries(&mut tx, &mirrored).await?;

        sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = 'reversed', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TransactionReceipt {
            transaction: reversal,
            entries: mirrored,
            replayed: false,
        })
    }

    async fn entry_totals_by_currency(&self) -> LedgerResult<Vec<CurrencyEntryTotals>> {
        let rows: Vec<(String, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT
                currency,
                COALESCE(SUM(amount) FILTER (WHERE direction = 'debit'), 0),
                COALESCE(SUM(amount) FILTER (WHERE direction = 'credit'), 0)
            FROM ledger_entries
            GROUP BY currency
            ORDER BY currency
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(currency, debits, credits)| {
                Ok(CurrencyEntryTotals {
                    currency: parse_currency(&currency)?,
                    debits,
                    credits,
                })
            })
            .collect()
    }

    async fn unbalanced_transactions(&self) -> LedgerResult<Vec<UnbalancedTransaction>> {
        let rows: Vec<(Uuid, String, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT
                transaction_id,
                currency,
                COALESCE(SUM(amount) FILTER (WHERE direction = 'debit'), 0) AS debits,
                COALESCE(SUM(amount) FILTER (WHERE direction = 'credit'), 0) AS credits
            FROM ledger_entries
            GROUP BY transaction_id, currency
            HAVING COALESCE(SUM(amount) FILTER (WHERE direction = 'debit'), 0)
                <> COALESCE(SUM(amount) FILTER (WHERE direction = 'credit'), 0)
            ORDER BY transaction_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(transaction_id, currency, debits, credits)| {
                Ok(UnbalancedTransaction {
                    transaction_id,
                    currency: parse_currency(&currency)?,
                    debits,
                    credits,
                })
            })
            .collect()
    }

    async fn orphaned_entry_count(&self) -> LedgerResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM ledger_entries e
            LEFT JOIN ledger_transactions t ON t.id = e.transaction_id
            LEFT JOIN ledger_accounts a ON a.id = e.account_id
            WHERE t.id IS NULL OR a.id IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn accounts_with_balance_drift(&self) -> LedgerResult<Vec<BalanceDrift>> {
        // House accounts (no user) are debit-normal, user accounts credit-normal
        let rows: Vec<(Uuid, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT a.id, a.balance, COALESCE(d.derived, 0)
            FROM ledger_accounts a
            LEFT JOIN (
                SELECT
                    e.account_id,
                    SUM(
                        CASE WHEN (e.direction = 'credit') = (acc.user_id IS NOT NULL)
                             THEN e.amount ELSE -e.amount END
                    ) AS derived
                FROM ledger_entries e
                JOIN ledger_accounts acc ON acc.id = e.account_id
                GROUP BY e.account_id
            ) d ON d.account_id = a.id
            WHERE a.balance <> COALESCE(d.derived, 0)
            ORDER BY a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(account_id, recorded, derived)| BalanceDrift {
                account_id,
                recorded,
                derived,
            })
            .collect())
    }

    async fn total_balance_by_account_type(&self, account_type: AccountType) -> LedgerResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(balance), 0)
            FROM ledger_accounts
            WHERE account_type = $1
            "#,
        )
        .bind(account_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn sum_entries(
        &self,
        transaction_type: TransactionType,
        account_type: AccountType,
        direction: EntryDirection,
    ) -> LedgerResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(e.amount), 0)
            FROM ledger_entries e
            JOIN ledger_transactions t ON t.id = e.transaction_id
            JOIN ledger_accounts a ON a.id = e.account_id
            WHERE t.transaction_type = $1
              AND t.status = 'completed'
              AND a.account_type = $2
              AND e.direction = $3
            "#,
        )
        .bind(transaction_type.as_str())
        .bind(account_type.as_str())
        .bind(direction.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn missing_references(
        &self,
        transaction_type: TransactionType,
        reference_ids: &[String],
    ) -> LedgerResult<Vec<String>> {
        if reference_ids.is_empty() {
            return Ok(Vec::new());
        }

        let missing: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.reference_id
            FROM UNNEST($1::text[]) AS r(reference_id)
            WHERE NOT EXISTS (
                SELECT 1 FROM ledger_transactions t
                WHERE t.reference_id = r.reference_id AND t.transaction_type = $2
            )
            ORDER BY r.reference_id
            "#,
        )
        .bind(reference_ids)
        .bind(transaction_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(missing)
    }
}

// =========================================================================
// Row mapping
// =========================================================================

fn parse_currency(value: &str) -> LedgerResult<Currency> {
    value
        .parse()
        .map_err(|_| LedgerError::Corrupted(format!("unknown currency '{}'", value)))
}

fn account_from_row(row: &PgRow) -> LedgerResult<Account> {
    let account_type: String = row.try_get("account_type")?;
    let currency: String = row.try_get("currency")?;
    let balance: Decimal = row.try_get("balance")?;

    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        account_type: account_type.parse()?,
        balance: Balance::new(balance),
        currency: parse_currency(&currency)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> LedgerResult<Transaction> {
    let transaction_type: String = row.try_get("transaction_type")?;
    let status: String = row.try_get("status")?;
    let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
    let metadata = metadata
        .map(serde_json::from_value::<TransactionMetadata>)
        .transpose()?;

    Ok(Transaction {
        id: row.try_get("id")?,
        transaction_type: transaction_type.parse()?,
        reference_id: row.try_get("reference_id")?,
        reference_type: row.try_get("reference_type")?,
        user_id: row.try_get("user_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: status.parse()?,
        description: row.try_get("description")?,
        metadata,
        request_hash: row.try_get("request_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> LedgerResult<Entry> {
    let direction: String = row.try_get("direction")?;
    let currency: String = row.try_get("currency")?;

    Ok(Entry {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        account_id: row.try_get("account_id")?,
        direction: direction.parse()?,
        amount: row.try_get("amount")?,
        currency: parse_currency(&currency)?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}
