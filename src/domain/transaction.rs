//! Transactions and entries
//!
//! A transaction groups two or more entries that net to zero within each
//! currency. Requests are validated here, before any storage is touched.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::amount::{Amount, Currency, MAX_SCALE};
use super::error::LedgerError;

/// Longest idempotency key accepted (matches the column width)
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

// =========================================================================
// Enums
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Conversion,
    Investment,
    Reservation,
    Release,
    Reversal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Conversion => "conversion",
            TransactionType::Investment => "investment",
            TransactionType::Reservation => "reservation",
            TransactionType::Release => "release",
            TransactionType::Reversal => "reversal",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "conversion" => Ok(TransactionType::Conversion),
            "investment" => Ok(TransactionType::Investment),
            "reservation" => Ok(TransactionType::Reservation),
            "release" => Ok(TransactionType::Release),
            "reversal" => Ok(TransactionType::Reversal),
            other => Err(LedgerError::Corrupted(format!("unknown transaction type '{}'", other))),
        }
    }
}

/// Transaction lifecycle: `pending -> completed -> reversed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Reversed => "reversed",
        }
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Pending, TransactionStatus::Completed)
                | (TransactionStatus::Completed, TransactionStatus::Reversed)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "reversed" => Ok(TransactionStatus::Reversed),
            other => Err(LedgerError::Corrupted(format!("unknown transaction status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryDirection {
    Debit,
    Credit,
}

impl EntryDirection {
    pub fn flip(&self) -> EntryDirection {
        match self {
            EntryDirection::Debit => EntryDirection::Credit,
            EntryDirection::Credit => EntryDirection::Debit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryDirection::Debit => "debit",
            EntryDirection::Credit => "credit",
        }
    }
}

impl fmt::Display for EntryDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryDirection {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(EntryDirection::Debit),
            "credit" => Ok(EntryDirection::Credit),
            other => Err(LedgerError::Corrupted(format!("unknown entry direction '{}'", other))),
        }
    }
}

// =========================================================================
// Metadata
// =========================================================================

/// Typed metadata, one variant per transaction type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionMetadata {
    Deposit {
        chain: Option<String>,
        tx_hash: Option<String>,
    },
    Withdrawal {
        destination: Option<String>,
    },
    /// `rate` is quote (`to_currency`) units per base (`from_currency`) unit
    Conversion {
        from_currency: Currency,
        to_currency: Currency,
        rate: Decimal,
    },
    Investment {
        order_id: String,
    },
    Reservation {
        reference_id: String,
    },
    Release {
        reference_id: String,
    },
    Reversal {
        original_transaction_id: Uuid,
        reason: String,
    },
}

impl TransactionMetadata {
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            TransactionMetadata::Deposit { .. } => TransactionType::Deposit,
            TransactionMetadata::Withdrawal { .. } => TransactionType::Withdrawal,
            TransactionMetadata::Conversion { .. } => TransactionType::Conversion,
            TransactionMetadata::Investment { .. } => TransactionType::Investment,
            TransactionMetadata::Reservation { .. } => TransactionType::Reservation,
            TransactionMetadata::Release { .. } => TransactionType::Release,
            TransactionMetadata::Reversal { .. } => TransactionType::Reversal,
        }
    }
}

// =========================================================================
// Records
// =========================================================================

/// A persisted transaction header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub transaction_type: TransactionType,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub user_id: Option<Uuid>,
    pub idempotency_key: String,
    pub status: TransactionStatus,
    pub description: String,
    pub metadata: Option<TransactionMetadata>,
    /// SHA-256 of the request payload, used to spot key reuse with different content
    pub request_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted entry. Amounts are read back as raw decimals so that damaged
/// rows can still be inspected by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    pub direction: EntryDirection,
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of a create or reverse call
#[derive(Debug, Clone)]
pub struct TransactionReceipt {
    pub transaction: Transaction,
    pub entries: Vec<Entry>,
    /// True when the idempotency key already existed and nothing was written
    pub replayed: bool,
}

// =========================================================================
// Requests
// =========================================================================

/// One leg of a transaction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub account_id: Uuid,
    pub direction: EntryDirection,
    pub amount: Amount,
    pub currency: Currency,
    pub description: Option<String>,
}

impl NewEntry {
    pub fn debit(account_id: Uuid, amount: Amount, currency: Currency) -> Self {
        Self {
            account_id,
            direction: EntryDirection::Debit,
            amount,
            currency,
            description: None,
        }
    }

    pub fn credit(account_id: Uuid, amount: Amount, currency: Currency) -> Self {
        Self {
            account_id,
            direction: EntryDirection::Credit,
            amount,
            currency,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Request to record a money movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    pub transaction_type: TransactionType,
    pub idempotency_key: String,
    pub description: String,
    pub entries: Vec<NewEntry>,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub user_id: Option<Uuid>,
    pub metadata: Option<TransactionMetadata>,
}

/// Per-currency debit and credit totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurrencyTotals {
    pub debits: Decimal,
    pub credits: Decimal,
}

impl CreateTransactionRequest {
    pub fn new(
        transaction_type: TransactionType,
        idempotency_key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            transaction_type,
            idempotency_key: idempotency_key.into(),
            description: description.into(),
            entries: Vec::new(),
            reference_id: None,
            reference_type: None,
            user_id: None,
            metadata: None,
        }
    }

    pub fn entry(mut self, entry: NewEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn debit(self, account_id: Uuid, amount: Amount, currency: Currency) -> Self {
        self.entry(NewEntry::debit(account_id, amount, currency))
    }

    pub fn credit(self, account_id: Uuid, amount: Amount, currency: Currency) -> Self {
        self.entry(NewEntry::credit(account_id, amount, currency))
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>, reference_type: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self.reference_type = Some(reference_type.into());
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_metadata(mut self, metadata: TransactionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Debit and credit totals grouped by currency
    pub fn totals_by_currency(&self) -> BTreeMap<Currency, CurrencyTotals> {
        let mut totals: BTreeMap<Currency, CurrencyTotals> = BTreeMap::new();
        for entry in &self.entries {
            let slot = totals.entry(entry.currency).or_default();
            match entry.direction {
                EntryDirection::Debit => slot.debits += entry.amount.value(),
                EntryDirection::Credit => slot.credits += entry.amount.value(),
            }
        }
        totals
    }

    /// Structural validation; account existence and funds are checked at commit.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let key = self.idempotency_key.trim();
        if key.is_empty() {
            return Err(LedgerError::Validation("idempotency key is required".to_string()));
        }
        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(LedgerError::Validation(format!(
                "idempotency key exceeds {} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }

        if self.entries.len() < 2 {
            return Err(LedgerError::Validation(format!(
                "a transaction needs at least 2 entries, got {}",
                self.entries.len()
            )));
        }

        let totals = self.totals_by_currency();
        for (currency, t) in &totals {
            if t.debits != t.credits {
                return Err(LedgerError::Unbalanced {
                    currency: *currency,
                    debits: t.debits,
                    credits: t.credits,
                });
            }
        }

        match &self.metadata {
            Some(metadata) if metadata.transaction_type() != self.transaction_type => {
                return Err(LedgerError::Validation(format!(
                    "{} metadata attached to a {} transaction",
                    metadata.transaction_type(),
                    self.transaction_type
                )));
            }
            None if matches!(
                self.transaction_type,
                TransactionType::Conversion | TransactionType::Reversal
            ) =>
            {
                return Err(LedgerError::Validation(format!(
                    "{} transactions require metadata",
                    self.transaction_type
                )));
            }
            _ => {}
        }

        if let Some(TransactionMetadata::Conversion {
            from_currency,
            to_currency,
            rate,
        }) = &self.metadata
        {
            validate_conversion(&totals, *from_currency, *to_currency, *rate)?;
        } else if totals.len() > 1 {
            return Err(LedgerError::Validation(format!(
                "{} transactions must use a single currency",
                self.transaction_type
            )));
        }

        Ok(())
    }

    /// Hex SHA-256 fingerprint of the payload
    pub fn request_hash(&self) -> Result<String, LedgerError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Materialize the transaction and entry rows for a commit
    pub fn to_records(&self, request_hash: String) -> (Transaction, Vec<Entry>) {
        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            transaction_type: self.transaction_type,
            reference_id: self.reference_id.clone(),
            reference_type: self.reference_type.clone(),
            user_id: self.user_id,
            idempotency_key: self.idempotency_key.clone(),
            status: TransactionStatus::Completed,
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            request_hash,
            created_at: now,
            updated_at: now,
        };

        let entries = self
            .entries
            .iter()
            .map(|e| Entry {
                id: Uuid::new_v4(),
                transaction_id: transaction.id,
                account_id: e.account_id,
                direction: e.direction,
                amount: e.amount.value(),
                currency: e.currency,
                description: e.description.clone(),
                created_at: now,
            })
            .collect();

        (transaction, entries)
    }
}

fn validate_conversion(
    totals: &BTreeMap<Currency, CurrencyTotals>,
    from_currency: Currency,
    to_currency: Currency,
    rate: Decimal,
) -> Result<(), LedgerError> {
    if from_currency == to_currency {
        return Err(LedgerError::Validation(
            "conversion must be between two different currencies".to_string(),
        ));
    }
    if rate <= Decimal::ZERO {
        return Err(LedgerError::Validation(format!("conversion rate must be positive, got {}", rate)));
    }
    if totals.len() != 2 {
        return Err(LedgerError::Validation(
            "conversion must carry legs in exactly two currencies".to_string(),
        ));
    }

    let from = totals.get(&from_currency).ok_or_else(|| {
        LedgerError::Validation(format!("conversion has no {} legs", from_currency))
    })?;
    let to = totals.get(&to_currency).ok_or_else(|| {
        LedgerError::Validation(format!("conversion has no {} legs", to_currency))
    })?;

    let expected = (from.debits * rate).round_dp(MAX_SCALE);
    if expected != to.credits {
        return Err(LedgerError::Validation(format!(
            "conversion legs do not match rate {}: {} {} converts to {} {}, got {}",
            rate, from.debits, from_currency, expected, to_currency, to.credits
        )));
    }
    Ok(())
}

/// Mirror a completed transaction: same accounts and amounts, flipped direction.
pub fn build_reversal(original: &Transaction, entries: &[Entry], reason: &str) -> (Transaction, Vec<Entry>) {
    let now = Utc::now();
    let reversal = Transaction {
        id: Uuid::new_v4(),
        transaction_type: TransactionType::Reversal,
        reference_id: Some(original.id.to_string()),
        reference_type: Some("transaction".to_string()),
        user_id: original.user_id,
        idempotency_key: reversal_key(original.id),
        status: TransactionStatus::Completed,
        description: format!("Reversal of {}: {}", original.id, reason),
        metadata: Some(TransactionMetadata::Reversal {
            original_transaction_id: original.id,
            reason: reason.to_string(),
        }),
        request_hash: hex::encode(Sha256::digest(format!("{}:{}", original.id, reason).as_bytes())),
        created_at: now,
        updated_at: now,
    };

    let mirrored = entries
        .iter()
        .map(|e| Entry {
            id: Uuid::new_v4(),
            transaction_id: reversal.id,
            account_id: e.account_id,
            direction: e.direction.flip(),
            amount: e.amount,
            currency: e.currency,
            description: Some(format!("Reversal of entry {}", e.id)),
            created_at: now,
        })
        .collect();

    (reversal, mirrored)
}

pub fn reversal_key(transaction_id: Uuid) -> String {
    format!("reversal-{}", transaction_id)
}
