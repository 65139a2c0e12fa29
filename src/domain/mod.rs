//! Domain module
//!
//! Core ledger types and validation rules.

pub mod account;
pub mod amount;
pub mod balances;
pub mod context;
pub mod error;
pub mod transaction;

pub use account::{Account, AccountType};
pub use amount::{Amount, AmountError, Balance, Currency};
pub use balances::{SystemBuffers, UserBalances};
pub use context::{Interruption, OperationContext};
pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use transaction::{
    CreateTransactionRequest, Entry, EntryDirection, NewEntry, Transaction, TransactionMetadata,
    TransactionReceipt, TransactionStatus, TransactionType,
};
