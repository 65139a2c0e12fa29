//! Balance posting rules shared by every storage backend.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::domain::{
    Account, Balance, Entry, LedgerError, LedgerResult, Transaction, TransactionStatus,
    TransactionType,
};

/// New balance for one account after a posting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub account_id: Uuid,
    pub new_balance: Balance,
}

/// Compute the balance updates `entries` would cause.
///
/// `accounts` must contain every referenced account, already locked by the
/// caller. Updates are returned in account id order.
pub fn plan_postings(
    accounts: &HashMap<Uuid, Account>,
    entries: &[Entry],
) -> LedgerResult<Vec<BalanceUpdate>> {
    let mut deltas: BTreeMap<Uuid, Decimal> = BTreeMap::new();

    for entry in entries {
        let account = accounts
            .get(&entry.account_id)
            .ok_or(LedgerError::AccountNotFound(entry.account_id))?;

        if entry.currency != account.currency {
            return Err(LedgerError::Validation(format!(
                "entry in {} posted to {} account {} ({})",
                entry.currency, account.currency, account.id, account.account_type
            )));
        }

        *deltas.entry(account.id).or_insert(Decimal::ZERO) +=
            account.signed_amount(entry.direction, entry.amount);
    }

    let mut updates = Vec::with_capacity(deltas.len());
    for (account_id, delta) in deltas {
        let account = &accounts[&account_id];
        let new_balance = account.balance.apply(delta);

        // Only outflows can trip the check; inflows to an already negative
        // account are allowed through
        if !account.allows_overdraft() && delta < Decimal::ZERO && new_balance.is_negative() {
            return Err(LedgerError::insufficient_funds(
                account_id,
                -delta,
                account.balance.value(),
            ));
        }

        updates.push(BalanceUpdate {
            account_id,
            new_balance,
        });
    }

    Ok(updates)
}

/// Reversal preconditions, checked with the original row locked
pub fn check_reversible(original: &Transaction) -> LedgerResult<()> {
    if original.transaction_type == TransactionType::Reversal {
        return Err(LedgerError::Validation(format!(
            "transaction {} is itself a reversal and cannot be reversed",
            original.id
        )));
    }
    if original.status == TransactionStatus::Reversed {
        return Err(LedgerError::AlreadyReversed(original.id));
    }
    if !original.status.can_transition_to(TransactionStatus::Reversed) {
        return Err(LedgerError::Validation(format!(
            "transaction {} is {} and cannot be reversed",
            original.id, original.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountType, Amount, CreateTransactionRequest, Currency};
    use rust_decimal_macros::dec;

    fn setup() -> (Account, Account, HashMap<Uuid, Account>) {
        let user = Account::open(Some(Uuid::new_v4()), AccountType::UsdcBalance).unwrap();
        let buffer = Account::open(None, AccountType::SystemBufferUsdc).unwrap();
        let map = [(user.id, user.clone()), (buffer.id, buffer.clone())]
            .into_iter()
            .collect();
        (user, buffer, map)
    }

    fn entries_for(request: CreateTransactionRequest) -> Vec<Entry> {
        request.to_records(String::new()).1
    }

    #[test]
    fn test_deposit_increases_both_sides() {
        let (user, buffer, accounts) = setup();
        let amount = Amount::new(dec!(100)).unwrap();
        let entries = entries_for(
            CreateTransactionRequest::new(TransactionType::Deposit, "k", "deposit")
                .credit(user.id, amount, Currency::Usdc)
                .debit(buffer.id, amount, Currency::Usdc),
        );

        let updates = plan_postings(&accounts, &entries).unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.new_balance.value() == dec!(100)));
    }

    #[test]
    fn test_user_overdraft_rejected() {
        let (user, buffer, accounts) = setup();
        let amount = Amount::new(dec!(10)).unwrap();
        let entries = entries_for(
            CreateTransactionRequest::new(TransactionType::Withdrawal, "k", "withdrawal")
                .debit(user.id, amount, Currency::Usdc)
                .credit(buffer.id, amount, Currency::Usdc),
        );

        let err = plan_postings(&accounts, &entries).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { account_id, .. } if account_id == user.id));
    }

    #[test]
    fn test_currency_mismatch_rejected() {
        let (user, buffer, accounts) = setup();
        let amount = Amount::new(dec!(10)).unwrap();
        let entries = entries_for(
            CreateTransactionRequest::new(TransactionType::Deposit, "k", "deposit")
                .credit(user.id, amount, Currency::Usd)
                .debit(buffer.id, amount, Currency::Usd),
        );

        assert!(matches!(plan_postings(&accounts, &entries), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_unknown_account_rejected() {
        let (user, _, accounts) = setup();
        let amount = Amount::new(dec!(10)).unwrap();
        let missing = Uuid::new_v4();
        let entries = entries_for(
            CreateTransactionRequest::new(TransactionType::Deposit, "k", "deposit")
                .credit(user.id, amount, Currency::Usdc)
                .debit(missing, amount, Currency::Usdc),
        );

        assert!(matches!(
            plan_postings(&accounts, &entries),
            Err(LedgerError::AccountNotFound(id)) if id == missing
        ));
    }

    #[test]
    fn test_check_reversible() {
        let (user, buffer, _) = setup();
        let amount = Amount::new(dec!(5)).unwrap();
        let (mut original, entries) =
            CreateTransactionRequest::new(TransactionType::Deposit, "k", "deposit")
                .credit(user.id, amount, Currency::Usdc)
                .debit(buffer.id, amount, Currency::Usdc)
                .to_records(String::new());
        assert!(check_reversible(&original).is_ok());

        let (reversal, _) = crate::domain::transaction::build_reversal(&original, &entries, "test");
        assert!(matches!(check_reversible(&reversal), Err(LedgerError::Validation(_))));

        original.status = TransactionStatus::Reversed;
        assert!(matches!(check_reversible(&original), Err(LedgerError::AlreadyReversed(_))));
    }
}
