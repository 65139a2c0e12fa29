//! Ledger accounts
//!
//! An account is a bucket of value in a single currency. User accounts are
//! credit-normal (what the platform owes the user); house accounts are
//! debit-normal (what the platform holds).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::amount::{Balance, Currency};
use super::error::LedgerError;
use super::transaction::EntryDirection;

/// Account type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// User's available USDC
    UsdcBalance,
    /// User's USD buying power held at the brokerage
    FiatExposure,
    /// User funds reserved for in-flight investments
    PendingInvestment,
    /// Pooled custodial USDC backing user balances
    SystemBufferUsdc,
    /// Pooled fiat held with the on/off-ramp partner
    SystemBufferFiat,
    /// Brokerage operational account
    BrokerOperational,
    /// USDC leg of currency conversions
    FxClearingUsdc,
    /// USD leg of currency conversions
    FxClearingUsd,
}

impl AccountType {
    pub const USER_TYPES: [AccountType; 3] = [
        AccountType::UsdcBalance,
        AccountType::FiatExposure,
        AccountType::PendingInvestment,
    ];

    pub const SYSTEM_TYPES: [AccountType; 5] = [
        AccountType::SystemBufferUsdc,
        AccountType::SystemBufferFiat,
        AccountType::BrokerOperational,
        AccountType::FxClearingUsdc,
        AccountType::FxClearingUsd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::UsdcBalance => "usdc_balance",
            AccountType::FiatExposure => "fiat_exposure",
            AccountType::PendingInvestment => "pending_investment",
            AccountType::SystemBufferUsdc => "system_buffer_usdc",
            AccountType::SystemBufferFiat => "system_buffer_fiat",
            AccountType::BrokerOperational => "broker_operational",
            AccountType::FxClearingUsdc => "fx_clearing_usdc",
            AccountType::FxClearingUsd => "fx_clearing_usd",
        }
    }

    /// The single currency an account of this type holds
    pub fn currency(&self) -> Currency {
        match self {
            AccountType::UsdcBalance | AccountType::SystemBufferUsdc | AccountType::FxClearingUsdc => {
                Currency::Usdc
            }
            AccountType::FiatExposure
            | AccountType::PendingInvestment
            | AccountType::SystemBufferFiat
            | AccountType::BrokerOperational
            | AccountType::FxClearingUsd => Currency::Usd,
        }
    }

    pub fn is_system(&self) -> bool {
        Self::SYSTEM_TYPES.contains(self)
    }

    /// Side on which entries increase the balance
    pub fn normal_side(&self) -> EntryDirection {
        if self.is_system() {
            EntryDirection::Debit
        } else {
            EntryDirection::Credit
        }
    }

    /// Signed balance effect of posting `amount` on `direction`
    pub fn signed_amount(&self, direction: EntryDirection, amount: Decimal) -> Decimal {
        if direction == self.normal_side() {
            amount
        } else {
            -amount
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let account_type = match s {
            "usdc_balance" => AccountType::UsdcBalance,
            "fiat_exposure" => AccountType::FiatExposure,
            "pending_investment" => AccountType::PendingInvestment,
            "system_buffer_usdc" => AccountType::SystemBufferUsdc,
            "system_buffer_fiat" => AccountType::SystemBufferFiat,
            "broker_operational" => AccountType::BrokerOperational,
            "fx_clearing_usdc" => AccountType::FxClearingUsdc,
            "fx_clearing_usd" => AccountType::FxClearingUsd,
            other => return Err(LedgerError::Corrupted(format!("unknown account type '{}'", other))),
        };
        Ok(account_type)
    }
}

/// A ledger account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// Owning user; absent for house accounts
    pub user_id: Option<Uuid>,
    pub account_type: AccountType,
    pub balance: Balance,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Open a zero-balance account. User types require an owner, system types forbid one.
    pub fn open(user_id: Option<Uuid>, account_type: AccountType) -> Result<Self, LedgerError> {
        match (user_id, account_type.is_system()) {
            (Some(_), true) => {
                return Err(LedgerError::Validation(format!(
                    "{} is a system account type and cannot be owned by a user",
                    account_type
                )))
            }
            (None, false) => {
                return Err(LedgerError::Validation(format!(
                    "{} accounts require an owning user",
                    account_type
                )))
            }
            _ => {}
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            account_type,
            balance: Balance::zero(),
            currency: account_type.currency(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_system(&self) -> bool {
        self.user_id.is_none()
    }

    /// User accounts cannot be driven below zero by a posting
    pub fn allows_overdraft(&self) -> bool {
        self.is_system()
    }

    pub fn signed_amount(&self, direction: EntryDirection, amount: Decimal) -> Decimal {
        self.account_type.signed_amount(direction, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_account_open_user() {
        let user_id = Uuid::new_v4();
        let account = Account::open(Some(user_id), AccountType::UsdcBalance).unwrap();

        assert_eq!(account.user_id, Some(user_id));
        assert_eq!(account.currency, Currency::Usdc);
        assert_eq!(account.balance.value(), Decimal::ZERO);
        assert!(!account.allows_overdraft());
    }

    #[test]
    fn test_account_open_rejects_owner_mismatch() {
        assert!(Account::open(Some(Uuid::new_v4()), AccountType::SystemBufferUsdc).is_err());
        assert!(Account::open(None, AccountType::FiatExposure).is_err());
        assert!(Account::open(None, AccountType::SystemBufferUsdc).is_ok());
    }

    #[test]
    fn test_signed_amount_follows_normal_side() {
        // Deposit: credit user, debit buffer; both balances grow
        assert_eq!(
            AccountType::UsdcBalance.signed_amount(EntryDirection::Credit, dec!(100)),
            dec!(100)
        );
        assert_eq!(
            AccountType::SystemBufferUsdc.signed_amount(EntryDirection::Debit, dec!(100)),
            dec!(100)
        );
        assert_eq!(
            AccountType::FiatExposure.signed_amount(EntryDirection::Debit, dec!(25)),
            dec!(-25)
        );
    }

    #[test]
    fn test_account_type_str_round_trip() {
        for account_type in AccountType::USER_TYPES.iter().chain(AccountType::SYSTEM_TYPES.iter()) {
            assert_eq!(account_type.as_str().parse::<AccountType>().unwrap(), *account_type);
        }
        assert!("savings".parse::<AccountType>().is_err());
    }
}
