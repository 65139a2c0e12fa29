//! Read-side balance views

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::account::{Account, AccountType};
use super::amount::Currency;

/// A user's balances across their ledger accounts. Missing accounts read as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBalances {
    pub user_id: Uuid,
    pub usdc_balance: Decimal,
    pub fiat_exposure: Decimal,
    pub pending_investment: Decimal,
}

impl UserBalances {
    pub fn from_accounts(user_id: Uuid, accounts: &[Account]) -> Self {
        let mut balances = Self {
            user_id,
            usdc_balance: Decimal::ZERO,
            fiat_exposure: Decimal::ZERO,
            pending_investment: Decimal::ZERO,
        };
        for account in accounts.iter().filter(|a| a.user_id == Some(user_id)) {
            let value = account.balance.value();
            match account.account_type {
                AccountType::UsdcBalance => balances.usdc_balance += value,
                AccountType::FiatExposure => balances.fiat_exposure += value,
                AccountType::PendingInvestment => balances.pending_investment += value,
                _ => {}
            }
        }
        balances
    }

    /// Totals per currency; USDC and USD are never added together.
    pub fn totals_by_currency(&self) -> BTreeMap<Currency, Decimal> {
        let mut totals = BTreeMap::new();
        totals.insert(Currency::Usdc, self.usdc_balance);
        totals.insert(Currency::Usd, self.fiat_exposure + self.pending_investment);
        totals
    }
}

/// Balances of the house accounts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemBuffers {
    pub system_buffer_usdc: Decimal,
    pub system_buffer_fiat: Decimal,
    pub broker_operational: Decimal,
    pub fx_clearing_usdc: Decimal,
    pub fx_clearing_usd: Decimal,
}

impl SystemBuffers {
    pub fn from_accounts(accounts: &[Account]) -> Self {
        let mut buffers = Self::default();
        for account in accounts.iter().filter(|a| a.is_system()) {
            let value = account.balance.value();
            match account.account_type {
                AccountType::SystemBufferUsdc => buffers.system_buffer_usdc += value,
                AccountType::SystemBufferFiat => buffers.system_buffer_fiat += value,
                AccountType::BrokerOperational => buffers.broker_operational += value,
                AccountType::FxClearingUsdc => buffers.fx_clearing_usdc += value,
                AccountType::FxClearingUsd => buffers.fx_clearing_usd += value,
                _ => {}
            }
        }
        buffers
    }

    pub fn totals_by_currency(&self) -> BTreeMap<Currency, Decimal> {
        let mut totals = BTreeMap::new();
        totals.insert(Currency::Usdc, self.system_buffer_usdc + self.fx_clearing_usdc);
        totals.insert(
            Currency::Usd,
            self.system_buffer_fiat + self.broker_operational + self.fx_clearing_usd,
        );
        totals
    }
}
