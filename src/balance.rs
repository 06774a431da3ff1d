//! Balance ledger - per-account, per-currency accounting.
//!
//! Invariant at every committed state: `total == available + locked`, and
//! neither leg is negative. A row that fails `verify` indicates ledger
//! corruption and freezes the account for mutations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{AccountId, Currency};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub currency: Currency,
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(account_id: AccountId, currency: Currency) -> Self {
        Self {
            account_id,
            currency,
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            total: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Check the row against `total == available + locked` and
    /// non-negativity. Any failure is corruption, not a user error.
    pub fn verify(&self) -> Result<()> {
        if self.total != self.available + self.locked
            || self.available < Decimal::ZERO
            || self.locked < Decimal::ZERO
        {
            return Err(Error::LedgerInvariant {
                currency: self.currency.clone(),
                total: self.total,
                available: self.available,
                locked: self.locked,
            });
        }
        Ok(())
    }

    /// Move funds available -> locked. Total unchanged.
    pub fn lock(&mut self, amount: Decimal) -> Result<()> {
        self.verify()?;
        if self.available < amount {
            return Err(Error::InsufficientFunds {
                currency: self.currency.clone(),
                available: self.available,
                required: amount,
            });
        }
        self.available -= amount;
        self.locked += amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move funds locked -> available. Total unchanged. Unlocking more than
    /// is locked means the lock bookkeeping is corrupt.
    pub fn unlock(&mut self, amount: Decimal) -> Result<()> {
        self.verify()?;
        if self.locked < amount {
            return Err(Error::LedgerInvariant {
                currency: self.currency.clone(),
                total: self.total,
                available: self.available,
                locked: self.locked - amount,
            });
        }
        self.locked -= amount;
        self.available += amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Credit the available leg.
    pub fn credit(&mut self, amount: Decimal) -> Result<()> {
        self.verify()?;
        self.available += amount;
        self.total += amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Debit the available leg. Insufficient funds abort the operation and
    /// leave the row untouched.
    pub fn debit_available(&mut self, amount: Decimal) -> Result<()> {
        self.verify()?;
        if self.available < amount {
            return Err(Error::InsufficientFunds {
                currency: self.currency.clone(),
                available: self.available,
                required: amount,
            });
        }
        self.available -= amount;
        self.total -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Consume locked funds on settlement. Funds were locked at admission;
    /// a shortfall here is internal inconsistency, not a user error.
    pub fn spend_locked(&mut self, amount: Decimal) -> Result<()> {
        self.verify()?;
        if self.locked < amount {
            return Err(Error::LedgerInvariant {
                currency: self.currency.clone(),
                total: self.total,
                available: self.available,
                locked: self.locked - amount,
            });
        }
        self.locked -= amount;
        self.total -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Apply a signed settlement delta to the available leg. Used for
    /// deposits, withdrawals and audited reconciliation corrections.
    pub fn settle(&mut self, delta: Decimal) -> Result<()> {
        if delta >= Decimal::ZERO {
            self.credit(delta)
        } else {
            self.debit_available(-delta)
        }
    }
}
