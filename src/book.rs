//! Account book - the committed state of one account.
//!
//! One book per account, guarded by that account's serialization lock in
//! the engine. Multi-row mutations (fill -> order + position + balance +
//! trade) are prepared on a cloned draft and swapped in whole, so a fill
//! either commits everywhere or nowhere.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::balance::Balance;
use crate::error::{Error, Result};
use crate::order::Order;
use crate::position::Position;
use crate::types::{Account, AccountId, Currency, DailyStats, OrderId, Symbol, Trade};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBook {
    pub account: Account,
    pub orders: HashMap<OrderId, Order>,
    pub positions: HashMap<Symbol, Position>,
    pub balances: HashMap<Currency, Balance>,
    pub trades: Vec<Trade>,
    /// Exchange execution ids already applied; the idempotence guard.
    pub seen_trade_ids: HashSet<String>,
    pub daily: DailyStats,
    /// Set when a ledger invariant broke. Mutations are refused until a
    /// manual reconciliation clears it; reads stay available.
    pub frozen: Option<String>,
}

impl AccountBook {
    pub fn new(account: Account) -> Self {
        let daily = DailyStats::for_day(account.created_at.date_naive());
        Self {
            account,
            orders: HashMap::new(),
            positions: HashMap::new(),
            balances: HashMap::new(),
            trades: Vec::new(),
            seen_trade_ids: HashSet::new(),
            daily,
            frozen: None,
        }
    }

    pub fn id(&self) -> AccountId {
        self.account.id
    }

    /// Refuse mutation while the account is frozen.
    pub fn ensure_unfrozen(&self) -> Result<()> {
        match &self.frozen {
            Some(reason) => Err(Error::AccountFrozen {
                account_id: self.account.id,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn balance(&self, currency: &Currency) -> Option<&Balance> {
        self.balances.get(currency)
    }

    /// Balance row for a currency, created at zero if absent.
    pub fn balance_mut(&mut self, currency: &Currency) -> &mut Balance {
        let account_id = self.account.id;
        self.balances
            .entry(currency.clone())
            .or_insert_with(|| Balance::new(account_id, currency.clone()))
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Position row for a symbol, created flat if absent.
    pub fn position_mut(&mut self, symbol: &Symbol) -> &mut Position {
        let account_id = self.account.id;
        self.positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::flat(account_id, symbol.clone()))
    }

    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    /// True if any balance has locked funds or any position is open.
    /// Withdrawals and deletion are refused while encumbered.
    pub fn encumbered(&self) -> bool {
        self.balances
            .values()
            .any(|b| !b.locked.is_zero())
            || self
                .positions
                .values()
                .any(|p| !p.quantity.is_zero())
    }
}
