//! Position ledger - per-account, per-symbol netting and P&L.
//!
//! Quantity is signed: positive long, negative short. A position is Closed
//! exactly when quantity is zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: AccountId,
    pub symbol: Symbol,
    /// Signed quantity: positive long, negative short.
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub margin_requirement: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A flat (zero-quantity) position, ready to receive its first trade.
    pub fn flat(account_id: AccountId, symbol: Symbol) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            symbol,
            quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            market_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            margin_requirement: Decimal::ZERO,
            status: PositionStatus::Closed,
            opened_at: now,
            closed_at: None,
            updated_at: now,
        }
    }

    pub fn direction(&self) -> Option<Side> {
        if self.quantity > Decimal::ZERO {
            Some(Side::Buy)
        } else if self.quantity < Decimal::ZERO {
            Some(Side::Sell)
        } else {
            None
        }
    }

    /// Net a trade into the position and return the realized P&L delta.
    ///
    /// Same-direction trades extend the position at a quantity-weighted
    /// average price. Opposing trades realize
    /// `closed_qty * (price - avg_price) * direction_sign`; the average is
    /// retained for any remaining quantity and reset on a full reversal.
    pub fn apply_trade(
        &mut self,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Decimal {
        debug_assert!(quantity > Decimal::ZERO, "trade quantity must be positive");
        let delta = side.sign() * quantity;
        let old_qty = self.quantity;
        let mut realized = Decimal::ZERO;

        if old_qty.is_zero() || old_qty.signum() == delta.signum() {
            // extend: weighted average entry
            let new_qty = old_qty + delta;
            if !new_qty.is_zero() {
                self.avg_price = (old_qty.abs() * self.avg_price + delta.abs() * price)
                    / new_qty.abs();
            }
            self.quantity = new_qty;
            if old_qty.is_zero() {
                self.opened_at = now;
                self.closed_at = None;
            }
        } else {
            // reduce, close, or flip
            let closed_qty = old_qty.abs().min(delta.abs());
            realized = closed_qty * (price - self.avg_price) * old_qty.signum();
            self.realized_pnl += realized;
            let new_qty = old_qty + delta;

            if new_qty.is_zero() {
                self.quantity = Decimal::ZERO;
                self.closed_at = Some(now);
            } else if new_qty.signum() == old_qty.signum() {
                // partial reduce: average price unchanged
                self.quantity = new_qty;
            } else {
                // full reversal: surplus opens fresh at the fill price
                self.quantity = new_qty;
                self.avg_price = price;
                self.opened_at = now;
                self.closed_at = None;
            }
        }

        self.status = if self.quantity.is_zero() {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        };
        self.mark_to_market(price);
        self.updated_at = now;
        realized
    }

    /// Recompute unrealized P&L and market value at the given price.
    /// Realized figures never move here.
    pub fn mark_to_market(&mut self, price: Decimal) {
        self.market_value = self.quantity.abs() * price;
        self.unrealized_pnl = self.quantity * (price - self.avg_price);
    }

    /// Record the margin requirement as a fraction of current notional.
    pub fn update_margin(&mut self, margin_fraction: Decimal) {
        self.margin_requirement = self.quantity.abs() * self.avg_price * margin_fraction;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pos() -> Position {
        Position::flat(AccountId::new(), Symbol::new("BTC/USDT"))
    }

    #[test]
    fn extend_averages_entry_price() {
        let mut p = pos();
        let now = Utc::now();
        p.apply_trade(Side::Buy, dec!(4), dec!(101), now);
        assert_eq!(p.quantity, dec!(4));
        assert_eq!(p.avg_price, dec!(101));
        assert_eq!(p.status, PositionStatus::Open);

        p.apply_trade(Side::Buy, dec!(6), dec!(99), now);
        assert_eq!(p.quantity, dec!(10));
        assert_eq!(p.avg_price, dec!(99.8));
    }

    #[test]
    fn reduce_realizes_pnl_and_keeps_avg() {
        let mut p = pos();
        let now = Utc::now();
        p.apply_trade(Side::Buy, dec!(10), dec!(100), now);
        let realized = p.apply_trade(Side::Sell, dec!(4), dec!(110), now);
        assert_eq!(realized, dec!(40));
        assert_eq!(p.quantity, dec!(6));
        assert_eq!(p.avg_price, dec!(100));
        assert_eq!(p.realized_pnl, dec!(40));
    }

    #[test]
    fn close_to_zero_flips_status() {
        let mut p = pos();
        let now = Utc::now();
        p.apply_trade(Side::Buy, dec!(5), dec!(100), now);
        let realized = p.apply_trade(Side::Sell, dec!(5), dec!(90), now);
        assert_eq!(realized, dec!(-50));
        assert_eq!(p.quantity, Decimal::ZERO);
        assert_eq!(p.status, PositionStatus::Closed);
        assert!(p.closed_at.is_some());
    }

    #[test]
    fn full_reversal_resets_average() {
        let mut p = pos();
        let now = Utc::now();
        p.apply_trade(Side::Buy, dec!(3), dec!(100), now);
        let realized = p.apply_trade(Side::Sell, dec!(8), dec!(120), now);
        // 3 closed at +20 each
        assert_eq!(realized, dec!(60));
        assert_eq!(p.quantity, dec!(-5));
        assert_eq!(p.avg_price, dec!(120));
        assert_eq!(p.status, PositionStatus::Open);
    }

    #[test]
    fn short_side_pnl_sign() {
        let mut p = pos();
        let now = Utc::now();
        p.apply_trade(Side::Sell, dec!(2), dec!(50), now);
        assert_eq!(p.direction(), Some(Side::Sell));
        let realized = p.apply_trade(Side::Buy, dec!(2), dec!(45), now);
        assert_eq!(realized, dec!(10));
        assert_eq!(p.status, PositionStatus::Closed);
    }

    #[test]
    fn mark_to_market_leaves_realized_untouched() {
        let mut p = pos();
        let now = Utc::now();
        p.apply_trade(Side::Buy, dec!(2), dec!(100), now);
        p.mark_to_market(dec!(110));
        assert_eq!(p.unrealized_pnl, dec!(20));
        assert_eq!(p.market_value, dec!(220));
        assert_eq!(p.realized_pnl, Decimal::ZERO);
    }
}
