//! Order state machine - lifecycle of a single order.
//!
//! `pending -> open -> partially_filled* -> filled | cancelled | rejected`.
//! Transitions run under the account's serialization lock, so fills apply
//! strictly in the order the exchange delivers them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{AccountId, OrderId, OrderStatus, OrderType, Side, Symbol};

/// Order request from the presentation/API collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Trailing distance in percent, (0, 100).
    pub trail_percent: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trail_percent: Option<Decimal>,
    pub status: OrderStatus,
    /// Set by `admit` only; an order never reaches Open without it.
    pub risk_approved: bool,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    /// Reference price the admission lock was computed at.
    pub lock_price: Option<Decimal>,
    pub exchange_order_id: Option<String>,
    /// Cooperative cancellation intent; honored at the next transition
    /// boundary, never mid-fill.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Validate a request and create a Pending order.
    /// Invariant from here on: `filled_quantity + remaining_quantity == quantity`.
    pub fn submit(request: OrderRequest, now: DateTime<Utc>) -> Result<Self> {
        if request.quantity <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }
        if request.symbol.base().is_none() || request.symbol.quote().is_none() {
            return Err(Error::Validation(format!(
                "symbol {} is not BASE/QUOTE shaped",
                request.symbol
            )));
        }
        match request.order_type {
            OrderType::Limit | OrderType::StopLimit => match request.price {
                Some(p) if p > Decimal::ZERO => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "{} order requires a positive price",
                        request.order_type
                    )));
                }
            },
            _ => {}
        }
        match request.order_type {
            OrderType::Stop | OrderType::StopLimit => match request.stop_price {
                Some(p) if p > Decimal::ZERO => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "{} order requires a positive stop price",
                        request.order_type
                    )));
                }
            },
            _ => {}
        }
        if request.order_type == OrderType::TrailingStop {
            match request.trail_percent {
                Some(t) if t > Decimal::ZERO && t < Decimal::ONE_HUNDRED => {}
                _ => {
                    return Err(Error::Validation(
                        "trailing stop requires trail_percent in (0, 100)".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            id: OrderId::new(),
            account_id: request.account_id,
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            trail_percent: request.trail_percent,
            status: OrderStatus::Pending,
            risk_approved: false,
            filled_quantity: Decimal::ZERO,
            remaining_quantity: request.quantity,
            avg_fill_price: None,
            lock_price: None,
            exchange_order_id: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Reference price for notional and admission-lock computation:
    /// the limit price when set, else the stop trigger, else the supplied
    /// market reference.
    pub fn reference_price(&self, market_reference: Option<Decimal>) -> Option<Decimal> {
        self.price.or(self.stop_price).or(market_reference)
    }

    /// Pending -> Open after risk gate approval. The only path that sets
    /// `risk_approved`.
    pub fn admit(&mut self, lock_price: Decimal, now: DateTime<Utc>) -> Result<()> {
        if self.status != OrderStatus::Pending {
            return Err(self.invalid_transition(OrderStatus::Open));
        }
        self.status = OrderStatus::Open;
        self.risk_approved = true;
        self.lock_price = Some(lock_price);
        self.updated_at = now;
        Ok(())
    }

    /// Pending -> Rejected (terminal) on risk gate denial.
    pub fn reject(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != OrderStatus::Pending {
            return Err(self.invalid_transition(OrderStatus::Rejected));
        }
        self.status = OrderStatus::Rejected;
        self.updated_at = now;
        Ok(())
    }

    /// Record the exchange acknowledgement id.
    pub fn acknowledge(&mut self, exchange_order_id: impl Into<String>, now: DateTime<Utc>) {
        self.exchange_order_id = Some(exchange_order_id.into());
        self.updated_at = now;
    }

    /// Apply a fill: shrink remaining, grow filled, re-average the fill
    /// price. Open/PartiallyFilled -> PartiallyFilled | Filled.
    pub fn apply_fill(
        &mut self,
        fill_quantity: Decimal,
        fill_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !matches!(
            self.status,
            OrderStatus::Open | OrderStatus::PartiallyFilled
        ) {
            return Err(self.invalid_transition(OrderStatus::PartiallyFilled));
        }
        if fill_quantity <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "fill quantity must be positive, got {fill_quantity}"
            )));
        }
        if fill_quantity > self.remaining_quantity {
            return Err(Error::Overfill {
                order_id: self.id,
                fill_quantity,
                remaining: self.remaining_quantity,
            });
        }

        let filled_before = self.filled_quantity;
        let avg_before = self.avg_fill_price.unwrap_or(Decimal::ZERO);
        self.filled_quantity += fill_quantity;
        self.remaining_quantity -= fill_quantity;
        self.avg_fill_price = Some(
            (avg_before * filled_before + fill_price * fill_quantity) / self.filled_quantity,
        );
        self.status = if self.remaining_quantity.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;
        Ok(())
    }

    /// Record cancellation intent. The transition itself happens at the
    /// next state-machine boundary via `cancel`.
    pub fn request_cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition(OrderStatus::Cancelled));
        }
        self.cancel_requested = true;
        Ok(())
    }

    /// Pending/Open/PartiallyFilled -> Cancelled (terminal).
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition(OrderStatus::Cancelled));
        }
        self.cancel_requested = true;
        self.status = OrderStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    fn invalid_transition(&self, to: OrderStatus) -> Error {
        Error::InvalidTransition {
            order_id: self.id,
            from: self.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit_request(quantity: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest {
            account_id: AccountId::new(),
            symbol: Symbol::new("BTC/USDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            trail_percent: None,
        }
    }

    fn open_order(quantity: Decimal, price: Decimal) -> Order {
        let now = Utc::now();
        let mut order = Order::submit(limit_request(quantity, price), now).unwrap();
        order.admit(price, now).unwrap();
        order
    }

    #[test]
    fn submit_validates_type_specific_fields() {
        let now = Utc::now();

        let mut req = limit_request(dec!(1), dec!(100));
        req.price = None;
        assert!(matches!(
            Order::submit(req, now),
            Err(Error::Validation(_))
        ));

        let req = limit_request(Decimal::ZERO, dec!(100));
        assert!(Order::submit(req, now).is_err());

        let mut req = limit_request(dec!(1), dec!(100));
        req.order_type = OrderType::TrailingStop;
        req.trail_percent = Some(dec!(150));
        assert!(Order::submit(req, now).is_err());

        let mut req = limit_request(dec!(1), dec!(100));
        req.order_type = OrderType::Stop;
        req.price = None;
        req.stop_price = Some(dec!(95));
        assert!(Order::submit(req, now).is_ok());
    }

    #[test]
    fn fills_preserve_quantity_invariant() {
        let now = Utc::now();
        let mut order = open_order(dec!(10), dec!(100));

        order.apply_fill(dec!(4), dec!(101), now).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity + order.remaining_quantity, order.quantity);
        assert_eq!(order.avg_fill_price, Some(dec!(101)));

        order.apply_fill(dec!(6), dec!(99), now).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(99.8)));
        assert_eq!(order.remaining_quantity, Decimal::ZERO);
    }

    #[test]
    fn overfill_is_rejected_without_mutation() {
        let now = Utc::now();
        let mut order = open_order(dec!(10), dec!(100));
        order.apply_fill(dec!(9), dec!(100), now).unwrap();

        let err = order.apply_fill(dec!(2), dec!(100), now).unwrap_err();
        assert!(matches!(err, Error::Overfill { .. }));
        assert_eq!(order.filled_quantity, dec!(9));
        assert_eq!(order.remaining_quantity, dec!(1));
    }

    #[test]
    fn cancel_only_from_live_states() {
        let now = Utc::now();
        let mut order = open_order(dec!(10), dec!(100));
        order.apply_fill(dec!(10), dec!(100), now).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        let err = order.cancel(now).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(order.status, OrderStatus::Filled);

        let mut live = open_order(dec!(5), dec!(50));
        live.apply_fill(dec!(1), dec!(50), now).unwrap();
        live.cancel(now).unwrap();
        assert_eq!(live.status, OrderStatus::Cancelled);
    }

    #[test]
    fn admit_is_the_only_path_to_open() {
        let now = Utc::now();
        let mut order = Order::submit(limit_request(dec!(1), dec!(10)), now).unwrap();
        assert!(!order.risk_approved);

        order.admit(dec!(10), now).unwrap();
        assert!(order.risk_approved);
        assert_eq!(order.status, OrderStatus::Open);

        // double admission is an invalid transition
        assert!(order.admit(dec!(10), now).is_err());
    }

    #[test]
    fn fills_rejected_before_admission() {
        let now = Utc::now();
        let mut order = Order::submit(limit_request(dec!(1), dec!(10)), now).unwrap();
        assert!(matches!(
            order.apply_fill(dec!(1), dec!(10), now),
            Err(Error::InvalidTransition { .. })
        ));
    }
}
