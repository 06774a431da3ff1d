//! Error handling - the ledger failure taxonomy
//!
//! Validation and risk errors surface synchronously to the caller.
//! Fill-processing and reconciliation anomalies are quarantined and
//! escalated through the risk event sink instead of propagating.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::risk::DenialReason;
use crate::types::{AccountId, Currency, OrderId, OrderStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed order request. Never persisted as a live order.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Risk gate denial. The order transitions to Rejected (terminal).
    #[error("order denied by risk gate: {0}")]
    RiskRejected(#[from] DenialReason),

    /// Lock or settlement needs more than the available balance.
    #[error("insufficient {currency} funds: available {available}, required {required}")]
    InsufficientFunds {
        currency: Currency,
        available: Decimal,
        required: Decimal,
    },

    /// Fill exceeds the order's remaining quantity. Signals exchange-side
    /// inconsistency; the fill is quarantined, never partially applied.
    #[error("fill of {fill_quantity} exceeds remaining {remaining} on order {order_id}")]
    Overfill {
        order_id: OrderId,
        fill_quantity: Decimal,
        remaining: Decimal,
    },

    /// Redelivered execution report. Dropped without touching the ledger.
    #[error("duplicate fill {exchange_trade_id}")]
    DuplicateFill { exchange_trade_id: String },

    /// Illegal order state transition.
    #[error("invalid transition for order {order_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// A balance row broke `total == available + locked`. Fatal for the
    /// account: mutations are refused until manual reconciliation.
    #[error(
        "ledger invariant violated for {currency}: total {total} != available {available} + locked {locked}"
    )]
    LedgerInvariant {
        currency: Currency,
        total: Decimal,
        available: Decimal,
        locked: Decimal,
    },

    /// Account is frozen pending manual reconciliation; reads still work.
    #[error("account {account_id} frozen: {reason}")]
    AccountFrozen { account_id: AccountId, reason: String },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Lookup failures (account, order, balance, event, record).
    #[error("{0} not found")]
    NotFound(String),
}
