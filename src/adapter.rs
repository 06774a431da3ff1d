//! Exchange adapter - the normalized boundary to the venue.
//!
//! The core never speaks a wire protocol. An adapter pushes normalized
//! events (acknowledgements, fills) into a channel the engine drains, and
//! serves authoritative account snapshots for reconciliation on demand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AccountId, Currency, OrderId, Side, Symbol};

/// Normalized execution report from the venue. Exchanges may redeliver
/// these; `exchange_trade_id` is the idempotence key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillReport {
    pub exchange_trade_id: String,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub fee_currency: Currency,
    pub executed_at: DateTime<Utc>,
}

/// Normalized inbound events delivered in causal order per order id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExchangeEvent {
    /// Venue accepted the order and assigned its own id.
    OrderAck {
        account_id: AccountId,
        order_id: OrderId,
        exchange_order_id: String,
    },
    Fill(FillReport),
}

/// One currency row of an exchange-reported snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBalance {
    pub currency: Currency,
    pub total: Decimal,
}

/// One symbol row of an exchange-reported snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPosition {
    pub symbol: Symbol,
    pub quantity: Decimal,
}

/// One open order as the venue sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotOrder {
    pub exchange_order_id: String,
    pub remaining_quantity: Decimal,
}

/// Authoritative account state as reported by the exchange, consumed by
/// the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: AccountId,
    pub balances: Vec<SnapshotBalance>,
    pub positions: Vec<SnapshotPosition>,
    pub open_orders: Vec<SnapshotOrder>,
    /// Execution ids the venue acknowledges having settled.
    pub trade_ids: Vec<String>,
    pub taken_at: DateTime<Utc>,
}

/// Universal exchange adapter trait. Every venue integration implements
/// this same interface; the core consumes nothing else.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Venue name (e.g., "binance").
    fn name(&self) -> &str;

    /// Subscribe to normalized order events. The adapter pushes events into
    /// `tx` for the engine to drain; per-order causal ordering is the
    /// adapter's responsibility.
    async fn subscribe_events(&self, tx: flume::Sender<ExchangeEvent>) -> Result<()>;

    /// Fetch the venue's authoritative snapshot for an account. Called
    /// outside any account lock; may take network time.
    async fn fetch_snapshot(&self, account_id: AccountId) -> Result<AccountSnapshot>;
}
