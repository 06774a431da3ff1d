//! Core types - Strong typing for safety
//!
//! Shared primitives for the ledger core. Every quantity and money amount is
//! a `rust_decimal::Decimal`; floats never touch ledger math.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform-side order id. The exchange-side id is a plain `String` assigned
/// by the venue on acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tradeable symbol in `BASE/QUOTE` form (e.g., "BTC/USDT").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base leg of the pair. None if the symbol is not `BASE/QUOTE` shaped.
    pub fn base(&self) -> Option<Currency> {
        let (base, quote) = self.0.split_once('/')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Currency::new(base))
    }

    /// Quote leg of the pair.
    pub fn quote(&self) -> Option<Currency> {
        let (base, quote) = self.0.split_once('/')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Currency::new(quote))
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement currency (e.g., "USDT", "BTC").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Signed direction: Buy grows a position, Sell shrinks it.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Stop => write!(f, "STOP"),
            OrderType::StopLimit => write!(f, "STOP_LIMIT"),
            OrderType::TrailingStop => write!(f, "TRAILING_STOP"),
        }
    }
}

/// Order status. Filled, Cancelled and Rejected are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

/// Trading account. Created once; only limits and status mutate afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    /// Exchange this account is bound to (e.g., "binance").
    pub exchange: String,
    pub verified: bool,
    /// Max notional the account may submit per UTC day.
    pub daily_limit: Decimal,
    /// Max absolute position quantity per symbol.
    pub position_limit: Decimal,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        name: impl Into<String>,
        exchange: impl Into<String>,
        daily_limit: Decimal,
        position_limit: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            name: name.into(),
            exchange: exchange.into(),
            verified: false,
            daily_limit,
            position_limit,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Rolling per-account counters for the current UTC day. Backs the
/// daily-limit and daily-loss risk checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub day: NaiveDate,
    /// Notional admitted through the risk gate today.
    pub submitted_notional: Decimal,
    /// Realized P&L settled today.
    pub realized_pnl: Decimal,
}

impl DailyStats {
    pub fn for_day(day: NaiveDate) -> Self {
        Self {
            day,
            submitted_notional: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }

    /// Reset counters on UTC day rollover.
    pub fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != today {
            *self = Self::for_day(today);
        }
    }
}

/// Immutable execution record, 1:1 with an exchange execution id.
/// Append-only; nothing mutates after recording except the `reconciled`
/// flag set by the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub exchange_trade_id: String,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub fee_currency: Currency,
    /// P&L realized by this execution (position netting contribution).
    pub realized_pnl: Decimal,
    pub reconciled: bool,
    pub executed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}
