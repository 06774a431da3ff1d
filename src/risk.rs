//! Risk gate - pre-trade checks gating order admission.
//!
//! Rules run in order; the first failure short-circuits with a structured
//! denial reason. Every evaluation, pass or fail, is recorded in the audit
//! log by the engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::balance::Balance;
use crate::config::RiskConfig;
use crate::order::Order;
use crate::position::Position;
use crate::types::{Account, Currency, DailyStats, Side, Symbol};

/// The rule that produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    DailyLimit,
    PositionLimit,
    Funds,
}

/// One rule's verdict inside an evaluation, kept for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule: RuleKind,
    pub passed: bool,
    pub detail: String,
}

/// Structured denial reason returned synchronously to the caller.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum DenialReason {
    #[error("daily limit exceeded: notional {requested} > remaining {remaining}")]
    DailyLimitExceeded {
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("position limit exceeded on {symbol}: resulting {resulting} > limit {limit}")]
    PositionLimitExceeded {
        symbol: Symbol,
        resulting: Decimal,
        limit: Decimal,
    },

    #[error("insufficient {currency} for order: required {required}, available {available}")]
    InsufficientMargin {
        currency: Currency,
        required: Decimal,
        available: Decimal,
    },
}

/// Result of one gate evaluation: the per-rule trail plus the verdict.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcomes: Vec<RuleOutcome>,
    pub denial: Option<DenialReason>,
}

impl Evaluation {
    pub fn approved(&self) -> bool {
        self.denial.is_none()
    }
}

/// Risk gate - enforces account limits before capital is committed.
pub struct RiskGate {
    config: RiskConfig,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Evaluate an order against account limits and balances.
    ///
    /// `reference_price` is the price the notional is computed at (limit or
    /// stop price, or the mark for market orders). `funding_balance` is the
    /// quote balance for buys and the base balance for sells.
    pub fn evaluate(
        &self,
        order: &Order,
        account: &Account,
        position: Option<&Position>,
        funding_balance: Option<&Balance>,
        reference_price: Decimal,
        daily: &DailyStats,
    ) -> Evaluation {
        let mut outcomes = Vec::with_capacity(3);
        let notional = order.quantity * reference_price;

        // 1. Daily notional limit
        let remaining = account.daily_limit - daily.submitted_notional;
        let daily_ok = notional <= remaining;
        outcomes.push(RuleOutcome {
            rule: RuleKind::DailyLimit,
            passed: daily_ok,
            detail: format!("notional {notional} vs remaining {remaining}"),
        });
        if !daily_ok {
            return Evaluation {
                outcomes,
                denial: Some(DenialReason::DailyLimitExceeded {
                    requested: notional,
                    remaining,
                }),
            };
        }

        // 2. Resulting position size limit
        let current_qty = position.map(|p| p.quantity).unwrap_or(Decimal::ZERO);
        let resulting = (current_qty + order.side.sign() * order.quantity).abs();
        let position_ok = resulting <= account.position_limit;
        outcomes.push(RuleOutcome {
            rule: RuleKind::PositionLimit,
            passed: position_ok,
            detail: format!(
                "resulting {resulting} vs limit {} on {}",
                account.position_limit, order.symbol
            ),
        });
        if !position_ok {
            return Evaluation {
                outcomes,
                denial: Some(DenialReason::PositionLimitExceeded {
                    symbol: order.symbol.clone(),
                    resulting,
                    limit: account.position_limit,
                }),
            };
        }

        // 3. Funds to cover the order: full notional in quote for buys,
        //    full quantity in base for sells.
        let (currency, required) = match order.side {
            Side::Buy => (
                order.symbol.quote().unwrap_or_else(|| Currency::new("?")),
                notional,
            ),
            Side::Sell => (
                order.symbol.base().unwrap_or_else(|| Currency::new("?")),
                order.quantity,
            ),
        };
        let available = funding_balance
            .map(|b| b.available)
            .unwrap_or(Decimal::ZERO);
        let funds_ok = required <= available;
        outcomes.push(RuleOutcome {
            rule: RuleKind::Funds,
            passed: funds_ok,
            detail: format!("required {required} {currency} vs available {available}"),
        });
        if !funds_ok {
            return Evaluation {
                outcomes,
                denial: Some(DenialReason::InsufficientMargin {
                    currency,
                    required,
                    available,
                }),
            };
        }

        Evaluation {
            outcomes,
            denial: None,
        }
    }
}
