//! Audit log - append-only record of every state mutation.
//!
//! The only write path is `append`; there is no update or delete API.
//! Entries carry a per-account monotonic sequence number so a downstream
//! integrity check can detect gaps. Audit entries outlive their account:
//! account deletion cascades into every other table but this one.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::events::RiskEventKind;
use crate::risk::RuleOutcome;
use crate::types::{AccountId, AccountStatus, Currency, OrderId, OrderType, Side, Symbol};

/// What happened. A closed enum per mutation category; no free-form
/// metadata maps, so every consumer handles every kind exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditAction {
    AccountCreated {
        name: String,
        exchange: String,
    },
    AccountDeleted {
        orders: usize,
        trades: usize,
        positions: usize,
        balances: usize,
    },
    AccountFrozen {
        reason: String,
    },
    /// New values after a limits/status/verification change.
    AccountUpdated {
        status: AccountStatus,
        verified: bool,
        daily_limit: Decimal,
        position_limit: Decimal,
    },
    Deposit {
        currency: Currency,
        amount: Decimal,
    },
    Withdrawal {
        currency: Currency,
        amount: Decimal,
    },
    OrderSubmitted {
        order_id: OrderId,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
    },
    /// Outcome of a risk gate evaluation, pass or fail. Recorded for every
    /// evaluation independent of what happens to the order afterwards.
    RiskEvaluated {
        order_id: OrderId,
        approved: bool,
        outcomes: Vec<RuleOutcome>,
    },
    OrderAdmitted {
        order_id: OrderId,
        locked: Decimal,
        lock_currency: Currency,
    },
    OrderRejected {
        order_id: OrderId,
        reason: String,
    },
    OrderAcknowledged {
        order_id: OrderId,
        exchange_order_id: String,
    },
    OrderCancelled {
        order_id: OrderId,
        released: Decimal,
        currency: Currency,
    },
    FillApplied {
        order_id: OrderId,
        exchange_trade_id: String,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        fee_currency: Currency,
        realized_pnl: Decimal,
    },
    FillQuarantined {
        exchange_trade_id: String,
        order_id: Option<OrderId>,
        reason: String,
    },
    BalanceCorrected {
        currency: Currency,
        expected: Decimal,
        actual: Decimal,
        record_id: Uuid,
    },
    ReconciliationPass {
        pass_id: Uuid,
        compared: usize,
        matched: usize,
        discrepancies: usize,
    },
    ReconciliationResolved {
        record_id: Uuid,
    },
    RiskEventRaised {
        event_id: Uuid,
        kind: RiskEventKind,
    },
    RiskEventAcknowledged {
        event_id: Uuid,
        reviewer: String,
    },
    RiskEventResolved {
        event_id: Uuid,
    },
}

/// One immutable audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    /// None for system-level entries. Nullable so entries survive account
    /// deletion with their history intact.
    pub account_id: Option<AccountId>,
    pub sequence: u64,
    pub action: AuditAction,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct AuditState {
    entries: Vec<AuditEntry>,
    sequences: HashMap<AccountId, u64>,
    system_sequence: u64,
}

/// Append-only audit logger, shared across all components.
#[derive(Default)]
pub struct AuditLogger {
    state: Mutex<AuditState>,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number.
    pub fn append(&self, account_id: Option<AccountId>, action: AuditAction) -> u64 {
        let mut state = self.state.lock();
        let sequence = match account_id {
            Some(id) => {
                let seq = state.sequences.entry(id).or_insert(0);
                *seq += 1;
                *seq
            }
            None => {
                state.system_sequence += 1;
                state.system_sequence
            }
        };
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            account_id,
            sequence,
            action,
            at: Utc::now(),
        };
        tracing::debug!(seq = sequence, account = ?account_id, action = ?entry.action, "audit");
        state.entries.push(entry);
        sequence
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().entries.clone()
    }

    /// Snapshot of one account's entries, in append order.
    pub fn entries_for(&self, account_id: AccountId) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.account_id == Some(account_id))
            .cloned()
            .collect()
    }

    /// True if the account's sequence is gap-free (1..=n in order).
    pub fn verify_sequence(&self, account_id: AccountId) -> bool {
        let state = self.state.lock();
        let mut expected = 1u64;
        for entry in &state.entries {
            if entry.account_id == Some(account_id) {
                if entry.sequence != expected {
                    return false;
                }
                expected += 1;
            }
        }
        true
    }
}
