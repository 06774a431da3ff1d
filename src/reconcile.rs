//! Reconciliation engine - diffs internal state against the exchange.
//!
//! Each pass compares balances, positions, open orders and settled trades
//! with the venue's snapshot. Per-unit state machine:
//! `pending -> matched | discrepancy -> resolved`. Passes are idempotent
//! and restartable: re-matching a matched unit is a no-op, so a crashed
//! pass can simply be re-run.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::AccountSnapshot;
use crate::audit::{AuditAction, AuditLogger};
use crate::book::AccountBook;
use crate::config::ReconciliationConfig;
use crate::error::{Error, Result};
use crate::events::{RiskEventDetail, RiskEventKind, RiskEventSink, Severity};
use crate::types::{AccountId, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconKind {
    Balance,
    Position,
    Trade,
    Order,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconStatus {
    Pending,
    Matched,
    Discrepancy,
    Resolved,
}

/// One compared unit in one pass. Terminal once resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    pub account_id: AccountId,
    pub kind: ReconKind,
    /// What was compared: a currency, symbol, exchange order id or trade id.
    pub reference: String,
    pub status: ReconStatus,
    pub expected: Decimal,
    pub actual: Decimal,
    pub delta: Decimal,
    pub pass_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub pass_id: Uuid,
    pub account_id: AccountId,
    pub compared: usize,
    pub matched: usize,
    pub discrepancies: usize,
    pub corrected: usize,
    pub escalated: usize,
}

pub struct ReconciliationEngine {
    config: ReconciliationConfig,
    records: Mutex<Vec<ReconciliationRecord>>,
}

impl ReconciliationEngine {
    pub fn new(config: ReconciliationConfig) -> Self {
        Self {
            config,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn records(&self) -> Vec<ReconciliationRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, account_id: AccountId) -> Vec<ReconciliationRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Manual-review transition: discrepancy -> resolved.
    pub fn resolve(&self, record_id: Uuid, notes: impl Into<String>) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| Error::NotFound(format!("reconciliation record {record_id}")))?;
        if record.status == ReconStatus::Resolved {
            return Err(Error::Validation(format!(
                "reconciliation record {record_id} already resolved"
            )));
        }
        record.status = ReconStatus::Resolved;
        record.resolved_at = Some(Utc::now());
        record.notes = Some(notes.into());
        Ok(())
    }

    /// File a discrepancy outside a scheduled pass, e.g. for a quarantined
    /// fill. Returns the record id unless an identical one is pending.
    pub fn flag(
        &self,
        account_id: AccountId,
        kind: ReconKind,
        reference: &str,
        expected: Decimal,
        actual: Decimal,
    ) -> Option<Uuid> {
        let mut summary = PassSummary {
            pass_id: Uuid::new_v4(),
            account_id,
            compared: 0,
            matched: 0,
            discrepancies: 0,
            corrected: 0,
            escalated: 0,
        };
        self.record_discrepancy(account_id, kind, reference, expected, actual, &mut summary)
    }

    pub fn purge_account(&self, account_id: AccountId) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.account_id != account_id);
        before - records.len()
    }

    /// Run one pass over a snapshot. The caller holds the account's
    /// serialization lock for exactly this call; the snapshot fetch
    /// happened outside it.
    pub fn reconcile(
        &self,
        book: &mut AccountBook,
        snapshot: &AccountSnapshot,
        sink: &RiskEventSink,
        audit: &AuditLogger,
    ) -> PassSummary {
        let pass_id = Uuid::new_v4();
        let account_id = book.account.id;
        let mut summary = PassSummary {
            pass_id,
            account_id,
            compared: 0,
            matched: 0,
            discrepancies: 0,
            corrected: 0,
            escalated: 0,
        };

        self.reconcile_balances(book, snapshot, sink, audit, &mut summary);
        self.reconcile_positions(book, snapshot, sink, &mut summary);
        self.reconcile_orders(book, snapshot, &mut summary);
        self.reconcile_trades(book, snapshot, &mut summary);

        audit.append(
            Some(account_id),
            AuditAction::ReconciliationPass {
                pass_id,
                compared: summary.compared,
                matched: summary.matched,
                discrepancies: summary.discrepancies,
            },
        );
        tracing::info!(
            account = %account_id,
            pass = %pass_id,
            compared = summary.compared,
            discrepancies = summary.discrepancies,
            "reconciliation pass complete"
        );
        summary
    }

    fn reconcile_balances(
        &self,
        book: &mut AccountBook,
        snapshot: &AccountSnapshot,
        sink: &RiskEventSink,
        audit: &AuditLogger,
        summary: &mut PassSummary,
    ) {
        let mut currencies: Vec<_> = book.balances.keys().cloned().collect();
        for row in &snapshot.balances {
            if !currencies.contains(&row.currency) {
                currencies.push(row.currency.clone());
            }
        }

        for currency in currencies {
            let expected = book
                .balance(&currency)
                .map(|b| b.total)
                .unwrap_or(Decimal::ZERO);
            let actual = snapshot
                .balances
                .iter()
                .find(|b| b.currency == currency)
                .map(|b| b.total)
                .unwrap_or(Decimal::ZERO);
            let tolerance = self.config.tolerance_for(currency.as_str());
            let delta = actual - expected;

            if delta.abs() <= tolerance {
                self.record_match(
                    book.account.id,
                    ReconKind::Balance,
                    currency.as_str(),
                    expected,
                    actual,
                    summary,
                );
                continue;
            }

            let record_id = self.record_discrepancy(
                book.account.id,
                ReconKind::Balance,
                currency.as_str(),
                expected,
                actual,
                summary,
            );
            let Some(record_id) = record_id else { continue };

            if delta.abs() > self.config.escalation_magnitude {
                summary.escalated += 1;
                let kind = if actual < expected {
                    RiskEventKind::LargeLoss
                } else {
                    RiskEventKind::ExposureLimit
                };
                let event_id = sink.raise(
                    book.account.id,
                    kind.clone(),
                    Severity::High,
                    RiskEventDetail::ReconciliationMismatch {
                        record_id,
                        reference: currency.to_string(),
                        expected,
                        actual,
                        delta,
                    },
                );
                audit.append(
                    Some(book.account.id),
                    AuditAction::RiskEventRaised { event_id, kind },
                );
            } else if self.config.auto_correct_balances {
                // Correction is never silent: it carries an audit entry and
                // the discrepancy record stays on file, marked resolved.
                match book.balance_mut(&currency).settle(delta) {
                    Ok(()) => {
                        summary.corrected += 1;
                        audit.append(
                            Some(book.account.id),
                            AuditAction::BalanceCorrected {
                                currency: currency.clone(),
                                expected,
                                actual,
                                record_id,
                            },
                        );
                        let _ = self.resolve(record_id, "auto-corrected to exchange value");
                    }
                    Err(e) => {
                        tracing::warn!(
                            account = %book.account.id,
                            %currency,
                            error = %e,
                            "balance correction failed, left for manual review"
                        );
                    }
                }
            }
        }
    }

    fn reconcile_positions(
        &self,
        book: &AccountBook,
        snapshot: &AccountSnapshot,
        sink: &RiskEventSink,
        summary: &mut PassSummary,
    ) {
        let mut symbols: Vec<_> = book.positions.keys().cloned().collect();
        for row in &snapshot.positions {
            if !symbols.contains(&row.symbol) {
                symbols.push(row.symbol.clone());
            }
        }

        for symbol in symbols {
            let position = book.position(&symbol);
            let expected = position.map(|p| p.quantity).unwrap_or(Decimal::ZERO);
            let actual = snapshot
                .positions
                .iter()
                .find(|p| p.symbol == symbol)
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO);
            let tolerance = self.config.tolerance_for(symbol.as_str());
            let delta = actual - expected;

            if delta.abs() <= tolerance {
                self.record_match(
                    book.account.id,
                    ReconKind::Position,
                    symbol.as_str(),
                    expected,
                    actual,
                    summary,
                );
                continue;
            }

            let record_id = self.record_discrepancy(
                book.account.id,
                ReconKind::Position,
                symbol.as_str(),
                expected,
                actual,
                summary,
            );
            let Some(record_id) = record_id else { continue };

            // Escalation compares notional where an entry price is known.
            let scale = position
                .map(|p| p.avg_price)
                .filter(|p| *p > Decimal::ZERO)
                .unwrap_or(Decimal::ONE);
            if delta.abs() * scale > self.config.escalation_magnitude {
                summary.escalated += 1;
                sink.raise(
                    book.account.id,
                    RiskEventKind::ExposureLimit,
                    Severity::High,
                    RiskEventDetail::ReconciliationMismatch {
                        record_id,
                        reference: symbol.to_string(),
                        expected,
                        actual,
                        delta,
                    },
                );
            }
        }
    }

    fn reconcile_orders(
        &self,
        book: &AccountBook,
        snapshot: &AccountSnapshot,
        summary: &mut PassSummary,
    ) {
        for order in book.orders.values() {
            if !matches!(
                order.status,
                OrderStatus::Open | OrderStatus::PartiallyFilled
            ) {
                continue;
            }
            let Some(exchange_id) = order.exchange_order_id.as_deref() else {
                // not yet acknowledged; nothing to compare against
                continue;
            };
            let expected = order.remaining_quantity;
            let actual = snapshot
                .open_orders
                .iter()
                .find(|o| o.exchange_order_id == exchange_id)
                .map(|o| o.remaining_quantity)
                .unwrap_or(Decimal::ZERO);
            let delta = actual - expected;

            if delta.abs() <= self.config.default_tolerance {
                self.record_match(
                    book.account.id,
                    ReconKind::Order,
                    exchange_id,
                    expected,
                    actual,
                    summary,
                );
            } else {
                self.record_discrepancy(
                    book.account.id,
                    ReconKind::Order,
                    exchange_id,
                    expected,
                    actual,
                    summary,
                );
            }
        }

        // orders the venue reports that the ledger does not know
        for remote in &snapshot.open_orders {
            let known = book.orders.values().any(|o| {
                o.exchange_order_id.as_deref() == Some(remote.exchange_order_id.as_str())
            });
            if !known {
                self.record_discrepancy(
                    book.account.id,
                    ReconKind::Order,
                    &remote.exchange_order_id,
                    Decimal::ZERO,
                    remote.remaining_quantity,
                    summary,
                );
            }
        }
    }

    /// Trade comparison works on presence: expected/actual are 0/1 flags
    /// keyed by the exchange execution id.
    fn reconcile_trades(
        &self,
        book: &mut AccountBook,
        snapshot: &AccountSnapshot,
        summary: &mut PassSummary,
    ) {
        for trade_id in &snapshot.trade_ids {
            let known = book.seen_trade_ids.contains(trade_id);
            if known {
                for trade in book.trades.iter_mut() {
                    if &trade.exchange_trade_id == trade_id {
                        trade.reconciled = true;
                    }
                }
                self.record_match(
                    book.account.id,
                    ReconKind::Trade,
                    trade_id,
                    Decimal::ONE,
                    Decimal::ONE,
                    summary,
                );
            } else {
                self.record_discrepancy(
                    book.account.id,
                    ReconKind::Trade,
                    trade_id,
                    Decimal::ZERO,
                    Decimal::ONE,
                    summary,
                );
            }
        }

        // internal trades the venue has not acknowledged yet stay pending;
        // a later snapshot either matches them or they surface as drift
        let unacked: Vec<String> = book
            .trades
            .iter()
            .filter(|t| !t.reconciled && !snapshot.trade_ids.contains(&t.exchange_trade_id))
            .map(|t| t.exchange_trade_id.clone())
            .collect();
        for trade_id in unacked {
            self.record_pending(
                book.account.id,
                ReconKind::Trade,
                &trade_id,
                Decimal::ONE,
                Decimal::ZERO,
                summary,
            );
        }
    }

    /// Record a unit awaiting the venue's acknowledgement. Skipped when an
    /// identical pending record is already on file.
    fn record_pending(
        &self,
        account_id: AccountId,
        kind: ReconKind,
        reference: &str,
        expected: Decimal,
        actual: Decimal,
        summary: &mut PassSummary,
    ) {
        summary.compared += 1;
        let mut records = self.records.lock();
        if let Some(latest) = Self::latest(&records, account_id, kind, reference) {
            if latest.status == ReconStatus::Pending
                && latest.expected == expected
                && latest.actual == actual
            {
                return;
            }
        }
        records.push(ReconciliationRecord {
            id: Uuid::new_v4(),
            account_id,
            kind,
            reference: reference.to_string(),
            status: ReconStatus::Pending,
            expected,
            actual,
            delta: actual - expected,
            pass_id: summary.pass_id,
            created_at: Utc::now(),
            resolved_at: None,
            notes: None,
        });
    }

    /// Record a matched unit. Re-matching an already-matched unit with the
    /// same values is a no-op, which is what makes passes restartable.
    fn record_match(
        &self,
        account_id: AccountId,
        kind: ReconKind,
        reference: &str,
        expected: Decimal,
        actual: Decimal,
        summary: &mut PassSummary,
    ) {
        summary.compared += 1;
        summary.matched += 1;
        let mut records = self.records.lock();
        if let Some(latest) = Self::latest(&records, account_id, kind, reference) {
            if latest.status == ReconStatus::Matched
                && latest.expected == expected
                && latest.actual == actual
            {
                return;
            }
        }
        records.push(ReconciliationRecord {
            id: Uuid::new_v4(),
            account_id,
            kind,
            reference: reference.to_string(),
            status: ReconStatus::Matched,
            expected,
            actual,
            delta: actual - expected,
            pass_id: summary.pass_id,
            created_at: Utc::now(),
            resolved_at: None,
            notes: None,
        });
    }

    /// Record a discrepancy unless an identical unresolved one is already
    /// on file. Returns the record id when a new record was created.
    fn record_discrepancy(
        &self,
        account_id: AccountId,
        kind: ReconKind,
        reference: &str,
        expected: Decimal,
        actual: Decimal,
        summary: &mut PassSummary,
    ) -> Option<Uuid> {
        summary.compared += 1;
        summary.discrepancies += 1;
        let mut records = self.records.lock();
        if let Some(latest) = Self::latest(&records, account_id, kind, reference) {
            if latest.status == ReconStatus::Discrepancy
                && latest.expected == expected
                && latest.actual == actual
            {
                // already on file awaiting review
                return None;
            }
        }
        let id = Uuid::new_v4();
        tracing::warn!(
            account = %account_id,
            ?kind,
            reference,
            %expected,
            %actual,
            "reconciliation discrepancy"
        );
        records.push(ReconciliationRecord {
            id,
            account_id,
            kind,
            reference: reference.to_string(),
            status: ReconStatus::Discrepancy,
            expected,
            actual,
            delta: actual - expected,
            pass_id: summary.pass_id,
            created_at: Utc::now(),
            resolved_at: None,
            notes: None,
        });
        Some(id)
    }

    fn latest<'a>(
        records: &'a [ReconciliationRecord],
        account_id: AccountId,
        kind: ReconKind,
        reference: &str,
    ) -> Option<&'a ReconciliationRecord> {
        records
            .iter()
            .rev()
            .find(|r| r.account_id == account_id && r.kind == kind && r.reference == reference)
    }
}
