//! Ledger engine - composition root and public API surface.
//!
//! All mutating operations for a single account funnel through that
//! account's `Mutex<AccountBook>`, so order admission, fills, settlement
//! and reconciliation corrections never interleave. Reads clone the last
//! committed book state and proceed without holding the writer up.

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::{AccountSnapshot, ExchangeAdapter, ExchangeEvent, FillReport};
use crate::audit::{AuditAction, AuditLogger};
use crate::balance::Balance;
use crate::book::AccountBook;
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::events::{
    RiskEvent, RiskEventDetail, RiskEventKind, RiskEventSink, RiskEventStatus, Severity,
};
use crate::fills;
use crate::order::{Order, OrderRequest};
use crate::position::Position;
use crate::reconcile::{PassSummary, ReconKind, ReconciliationEngine, ReconciliationRecord};
use crate::risk::{DenialReason, RiskGate};
use crate::types::{Account, AccountId, AccountStatus, Currency, OrderId, Side, Symbol, Trade};

pub struct LedgerEngine {
    config: CoreConfig,
    books: RwLock<HashMap<AccountId, Arc<Mutex<AccountBook>>>>,
    /// Last seen price per symbol, fed by fills and `set_mark_price`.
    marks: RwLock<HashMap<Symbol, Decimal>>,
    audit: AuditLogger,
    gate: RiskGate,
    risk_events: RiskEventSink,
    reconciliation: ReconciliationEngine,
    /// Consecutive insufficient-funds denials per account, for margin-call
    /// escalation. Reset on the next approval.
    denial_streaks: Mutex<HashMap<AccountId, u32>>,
}

impl LedgerEngine {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            gate: RiskGate::new(config.risk.clone()),
            reconciliation: ReconciliationEngine::new(config.reconciliation.clone()),
            config,
            books: RwLock::new(HashMap::new()),
            marks: RwLock::new(HashMap::new()),
            audit: AuditLogger::new(),
            risk_events: RiskEventSink::new(),
            denial_streaks: Mutex::new(HashMap::new()),
        }
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    // ── account lifecycle ────────────────────────────────────────────

    /// Create an account with the configured default limits.
    pub fn create_account(&self, name: impl Into<String>, exchange: impl Into<String>) -> AccountId {
        self.create_account_with_limits(
            name,
            exchange,
            self.config.risk.default_daily_limit,
            self.config.risk.default_position_limit,
        )
    }

    pub fn create_account_with_limits(
        &self,
        name: impl Into<String>,
        exchange: impl Into<String>,
        daily_limit: Decimal,
        position_limit: Decimal,
    ) -> AccountId {
        let account = Account::new(name, exchange, daily_limit, position_limit);
        let id = account.id;
        let name = account.name.clone();
        let exchange = account.exchange.clone();
        self.books
            .write()
            .insert(id, Arc::new(Mutex::new(AccountBook::new(account))));
        self.audit
            .append(Some(id), AuditAction::AccountCreated { name, exchange });
        info!(account = %id, "account created");
        id
    }

    /// Explicit orchestrated deletion: drops orders, trades, positions,
    /// balances, risk events and reconciliation records. Audit entries are
    /// deliberately retained.
    pub fn delete_account(&self, account_id: AccountId) -> Result<()> {
        let handle = self.book_handle(account_id)?;
        {
            let book = handle.lock();
            if book.encumbered() {
                return Err(Error::Validation(format!(
                    "account {account_id} has locked funds or open positions"
                )));
            }
        }
        let removed = self.books.write().remove(&account_id);
        if let Some(handle) = removed {
            let book = handle.lock();
            self.risk_events.purge_account(account_id);
            self.reconciliation.purge_account(account_id);
            self.audit.append(
                Some(account_id),
                AuditAction::AccountDeleted {
                    orders: book.orders.len(),
                    trades: book.trades.len(),
                    positions: book.positions.len(),
                    balances: book.balances.len(),
                },
            );
        }
        Ok(())
    }

    /// Accounts mutate only for limits, status and verification; every
    /// change lands in the audit log with the resulting row.
    pub fn set_account_status(&self, account_id: AccountId, status: AccountStatus) -> Result<()> {
        self.update_account(account_id, |account| account.status = status)
    }

    pub fn set_account_limits(
        &self,
        account_id: AccountId,
        daily_limit: Decimal,
        position_limit: Decimal,
    ) -> Result<()> {
        self.update_account(account_id, |account| {
            account.daily_limit = daily_limit;
            account.position_limit = position_limit;
        })
    }

    pub fn set_account_verified(&self, account_id: AccountId, verified: bool) -> Result<()> {
        self.update_account(account_id, |account| account.verified = verified)
    }

    fn update_account(&self, account_id: AccountId, apply: impl FnOnce(&mut Account)) -> Result<()> {
        let handle = self.book_handle(account_id)?;
        let mut book = handle.lock();
        apply(&mut book.account);
        book.account.updated_at = chrono::Utc::now();
        self.audit.append(
            Some(account_id),
            AuditAction::AccountUpdated {
                status: book.account.status,
                verified: book.account.verified,
                daily_limit: book.account.daily_limit,
                position_limit: book.account.position_limit,
            },
        );
        Ok(())
    }

    pub fn deposit(&self, account_id: AccountId, currency: Currency, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "deposit must be positive, got {amount}"
            )));
        }
        let handle = self.book_handle(account_id)?;
        let mut book = handle.lock();
        book.ensure_unfrozen()?;
        book.balance_mut(&currency).credit(amount)?;
        self.audit
            .append(Some(account_id), AuditAction::Deposit { currency, amount });
        Ok(())
    }

    /// Withdrawals are refused while the account is encumbered (locked
    /// funds or open positions).
    pub fn withdraw(&self, account_id: AccountId, currency: Currency, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "withdrawal must be positive, got {amount}"
            )));
        }
        let handle = self.book_handle(account_id)?;
        let mut book = handle.lock();
        book.ensure_unfrozen()?;
        if book.encumbered() {
            return Err(Error::Validation(format!(
                "account {account_id} has locked funds or open positions"
            )));
        }
        book.balance_mut(&currency).debit_available(amount)?;
        self.audit
            .append(Some(account_id), AuditAction::Withdrawal { currency, amount });
        Ok(())
    }

    // ── order admission ──────────────────────────────────────────────

    /// Submit an order through the risk gate. Approval locks the funding
    /// leg and admits the order; denial persists it as Rejected and
    /// returns the structured reason synchronously.
    pub fn submit_order(&self, request: OrderRequest) -> Result<OrderId> {
        let handle = self.book_handle(request.account_id)?;
        let mut book = handle.lock();
        book.ensure_unfrozen()?;
        if book.account.status != AccountStatus::Active {
            return Err(Error::Validation(format!(
                "account {} is {:?}",
                book.account.id, book.account.status
            )));
        }

        let now = chrono::Utc::now();
        book.daily.roll(now);
        let mut order = Order::submit(request, now)?;
        self.audit.append(
            Some(book.account.id),
            AuditAction::OrderSubmitted {
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: order.order_type,
                quantity: order.quantity,
            },
        );

        let mark = self.marks.read().get(&order.symbol).copied();
        let reference_price = order.reference_price(mark).ok_or_else(|| {
            Error::Validation(format!(
                "no reference price for market order on {}",
                order.symbol
            ))
        })?;

        let funding_currency = match order.side {
            Side::Buy => order.symbol.quote(),
            Side::Sell => order.symbol.base(),
        }
        .expect("symbol legs validated at submit");
        let evaluation = self.gate.evaluate(
            &order,
            &book.account,
            book.position(&order.symbol),
            book.balance(&funding_currency),
            reference_price,
            &book.daily,
        );
        self.audit.append(
            Some(book.account.id),
            AuditAction::RiskEvaluated {
                order_id: order.id,
                approved: evaluation.approved(),
                outcomes: evaluation.outcomes.clone(),
            },
        );

        if let Some(denial) = evaluation.denial {
            order.reject(now)?;
            self.audit.append(
                Some(book.account.id),
                AuditAction::OrderRejected {
                    order_id: order.id,
                    reason: denial.to_string(),
                },
            );
            book.orders.insert(order.id, order);
            match &denial {
                DenialReason::InsufficientMargin { currency, .. } => {
                    self.note_insufficient_funds(book.account.id, currency);
                }
                DenialReason::PositionLimitExceeded {
                    symbol,
                    resulting,
                    limit,
                } => {
                    let event_id = self.risk_events.raise(
                        book.account.id,
                        RiskEventKind::PositionLimit,
                        Severity::Medium,
                        RiskEventDetail::LimitBreach {
                            symbol: Some(symbol.clone()),
                            limit: *limit,
                            attempted: *resulting,
                        },
                    );
                    self.audit.append(
                        Some(book.account.id),
                        AuditAction::RiskEventRaised {
                            event_id,
                            kind: RiskEventKind::PositionLimit,
                        },
                    );
                }
                DenialReason::DailyLimitExceeded { .. } => {}
            }
            return Err(Error::RiskRejected(denial));
        }

        let notional = order.quantity * reference_price;
        let (lock_currency, lock_amount) = match order.side {
            Side::Buy => (funding_currency, notional),
            Side::Sell => (funding_currency, order.quantity),
        };
        if let Err(e) = book.balance_mut(&lock_currency).lock(lock_amount) {
            // gate approved but the lock failed; persist the rejection
            order.reject(now)?;
            self.audit.append(
                Some(book.account.id),
                AuditAction::OrderRejected {
                    order_id: order.id,
                    reason: e.to_string(),
                },
            );
            book.orders.insert(order.id, order);
            return Err(e);
        }

        order.admit(reference_price, now)?;
        book.daily.submitted_notional += notional;
        self.denial_streaks.lock().remove(&book.account.id);
        self.audit.append(
            Some(book.account.id),
            AuditAction::OrderAdmitted {
                order_id: order.id,
                locked: lock_amount,
                lock_currency,
            },
        );
        let id = order.id;
        book.orders.insert(id, order);
        info!(account = %book.account.id, order = %id, "order admitted");
        Ok(id)
    }

    /// Cooperative cancellation: takes the account's serialization slot,
    /// so it can never interleave with an in-flight fill application.
    pub fn cancel_order(&self, account_id: AccountId, order_id: OrderId) -> Result<()> {
        let handle = self.book_handle(account_id)?;
        let mut book = handle.lock();
        book.ensure_unfrozen()?;

        let order = book
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| Error::NotFound(format!("order {order_id}")))?;
        order.request_cancel()?;
        let now = chrono::Utc::now();
        order.cancel(now)?;

        // release whatever the admission lock still holds for the unfilled
        // remainder
        let remaining = order.remaining_quantity;
        let lock_price = order.lock_price.unwrap_or(Decimal::ZERO);
        let (currency, release) = match order.side {
            Side::Buy => (
                order.symbol.quote().expect("symbol legs validated at submit"),
                remaining * lock_price,
            ),
            Side::Sell => (
                order.symbol.base().expect("symbol legs validated at submit"),
                remaining,
            ),
        };
        if release > Decimal::ZERO {
            book.balance_mut(&currency).unlock(release)?;
        }
        self.audit.append(
            Some(account_id),
            AuditAction::OrderCancelled {
                order_id,
                released: release,
                currency,
            },
        );
        Ok(())
    }

    // ── exchange events ──────────────────────────────────────────────

    /// Apply one normalized exchange event. Fill anomalies are quarantined
    /// and escalated here rather than propagated: by the time a bad fill
    /// arrives there is no caller left to return an error to.
    pub fn handle_event(&self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::OrderAck {
                account_id,
                order_id,
                exchange_order_id,
            } => self.handle_ack(account_id, order_id, exchange_order_id),
            ExchangeEvent::Fill(report) => self.handle_fill(report),
        }
    }

    fn handle_ack(&self, account_id: AccountId, order_id: OrderId, exchange_order_id: String) {
        let Ok(handle) = self.book_handle(account_id) else {
            warn!(account = %account_id, "ack for unknown account dropped");
            return;
        };
        let mut book = handle.lock();
        let Some(order) = book.orders.get_mut(&order_id) else {
            warn!(order = %order_id, "ack for unknown order dropped");
            return;
        };
        order.acknowledge(exchange_order_id.clone(), chrono::Utc::now());
        self.audit.append(
            Some(account_id),
            AuditAction::OrderAcknowledged {
                order_id,
                exchange_order_id,
            },
        );
    }

    fn handle_fill(&self, report: FillReport) {
        let Ok(handle) = self.book_handle(report.account_id) else {
            warn!(
                account = %report.account_id,
                trade = %report.exchange_trade_id,
                "fill for unknown account dropped"
            );
            return;
        };
        let mut book = handle.lock();
        let now = chrono::Utc::now();

        match fills::ingest_fill(&mut book, &report, self.config.risk.margin_fraction, now) {
            Ok(trade) => {
                self.marks
                    .write()
                    .insert(trade.symbol.clone(), trade.price);
                self.audit.append(
                    Some(report.account_id),
                    AuditAction::FillApplied {
                        order_id: trade.order_id,
                        exchange_trade_id: trade.exchange_trade_id.clone(),
                        quantity: trade.quantity,
                        price: trade.price,
                        fee: trade.fee,
                        fee_currency: trade.fee_currency.clone(),
                        realized_pnl: trade.realized_pnl,
                    },
                );
                self.check_daily_loss(&book);
            }
            Err(Error::DuplicateFill { exchange_trade_id }) => {
                // routine redelivery; ledger already reflects this execution
                warn!(
                    account = %report.account_id,
                    trade = %exchange_trade_id,
                    "duplicate fill dropped"
                );
            }
            Err(Error::LedgerInvariant {
                currency,
                total,
                available,
                locked,
            }) => {
                let reason = format!(
                    "balance {currency} corrupt: total {total}, available {available}, locked {locked}"
                );
                book.frozen = Some(reason.clone());
                self.audit.append(
                    Some(report.account_id),
                    AuditAction::AccountFrozen { reason: reason.clone() },
                );
                self.risk_events.raise(
                    report.account_id,
                    RiskEventKind::Other("ledger_invariant".to_string()),
                    Severity::Critical,
                    RiskEventDetail::Other(reason),
                );
            }
            Err(e) => self.quarantine_fill(&mut book, &report, e),
        }
    }

    /// Quarantine path: the fill is logged and flagged, never applied.
    fn quarantine_fill(&self, book: &mut AccountBook, report: &FillReport, error: Error) {
        warn!(
            account = %report.account_id,
            trade = %report.exchange_trade_id,
            error = %error,
            "fill quarantined"
        );
        let expected = book
            .order(report.order_id)
            .map(|o| o.remaining_quantity)
            .unwrap_or(Decimal::ZERO);
        self.audit.append(
            Some(report.account_id),
            AuditAction::FillQuarantined {
                exchange_trade_id: report.exchange_trade_id.clone(),
                order_id: book.order(report.order_id).map(|o| o.id),
                reason: error.to_string(),
            },
        );
        self.reconciliation.flag(
            report.account_id,
            ReconKind::Trade,
            &report.exchange_trade_id,
            expected,
            report.quantity,
        );
        if let Error::InsufficientFunds { currency, .. } = &error {
            self.note_insufficient_funds(report.account_id, currency);
        }
    }

    /// Track consecutive insufficient-funds failures; enough of them in a
    /// row raises a margin call for manual review.
    fn note_insufficient_funds(&self, account_id: AccountId, currency: &Currency) {
        let mut streaks = self.denial_streaks.lock();
        let streak = streaks.entry(account_id).or_insert(0);
        *streak += 1;
        if *streak >= self.config.risk.margin_call_after_denials {
            let event_id = self.risk_events.raise(
                account_id,
                RiskEventKind::MarginCall,
                Severity::High,
                RiskEventDetail::RepeatedDenials {
                    denials: *streak,
                    currency: currency.clone(),
                },
            );
            self.audit.append(
                Some(account_id),
                AuditAction::RiskEventRaised {
                    event_id,
                    kind: RiskEventKind::MarginCall,
                },
            );
            *streak = 0;
        }
    }

    fn check_daily_loss(&self, book: &AccountBook) {
        let Some(limit) = self.config.risk.daily_loss_limit else {
            return;
        };
        if book.daily.realized_pnl >= -limit {
            return;
        }
        let already_open = self
            .risk_events
            .list(book.account.id, Some(RiskEventStatus::Open))
            .iter()
            .any(|e| e.kind == RiskEventKind::DrawdownLimit);
        if already_open {
            return;
        }
        let event_id = self.risk_events.raise(
            book.account.id,
            RiskEventKind::DrawdownLimit,
            Severity::High,
            RiskEventDetail::DailyLossBreach {
                realized_loss: -book.daily.realized_pnl,
                limit,
            },
        );
        self.audit.append(
            Some(book.account.id),
            AuditAction::RiskEventRaised {
                event_id,
                kind: RiskEventKind::DrawdownLimit,
            },
        );
    }

    // ── reads ────────────────────────────────────────────────────────

    pub fn account_ids(&self) -> Vec<AccountId> {
        self.books.read().keys().copied().collect()
    }

    /// Consistent snapshot of the whole account book.
    pub fn book_snapshot(&self, account_id: AccountId) -> Result<AccountBook> {
        Ok(self.book_handle(account_id)?.lock().clone())
    }

    pub fn get_order(&self, account_id: AccountId, order_id: OrderId) -> Result<Order> {
        self.book_handle(account_id)?
            .lock()
            .order(order_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("order {order_id}")))
    }

    /// Position valued at the current mark price.
    pub fn get_position(&self, account_id: AccountId, symbol: &Symbol) -> Result<Position> {
        let mut position = self
            .book_handle(account_id)?
            .lock()
            .position(symbol)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("position {symbol}")))?;
        if let Some(mark) = self.marks.read().get(symbol) {
            position.mark_to_market(*mark);
        }
        Ok(position)
    }

    pub fn get_balance(&self, account_id: AccountId, currency: &Currency) -> Result<Balance> {
        self.book_handle(account_id)?
            .lock()
            .balance(currency)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("balance {currency}")))
    }

    pub fn trades(&self, account_id: AccountId) -> Result<Vec<Trade>> {
        Ok(self.book_handle(account_id)?.lock().trades.clone())
    }

    pub fn set_mark_price(&self, symbol: Symbol, price: Decimal) {
        self.marks.write().insert(symbol, price);
    }

    // ── risk events & reconciliation review ─────────────────────────

    pub fn list_risk_events(
        &self,
        account_id: AccountId,
        status: Option<RiskEventStatus>,
    ) -> Vec<RiskEvent> {
        self.risk_events.list(account_id, status)
    }

    pub fn acknowledge_risk_event(&self, id: Uuid, reviewer: impl Into<String>) -> Result<()> {
        let reviewer = reviewer.into();
        self.risk_events.acknowledge(id, reviewer.clone())?;
        if let Some(event) = self.risk_events.get(id) {
            self.audit.append(
                Some(event.account_id),
                AuditAction::RiskEventAcknowledged { event_id: id, reviewer },
            );
        }
        Ok(())
    }

    pub fn resolve_risk_event(&self, id: Uuid, notes: impl Into<String>) -> Result<()> {
        self.risk_events.resolve(id, notes)?;
        if let Some(event) = self.risk_events.get(id) {
            self.audit.append(
                Some(event.account_id),
                AuditAction::RiskEventResolved { event_id: id },
            );
        }
        Ok(())
    }

    pub fn reconciliation_records(&self, account_id: AccountId) -> Vec<ReconciliationRecord> {
        self.reconciliation.records_for(account_id)
    }

    pub fn resolve_reconciliation(&self, record_id: Uuid, notes: impl Into<String>) -> Result<()> {
        self.reconciliation.resolve(record_id, notes)?;
        self.audit
            .append(None, AuditAction::ReconciliationResolved { record_id });
        Ok(())
    }

    // ── reconciliation schedule ──────────────────────────────────────

    /// Reconcile one account against a snapshot already in hand. Takes the
    /// account lock only for the read-then-correct window.
    pub fn reconcile_snapshot(&self, snapshot: &AccountSnapshot) -> Result<PassSummary> {
        let handle = self.book_handle(snapshot.account_id)?;
        let mut book = handle.lock();
        // value open positions at current marks before comparing
        let marks = self.marks.read().clone();
        for position in book.positions.values_mut() {
            if let Some(mark) = marks.get(&position.symbol) {
                position.mark_to_market(*mark);
            }
        }
        Ok(self
            .reconciliation
            .reconcile(&mut book, snapshot, &self.risk_events, &self.audit))
    }

    /// Fetch the venue snapshot (outside any lock) and reconcile.
    pub async fn reconcile_account(
        &self,
        adapter: &dyn ExchangeAdapter,
        account_id: AccountId,
    ) -> Result<PassSummary> {
        let snapshot = adapter.fetch_snapshot(account_id).await?;
        self.reconcile_snapshot(&snapshot)
    }

    /// Drive the engine: drain adapter events and run the reconciliation
    /// schedule. Returns when the adapter closes its event channel.
    pub async fn run(self: Arc<Self>, adapter: Arc<dyn ExchangeAdapter>) -> Result<()> {
        let (tx, rx) = flume::unbounded();
        adapter.subscribe_events(tx).await?;
        info!(exchange = adapter.name(), "engine running");

        let scheduler = tokio::spawn({
            let engine = Arc::clone(&self);
            let adapter = Arc::clone(&adapter);
            async move {
                let period = Duration::from_secs(engine.config.reconciliation.interval_secs);
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let passes = engine.account_ids().into_iter().map(|account_id| {
                        let engine = Arc::clone(&engine);
                        let adapter = Arc::clone(&adapter);
                        async move {
                            if let Err(e) =
                                engine.reconcile_account(adapter.as_ref(), account_id).await
                            {
                                warn!(account = %account_id, error = %e, "reconciliation pass failed");
                            }
                        }
                    });
                    futures::future::join_all(passes).await;
                }
            }
        });

        while let Ok(event) = rx.recv_async().await {
            self.handle_event(event);
        }
        scheduler.abort();
        info!("event channel closed, engine stopped");
        Ok(())
    }

    fn book_handle(&self, account_id: AccountId) -> Result<Arc<Mutex<AccountBook>>> {
        self.books
            .read()
            .get(&account_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("account {account_id}")))
    }
}
