//! End-to-end scenarios through the public engine API: the full
//! admission -> fill -> settlement -> reconciliation path.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use tally_core::adapter::{
    AccountSnapshot, ExchangeAdapter, ExchangeEvent, FillReport, SnapshotBalance, SnapshotPosition,
};
use tally_core::config::CoreConfig;
use tally_core::engine::LedgerEngine;
use tally_core::error::Error;
use tally_core::events::{RiskEventKind, RiskEventStatus};
use tally_core::order::OrderRequest;
use tally_core::reconcile::ReconStatus;
use tally_core::types::{AccountId, Currency, OrderStatus, OrderType, Side, Symbol};

fn btc_usdt() -> Symbol {
    Symbol::new("BTC/USDT")
}

fn usdt() -> Currency {
    Currency::new("USDT")
}

/// Engine with one account funded with 50k USDT.
fn setup() -> (LedgerEngine, AccountId) {
    let engine = LedgerEngine::new(CoreConfig::default());
    let account =
        engine.create_account_with_limits("alice", "simnet", dec!(100_000), dec!(50));
    engine.deposit(account, usdt(), dec!(50_000)).unwrap();
    (engine, account)
}

fn limit_buy(account: AccountId, quantity: Decimal, price: Decimal) -> OrderRequest {
    OrderRequest {
        account_id: account,
        symbol: btc_usdt(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        quantity,
        price: Some(price),
        stop_price: None,
        trail_percent: None,
    }
}

fn fill(
    engine: &LedgerEngine,
    account: AccountId,
    order_id: tally_core::types::OrderId,
    trade_id: &str,
    quantity: Decimal,
    price: Decimal,
) {
    engine.handle_event(ExchangeEvent::Fill(FillReport {
        exchange_trade_id: trade_id.to_string(),
        order_id,
        account_id: account,
        symbol: btc_usdt(),
        side: Side::Buy,
        quantity,
        price,
        fee: Decimal::ZERO,
        fee_currency: usdt(),
        executed_at: chrono::Utc::now(),
    }));
}

#[test]
fn approved_order_becomes_open_with_funds_locked() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();

    let order = engine.get_order(account, order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Open);
    assert!(order.risk_approved);
    assert_eq!(order.remaining_quantity, dec!(10));

    let balance = engine.get_balance(account, &usdt()).unwrap();
    assert_eq!(balance.locked, dec!(1_000));
    assert_eq!(balance.total, dec!(50_000));
}

#[test]
fn partial_then_full_fill_settles_order_position_and_balance() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();

    fill(&engine, account, order_id, "exec-1", dec!(4), dec!(101));
    let order = engine.get_order(account, order_id).unwrap();
    assert_eq!(order.status, OrderStatus::PartiallyFilled);
    assert_eq!(order.filled_quantity, dec!(4));
    assert_eq!(order.remaining_quantity, dec!(6));
    assert_eq!(order.avg_fill_price, Some(dec!(101)));
    let position = engine.get_position(account, &btc_usdt()).unwrap();
    assert_eq!(position.quantity, dec!(4));
    assert_eq!(position.avg_price, dec!(101));

    fill(&engine, account, order_id, "exec-2", dec!(6), dec!(99));
    let order = engine.get_order(account, order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_quantity, dec!(10));
    assert_eq!(order.remaining_quantity, Decimal::ZERO);
    assert_eq!(order.avg_fill_price, Some(dec!(99.8)));
    let position = engine.get_position(account, &btc_usdt()).unwrap();
    assert_eq!(position.quantity, dec!(10));
    assert_eq!(position.avg_price, dec!(99.8));

    // 50_000 - 4*101 - 6*99 = 49_002, nothing left locked
    let balance = engine.get_balance(account, &usdt()).unwrap();
    assert_eq!(balance.total, dec!(49_002));
    assert_eq!(balance.locked, Decimal::ZERO);
    let btc = engine.get_balance(account, &Currency::new("BTC")).unwrap();
    assert_eq!(btc.total, dec!(10));
}

#[test]
fn duplicate_fill_delivery_changes_ledger_exactly_once() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();

    fill(&engine, account, order_id, "exec-1", dec!(4), dec!(101));
    let order_before = engine.get_order(account, order_id).unwrap();
    let balance_before = engine.get_balance(account, &usdt()).unwrap();

    // exchange redelivers the same execution id
    fill(&engine, account, order_id, "exec-1", dec!(4), dec!(101));

    let order = engine.get_order(account, order_id).unwrap();
    assert_eq!(order.filled_quantity, order_before.filled_quantity);
    let balance = engine.get_balance(account, &usdt()).unwrap();
    assert_eq!(balance.total, balance_before.total);
    assert_eq!(engine.trades(account).unwrap().len(), 1);
}

#[test]
fn risk_denial_is_synchronous_and_terminal() {
    let (engine, account) = setup();
    // position limit is 50
    let err = engine
        .submit_order(limit_buy(account, dec!(500), dec!(100)))
        .unwrap_err();
    assert!(matches!(err, Error::RiskRejected(_)));

    // the denied order is persisted as rejected, audited, and no funds move
    let book = engine.book_snapshot(account).unwrap();
    let rejected: Vec<_> = book
        .orders
        .values()
        .filter(|o| o.status == OrderStatus::Rejected)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert!(!rejected[0].risk_approved);
    assert_eq!(book.balance(&usdt()).unwrap().locked, Decimal::ZERO);

    // a position-limit breach is also surfaced for review
    let events = engine.list_risk_events(account, Some(RiskEventStatus::Open));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RiskEventKind::PositionLimit);
}

#[test]
fn daily_limit_denies_after_notional_is_used_up() {
    let engine = LedgerEngine::new(CoreConfig::default());
    let account = engine.create_account_with_limits("bob", "simnet", dec!(1_500), dec!(50));
    engine.deposit(account, usdt(), dec!(50_000)).unwrap();

    engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();
    let err = engine
        .submit_order(limit_buy(account, dec!(10), dec!(100)))
        .unwrap_err();
    match err {
        Error::RiskRejected(reason) => {
            assert!(reason.to_string().contains("daily limit"), "{reason}")
        }
        other => panic!("expected risk rejection, got {other}"),
    }
}

#[test]
fn cancel_of_filled_order_fails_without_state_change() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();
    fill(&engine, account, order_id, "exec-1", dec!(10), dec!(100));

    let err = engine.cancel_order(account, order_id).unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert_eq!(
        engine.get_order(account, order_id).unwrap().status,
        OrderStatus::Filled
    );
}

#[test]
fn cancel_releases_the_unfilled_remainder() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();
    fill(&engine, account, order_id, "exec-1", dec!(4), dec!(100));

    engine.cancel_order(account, order_id).unwrap();
    assert_eq!(
        engine.get_order(account, order_id).unwrap().status,
        OrderStatus::Cancelled
    );
    let balance = engine.get_balance(account, &usdt()).unwrap();
    assert_eq!(balance.locked, Decimal::ZERO);
    assert_eq!(balance.total, dec!(49_600));
}

#[test]
fn overfill_is_quarantined_not_applied() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();
    fill(&engine, account, order_id, "exec-1", dec!(9), dec!(100));

    // venue claims 5 more than the order has remaining
    fill(&engine, account, order_id, "exec-overfill", dec!(6), dec!(100));

    let order = engine.get_order(account, order_id).unwrap();
    assert_eq!(order.filled_quantity, dec!(9));
    assert_eq!(engine.trades(account).unwrap().len(), 1);

    let records = engine.reconciliation_records(account);
    assert!(records
        .iter()
        .any(|r| r.status == ReconStatus::Discrepancy && r.reference == "exec-overfill"));
}

#[test]
fn drifted_snapshot_produces_discrepancy_with_expected_and_actual() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();
    fill(&engine, account, order_id, "exec-1", dec!(10), dec!(100));

    let internal_total = engine.get_balance(account, &usdt()).unwrap().total;
    let snapshot = AccountSnapshot {
        account_id: account,
        balances: vec![
            SnapshotBalance {
                currency: usdt(),
                total: internal_total - dec!(5),
            },
            SnapshotBalance {
                currency: Currency::new("BTC"),
                total: dec!(10),
            },
        ],
        positions: vec![SnapshotPosition {
            symbol: btc_usdt(),
            quantity: dec!(10),
        }],
        open_orders: vec![],
        trade_ids: vec!["exec-1".to_string()],
        taken_at: chrono::Utc::now(),
    };

    let summary = engine.reconcile_snapshot(&snapshot).unwrap();
    assert_eq!(summary.discrepancies, 1);
    // 5 below the default escalation magnitude of 100: record only
    assert_eq!(summary.escalated, 0);
    assert!(engine.list_risk_events(account, None).is_empty());

    let records = engine.reconciliation_records(account);
    let disc = records
        .iter()
        .find(|r| r.status == ReconStatus::Discrepancy)
        .unwrap();
    assert_eq!(disc.expected, internal_total);
    assert_eq!(disc.actual, internal_total - dec!(5));

    // the venue-acknowledged trade is now marked reconciled
    assert!(engine.trades(account).unwrap()[0].reconciled);
}

#[test]
fn large_drift_escalates_to_risk_event_and_review_workflow() {
    let (engine, account) = setup();
    let snapshot = AccountSnapshot {
        account_id: account,
        balances: vec![SnapshotBalance {
            currency: usdt(),
            total: dec!(49_000), // 1_000 short of the internal 50_000
        }],
        positions: vec![],
        open_orders: vec![],
        trade_ids: vec![],
        taken_at: chrono::Utc::now(),
    };

    let summary = engine.reconcile_snapshot(&snapshot).unwrap();
    assert_eq!(summary.escalated, 1);

    let events = engine.list_risk_events(account, Some(RiskEventStatus::Open));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RiskEventKind::LargeLoss);

    // manual review: acknowledge then resolve
    engine.acknowledge_risk_event(events[0].id, "ops").unwrap();
    engine.resolve_risk_event(events[0].id, "venue ticket 4711").unwrap();
    assert!(engine
        .list_risk_events(account, Some(RiskEventStatus::Open))
        .is_empty());

    let record = engine
        .reconciliation_records(account)
        .into_iter()
        .find(|r| r.status == ReconStatus::Discrepancy)
        .unwrap();
    engine
        .resolve_reconciliation(record.id, "venue ticket 4711")
        .unwrap();
}

#[test]
fn matching_snapshot_reconciles_clean() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();
    fill(&engine, account, order_id, "exec-1", dec!(4), dec!(101));
    fill(&engine, account, order_id, "exec-2", dec!(6), dec!(99));

    let book = engine.book_snapshot(account).unwrap();
    let snapshot = AccountSnapshot {
        account_id: account,
        balances: book
            .balances
            .values()
            .map(|b| SnapshotBalance {
                currency: b.currency.clone(),
                total: b.total,
            })
            .collect(),
        positions: book
            .positions
            .values()
            .map(|p| SnapshotPosition {
                symbol: p.symbol.clone(),
                quantity: p.quantity,
            })
            .collect(),
        open_orders: vec![],
        trade_ids: vec!["exec-1".to_string(), "exec-2".to_string()],
        taken_at: chrono::Utc::now(),
    };

    let summary = engine.reconcile_snapshot(&snapshot).unwrap();
    assert_eq!(summary.discrepancies, 0);
    assert!(engine.list_risk_events(account, None).is_empty());
}

#[test]
fn repeated_funds_denials_raise_a_margin_call() {
    let engine = LedgerEngine::new(CoreConfig::default());
    let account = engine.create_account_with_limits("carol", "simnet", dec!(1_000_000), dec!(500));
    engine.deposit(account, usdt(), dec!(100)).unwrap();

    // default threshold is 3 consecutive insufficient-funds denials
    for _ in 0..3 {
        let err = engine
            .submit_order(limit_buy(account, dec!(10), dec!(100)))
            .unwrap_err();
        assert!(matches!(err, Error::RiskRejected(_)));
    }

    let events = engine.list_risk_events(account, Some(RiskEventStatus::Open));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RiskEventKind::MarginCall);
}

#[test]
fn audit_trail_is_sequential_and_survives_deletion() {
    let (engine, account) = setup();
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();
    fill(&engine, account, order_id, "exec-1", dec!(10), dec!(100));

    // flatten: sell the position so nothing is encumbered
    let sell_id = engine
        .submit_order(OrderRequest {
            account_id: account,
            symbol: btc_usdt(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            quantity: dec!(10),
            price: Some(dec!(100)),
            stop_price: None,
            trail_percent: None,
        })
        .unwrap();
    engine.handle_event(ExchangeEvent::Fill(FillReport {
        exchange_trade_id: "exec-flat".to_string(),
        order_id: sell_id,
        account_id: account,
        symbol: btc_usdt(),
        side: Side::Sell,
        quantity: dec!(10),
        price: dec!(100),
        fee: Decimal::ZERO,
        fee_currency: usdt(),
        executed_at: chrono::Utc::now(),
    }));

    assert!(engine.audit().verify_sequence(account));
    let entries_before = engine.audit().entries_for(account).len();
    assert!(entries_before > 0);

    engine.delete_account(account).unwrap();
    assert!(engine.get_balance(account, &usdt()).is_err());
    // audit history is retained past deletion
    assert!(engine.audit().entries_for(account).len() > entries_before);
}

#[test]
fn suspended_account_cannot_trade() {
    let (engine, account) = setup();
    engine
        .set_account_status(account, tally_core::types::AccountStatus::Suspended)
        .unwrap();

    let err = engine
        .submit_order(limit_buy(account, dec!(1), dec!(100)))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    engine
        .set_account_status(account, tally_core::types::AccountStatus::Active)
        .unwrap();
    engine.submit_order(limit_buy(account, dec!(1), dec!(100))).unwrap();
}

#[test]
fn withdrawal_refused_while_encumbered() {
    let (engine, account) = setup();
    engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();

    let err = engine.withdraw(account, usdt(), dec!(100)).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

/// Minimal venue stub for exercising the async run loop end to end.
struct TapeAdapter {
    tape: parking_lot::Mutex<Vec<ExchangeEvent>>,
    snapshot: AccountSnapshot,
}

#[async_trait::async_trait]
impl ExchangeAdapter for TapeAdapter {
    fn name(&self) -> &str {
        "tape"
    }

    async fn subscribe_events(&self, tx: flume::Sender<ExchangeEvent>) -> tally_core::Result<()> {
        let tape = std::mem::take(&mut *self.tape.lock());
        tokio::spawn(async move {
            for event in tape {
                let _ = tx.send_async(event).await;
            }
        });
        Ok(())
    }

    async fn fetch_snapshot(&self, _account_id: AccountId) -> tally_core::Result<AccountSnapshot> {
        Ok(self.snapshot.clone())
    }
}

#[tokio::test]
async fn run_drains_the_adapter_tape_in_order() {
    let (engine, account) = setup();
    let engine = Arc::new(engine);
    let order_id = engine.submit_order(limit_buy(account, dec!(10), dec!(100))).unwrap();

    let mk_fill = |trade_id: &str, qty: Decimal, price: Decimal| {
        ExchangeEvent::Fill(FillReport {
            exchange_trade_id: trade_id.to_string(),
            order_id,
            account_id: account,
            symbol: btc_usdt(),
            side: Side::Buy,
            quantity: qty,
            price,
            fee: Decimal::ZERO,
            fee_currency: usdt(),
            executed_at: chrono::Utc::now(),
        })
    };
    let adapter = Arc::new(TapeAdapter {
        tape: parking_lot::Mutex::new(vec![
            ExchangeEvent::OrderAck {
                account_id: account,
                order_id,
                exchange_order_id: "X-1".to_string(),
            },
            mk_fill("exec-1", dec!(4), dec!(101)),
            mk_fill("exec-2", dec!(6), dec!(99)),
        ]),
        snapshot: AccountSnapshot {
            account_id: account,
            balances: vec![],
            positions: vec![],
            open_orders: vec![],
            trade_ids: vec![],
            taken_at: chrono::Utc::now(),
        },
    });

    Arc::clone(&engine)
        .run(adapter as Arc<dyn ExchangeAdapter>)
        .await
        .unwrap();

    let order = engine.get_order(account, order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.avg_fill_price, Some(dec!(99.8)));
    assert_eq!(order.exchange_order_id.as_deref(), Some("X-1"));
}
