//! tally-sim: drives the ledger core end to end against a scripted venue.
//!
//! Funds an account, admits orders through the risk gate, replays fills
//! (including a duplicate delivery), then reconciles against a drifted
//! exchange snapshot and prints what the ledger concluded.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use tally_core::adapter::{
    AccountSnapshot, ExchangeAdapter, ExchangeEvent, FillReport, SnapshotBalance, SnapshotPosition,
};
use tally_core::config::CoreConfig;
use tally_core::engine::LedgerEngine;
use tally_core::order::OrderRequest;
use tally_core::types::{AccountId, Currency, OrderType, Side, Symbol};

/// Scripted venue: replays a fixed event tape, then reports a snapshot
/// with a deliberate balance drift for the reconciliation pass to find.
struct SimAdapter {
    tape: Mutex<Vec<ExchangeEvent>>,
    snapshot: Mutex<Option<AccountSnapshot>>,
}

impl SimAdapter {
    fn new(tape: Vec<ExchangeEvent>) -> Self {
        Self {
            tape: Mutex::new(tape),
            snapshot: Mutex::new(None),
        }
    }

    fn set_snapshot(&self, snapshot: AccountSnapshot) {
        *self.snapshot.lock() = Some(snapshot);
    }
}

#[async_trait]
impl ExchangeAdapter for SimAdapter {
    fn name(&self) -> &str {
        "simnet"
    }

    async fn subscribe_events(&self, tx: flume::Sender<ExchangeEvent>) -> tally_core::Result<()> {
        let tape = std::mem::take(&mut *self.tape.lock());
        tokio::spawn(async move {
            for event in tape {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                if tx.send_async(event).await.is_err() {
                    break;
                }
            }
            // tape exhausted; dropping tx ends the engine's event pump
        });
        Ok(())
    }

    async fn fetch_snapshot(&self, account_id: AccountId) -> tally_core::Result<AccountSnapshot> {
        self.snapshot
            .lock()
            .clone()
            .ok_or_else(|| tally_core::Error::NotFound(format!("snapshot for {account_id}")))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally_core=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    let config = CoreConfig::load_default();
    let engine = Arc::new(LedgerEngine::new(config));

    let btc_usdt = Symbol::new("BTC/USDT");
    let usdt = Currency::new("USDT");

    // 1. account funded with 50k USDT
    let account = engine.create_account_with_limits(
        "sim-desk",
        "simnet",
        Decimal::from(100_000),
        Decimal::from(50),
    );
    engine.deposit(account, usdt.clone(), Decimal::from(50_000))?;

    // 2. limit buy 10 BTC @ 100, admitted through the risk gate
    let order_id = engine.submit_order(OrderRequest {
        account_id: account,
        symbol: btc_usdt.clone(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        quantity: Decimal::from(10),
        price: Some(Decimal::from(100)),
        stop_price: None,
        trail_percent: None,
    })?;

    // 3. a second order, cancelled before any fill
    let doomed = engine.submit_order(OrderRequest {
        account_id: account,
        symbol: btc_usdt.clone(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        quantity: Decimal::from(2),
        price: Some(Decimal::from(95)),
        stop_price: None,
        trail_percent: None,
    })?;
    engine.cancel_order(account, doomed)?;

    // 4. an order the gate refuses (position limit is 50)
    match engine.submit_order(OrderRequest {
        account_id: account,
        symbol: btc_usdt.clone(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        quantity: Decimal::from(500),
        price: Some(Decimal::from(100)),
        stop_price: None,
        trail_percent: None,
    }) {
        Err(e) => tracing::info!("gate denied oversized order: {e}"),
        Ok(_) => anyhow::bail!("oversized order should have been denied"),
    }

    // 5. scripted venue tape: ack, two fills, and a redelivered duplicate
    let fill = |trade_id: &str, qty: i64, price: i64| {
        ExchangeEvent::Fill(FillReport {
            exchange_trade_id: trade_id.to_string(),
            order_id,
            account_id: account,
            symbol: btc_usdt.clone(),
            side: Side::Buy,
            quantity: Decimal::from(qty),
            price: Decimal::from(price),
            fee: Decimal::ONE,
            fee_currency: usdt.clone(),
            executed_at: chrono::Utc::now(),
        })
    };
    let adapter = Arc::new(SimAdapter::new(vec![
        ExchangeEvent::OrderAck {
            account_id: account,
            order_id,
            exchange_order_id: "SIM-1001".to_string(),
        },
        fill("exec-1", 4, 101),
        fill("exec-2", 6, 99),
        fill("exec-1", 4, 101), // exchange redelivery, must be dropped
    ]));

    // venue truth: matches the ledger except 250 USDT short
    adapter.set_snapshot(AccountSnapshot {
        account_id: account,
        balances: vec![
            SnapshotBalance {
                currency: usdt.clone(),
                total: Decimal::from(48_750),
            },
            SnapshotBalance {
                currency: Currency::new("BTC"),
                total: Decimal::from(10),
            },
        ],
        positions: vec![SnapshotPosition {
            symbol: btc_usdt.clone(),
            quantity: Decimal::from(10),
        }],
        open_orders: vec![],
        trade_ids: vec!["exec-1".to_string(), "exec-2".to_string()],
        taken_at: chrono::Utc::now(),
    });

    // drain the tape through the engine, then reconcile
    Arc::clone(&engine).run(Arc::clone(&adapter) as Arc<dyn ExchangeAdapter>).await?;
    let summary = engine.reconcile_account(adapter.as_ref(), account).await?;

    // 6. report
    let order = engine.get_order(account, order_id)?;
    tracing::info!(
        "order {}: {:?}, filled {} @ avg {:?}",
        order_id,
        order.status,
        order.filled_quantity,
        order.avg_fill_price
    );
    let position = engine.get_position(account, &btc_usdt)?;
    tracing::info!(
        "position {}: qty {} avg {} unrealized {}",
        btc_usdt,
        position.quantity,
        position.avg_price,
        position.unrealized_pnl
    );
    let balance = engine.get_balance(account, &usdt)?;
    tracing::info!(
        "balance {}: available {} locked {} total {}",
        usdt,
        balance.available,
        balance.locked,
        balance.total
    );
    tracing::info!(
        "reconciliation: {} compared, {} matched, {} discrepancies, {} escalated",
        summary.compared,
        summary.matched,
        summary.discrepancies,
        summary.escalated
    );
    for event in engine.list_risk_events(account, None) {
        tracing::warn!("risk event {:?} ({:?}): {:?}", event.kind, event.severity, event.detail);
    }
    let records = engine.reconciliation_records(account);
    println!("{}", serde_json::to_string_pretty(&records)?);

    anyhow::ensure!(
        engine.audit().verify_sequence(account),
        "audit sequence must be gap-free"
    );
    Ok(())
}
