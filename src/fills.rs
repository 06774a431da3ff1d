//! Fill aggregator - turns execution reports into ledger mutations.
//!
//! One fill touches four tables: the order row, the position row, two or
//! three balance rows, and the trade log. All of them commit as one unit or
//! not at all: the aggregator works on a cloned draft of the account book
//! and swaps it in only when every step succeeded.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::adapter::FillReport;
use crate::book::AccountBook;
use crate::error::{Error, Result};
use crate::types::{Side, Trade};

/// Apply one execution report to the book. Returns the recorded trade.
///
/// Idempotent on `exchange_trade_id`: a redelivered report returns
/// `Error::DuplicateFill` and leaves the book untouched. Any other failure
/// (overfill, terminal order, fee overdraft) also leaves the book
/// untouched; the caller decides whether to quarantine.
pub fn ingest_fill(
    book: &mut AccountBook,
    report: &FillReport,
    margin_fraction: Decimal,
    now: DateTime<Utc>,
) -> Result<Trade> {
    book.ensure_unfrozen()?;

    if book.seen_trade_ids.contains(&report.exchange_trade_id) {
        return Err(Error::DuplicateFill {
            exchange_trade_id: report.exchange_trade_id.clone(),
        });
    }

    let mut draft = book.clone();
    let trade = apply_to_draft(&mut draft, report, margin_fraction, now)?;
    *book = draft;
    Ok(trade)
}

fn apply_to_draft(
    draft: &mut AccountBook,
    report: &FillReport,
    margin_fraction: Decimal,
    now: DateTime<Utc>,
) -> Result<Trade> {
    let order = draft
        .orders
        .get_mut(&report.order_id)
        .ok_or_else(|| Error::NotFound(format!("order {}", report.order_id)))?;

    if order.symbol != report.symbol || order.side != report.side {
        return Err(Error::Validation(format!(
            "fill {} does not match order {}: {} {} vs {} {}",
            report.exchange_trade_id,
            order.id,
            report.side,
            report.symbol,
            order.side,
            order.symbol
        )));
    }

    order.apply_fill(report.quantity, report.price, now)?;
    let lock_price = order.lock_price.unwrap_or(report.price);
    let symbol = order.symbol.clone();
    let side = order.side;

    let base = symbol
        .base()
        .ok_or_else(|| Error::Validation(format!("symbol {symbol} has no base leg")))?;
    let quote = symbol
        .quote()
        .ok_or_else(|| Error::Validation(format!("symbol {symbol} has no quote leg")))?;

    // Settle the two legs. Funds were locked at admission against
    // `lock_price`; the locked tranche for this fill is released first and
    // the executed amount is then debited, so price improvement flows back
    // to the available leg.
    let notional = report.quantity * report.price;
    match side {
        Side::Buy => {
            let locked_tranche = report.quantity * lock_price;
            let quote_row = draft.balance_mut(&quote);
            quote_row.unlock(locked_tranche)?;
            quote_row.debit_available(notional)?;
            draft.balance_mut(&base).credit(report.quantity)?;
        }
        Side::Sell => {
            draft.balance_mut(&base).spend_locked(report.quantity)?;
            draft.balance_mut(&quote).credit(notional)?;
        }
    }

    // Fee comes out of available balance in the fee currency, at ingestion
    // time, independent of the settlement legs.
    if report.fee > Decimal::ZERO {
        draft
            .balance_mut(&report.fee_currency)
            .debit_available(report.fee)?;
    }

    let position = draft.position_mut(&symbol);
    let realized = position.apply_trade(side, report.quantity, report.price, now);
    position.update_margin(margin_fraction);

    draft.daily.roll(now);
    draft.daily.realized_pnl += realized;

    let trade = Trade {
        id: Uuid::new_v4(),
        exchange_trade_id: report.exchange_trade_id.clone(),
        order_id: report.order_id,
        account_id: draft.account.id,
        symbol,
        side,
        quantity: report.quantity,
        price: report.price,
        fee: report.fee,
        fee_currency: report.fee_currency.clone(),
        realized_pnl: realized,
        reconciled: false,
        executed_at: report.executed_at,
        recorded_at: now,
    };
    draft.trades.push(trade.clone());
    draft
        .seen_trade_ids
        .insert(report.exchange_trade_id.clone());

    tracing::debug!(
        order = %report.order_id,
        trade = %report.exchange_trade_id,
        qty = %report.quantity,
        price = %report.price,
        "fill applied"
    );
    Ok(trade)
}
