//! Risk events - anomaly classification and the manual-review workflow.
//!
//! The core only ever creates events in `Open` status; acknowledgement and
//! resolution are driven by the external review workflow through the engine
//! API.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AccountId, Currency, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    PositionLimit,
    DrawdownLimit,
    ExposureLimit,
    VolatilityAlert,
    MarginCall,
    RegulatoryBreach,
    LargeLoss,
    /// Forward-compatibility escape hatch for kinds this build predates.
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventStatus {
    Open,
    Acknowledged,
    Resolved,
}

/// Typed payload per event kind. A closed enum instead of a free JSON map,
/// so handling stays exhaustive at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventDetail {
    ReconciliationMismatch {
        record_id: Uuid,
        reference: String,
        expected: Decimal,
        actual: Decimal,
        delta: Decimal,
    },
    RepeatedDenials {
        denials: u32,
        currency: Currency,
    },
    DailyLossBreach {
        realized_loss: Decimal,
        limit: Decimal,
    },
    LimitBreach {
        symbol: Option<Symbol>,
        limit: Decimal,
        attempted: Decimal,
    },
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: Uuid,
    pub account_id: AccountId,
    pub kind: RiskEventKind,
    pub severity: Severity,
    pub detail: RiskEventDetail,
    pub status: RiskEventStatus,
    pub raised_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub resolution_notes: Option<String>,
}

#[derive(Default)]
struct SinkState {
    events: HashMap<Uuid, RiskEvent>,
    // insertion order, so listings are stable
    order: Vec<Uuid>,
}

/// Collects and escalates anomalies for manual review.
#[derive(Default)]
pub struct RiskEventSink {
    state: Mutex<SinkState>,
}

impl RiskEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new event in `Open` status and return its id.
    pub fn raise(
        &self,
        account_id: AccountId,
        kind: RiskEventKind,
        severity: Severity,
        detail: RiskEventDetail,
    ) -> Uuid {
        let now = Utc::now();
        let event = RiskEvent {
            id: Uuid::new_v4(),
            account_id,
            kind: kind.clone(),
            severity,
            detail,
            status: RiskEventStatus::Open,
            raised_at: now,
            updated_at: now,
            acknowledged_by: None,
            resolution_notes: None,
        };
        match severity {
            Severity::High | Severity::Critical => {
                tracing::warn!(account = %account_id, ?kind, ?severity, "risk event raised")
            }
            _ => tracing::info!(account = %account_id, ?kind, ?severity, "risk event raised"),
        }
        let id = event.id;
        let mut state = self.state.lock();
        state.events.insert(id, event);
        state.order.push(id);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<RiskEvent> {
        self.state.lock().events.get(&id).cloned()
    }

    /// Events for an account, optionally filtered by status, in raise order.
    pub fn list(&self, account_id: AccountId, status: Option<RiskEventStatus>) -> Vec<RiskEvent> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.events.get(id))
            .filter(|e| e.account_id == account_id)
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect()
    }

    /// Open -> Acknowledged, recording the reviewer.
    pub fn acknowledge(&self, id: Uuid, reviewer: impl Into<String>) -> Result<()> {
        let mut state = self.state.lock();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("risk event {id}")))?;
        if event.status != RiskEventStatus::Open {
            return Err(Error::Validation(format!(
                "risk event {id} is {:?}, expected open",
                event.status
            )));
        }
        event.status = RiskEventStatus::Acknowledged;
        event.acknowledged_by = Some(reviewer.into());
        event.updated_at = Utc::now();
        Ok(())
    }

    /// Open or Acknowledged -> Resolved, with reviewer notes.
    pub fn resolve(&self, id: Uuid, notes: impl Into<String>) -> Result<()> {
        let mut state = self.state.lock();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("risk event {id}")))?;
        if event.status == RiskEventStatus::Resolved {
            return Err(Error::Validation(format!("risk event {id} already resolved")));
        }
        event.status = RiskEventStatus::Resolved;
        event.resolution_notes = Some(notes.into());
        event.updated_at = Utc::now();
        Ok(())
    }

    /// Drop an account's events as part of orchestrated account deletion.
    pub fn purge_account(&self, account_id: AccountId) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<Uuid> = state
            .events
            .values()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            state.events.remove(id);
        }
        state.order.retain(|id| !doomed.contains(id));
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_with_event() -> (RiskEventSink, AccountId, Uuid) {
        let sink = RiskEventSink::new();
        let account = AccountId::new();
        let id = sink.raise(
            account,
            RiskEventKind::MarginCall,
            Severity::High,
            RiskEventDetail::RepeatedDenials {
                denials: 3,
                currency: Currency::new("USDT"),
            },
        );
        (sink, account, id)
    }

    #[test]
    fn review_workflow_transitions() {
        let (sink, _, id) = sink_with_event();

        sink.acknowledge(id, "ops-desk").unwrap();
        assert_eq!(sink.get(id).unwrap().status, RiskEventStatus::Acknowledged);

        // cannot acknowledge twice
        assert!(sink.acknowledge(id, "ops-desk").is_err());

        sink.resolve(id, "confirmed with venue").unwrap();
        let event = sink.get(id).unwrap();
        assert_eq!(event.status, RiskEventStatus::Resolved);
        assert_eq!(event.resolution_notes.as_deref(), Some("confirmed with venue"));

        assert!(sink.resolve(id, "again").is_err());
    }

    #[test]
    fn list_filters_by_status() {
        let (sink, account, id) = sink_with_event();
        sink.raise(
            account,
            RiskEventKind::ExposureLimit,
            Severity::Low,
            RiskEventDetail::Other("drift".into()),
        );
        sink.resolve(id, "done").unwrap();

        assert_eq!(sink.list(account, None).len(), 2);
        assert_eq!(sink.list(account, Some(RiskEventStatus::Open)).len(), 1);
        assert_eq!(sink.list(account, Some(RiskEventStatus::Resolved)).len(), 1);
    }
}
