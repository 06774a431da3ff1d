//! Central configuration for the ledger core.
//!
//! Loads from `config.toml` at the project root.
//! All thresholds are runtime-configurable: no recompilation needed.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Risk gate thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Daily notional limit assigned to new accounts.
    #[serde(default = "default_daily_limit")]
    pub default_daily_limit: Decimal,
    /// Per-symbol absolute position limit assigned to new accounts.
    #[serde(default = "default_position_limit")]
    pub default_position_limit: Decimal,
    /// Fraction of notional recorded as a position's margin requirement.
    #[serde(default = "default_margin_fraction")]
    pub margin_fraction: Decimal,
    /// Consecutive insufficient-funds denials before a margin call is raised.
    #[serde(default = "default_margin_call_after")]
    pub margin_call_after_denials: u32,
    /// Daily realized loss beyond which a drawdown event is raised.
    #[serde(default)]
    pub daily_loss_limit: Option<Decimal>,
}

fn default_daily_limit() -> Decimal {
    Decimal::from(100_000)
}
fn default_position_limit() -> Decimal {
    Decimal::from(100)
}
fn default_margin_fraction() -> Decimal {
    // 10% initial margin
    Decimal::new(1, 1)
}
fn default_margin_call_after() -> u32 {
    3
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: default_daily_limit(),
            default_position_limit: default_position_limit(),
            margin_fraction: default_margin_fraction(),
            margin_call_after_denials: default_margin_call_after(),
            daily_loss_limit: None,
        }
    }
}

/// Reconciliation schedule and matching tolerances.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Seconds between reconciliation passes per account.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Fallback tolerance when an asset has no entry in `tolerances`.
    #[serde(default = "default_tolerance")]
    pub default_tolerance: Decimal,
    /// Per-asset tolerance, sized to the smallest lot increment.
    #[serde(default)]
    pub tolerances: HashMap<String, Decimal>,
    /// Absolute delta above which a discrepancy raises a risk event.
    #[serde(default = "default_escalation_magnitude")]
    pub escalation_magnitude: Decimal,
    /// Apply sub-escalation balance corrections automatically (always with
    /// an audit entry and a discrepancy record).
    #[serde(default = "default_auto_correct")]
    pub auto_correct_balances: bool,
}

fn default_interval_secs() -> u64 {
    60
}
fn default_tolerance() -> Decimal {
    // 1e-8, the satoshi-sized lot increment
    Decimal::new(1, 8)
}
fn default_escalation_magnitude() -> Decimal {
    Decimal::from(100)
}
fn default_auto_correct() -> bool {
    false
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            default_tolerance: default_tolerance(),
            tolerances: HashMap::new(),
            escalation_magnitude: default_escalation_magnitude(),
            auto_correct_balances: default_auto_correct(),
        }
    }
}

impl ReconciliationConfig {
    /// Matching tolerance for an asset (currency or symbol string).
    pub fn tolerance_for(&self, asset: &str) -> Decimal {
        self.tolerances
            .get(asset)
            .copied()
            .unwrap_or(self.default_tolerance)
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

impl CoreConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Load from the default location (project root config.toml).
    pub fn load_default() -> Self {
        let candidates = [
            "config.toml",
            concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml"),
        ];

        for path in &candidates {
            if let Ok(cfg) = Self::load(Path::new(path)) {
                tracing::info!("loaded config from {}", path);
                return cfg;
            }
        }

        tracing::warn!("no config.toml found, using defaults");
        Self::default()
    }
}
