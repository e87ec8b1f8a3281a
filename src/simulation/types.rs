//! Treasury simulation data model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of bank account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountCategory {
    Checking,
    Savings,
    HighYield,
    MoneyMarket,
    Reserve,
}

impl AccountCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Savings => "savings",
            Self::HighYield => "high_yield",
            Self::MoneyMarket => "money_market",
            Self::Reserve => "reserve",
        }
    }
}

impl std::fmt::Display for AccountCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// Issuing institution.
    pub bank: String,
    pub currency: String,
    pub balance: f64,
    pub account_type: AccountCategory,
}

/// One day of the cash-flow forecast. Position in the sequence is the day
/// offset from today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastItem {
    pub id: String,
    pub date: String,
    pub inflow: f64,
    pub outflow: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    /// Cash that must never be invested.
    pub min_liquidity: f64,
    /// Idle cash above this (scaled by the transfer threshold) triggers a transfer.
    pub invest_above: f64,
    pub risk_profile: String,
}

/// Optional scenario overrides. `None` means "use the mode default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidity_threshold_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investment_horizon_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_appetite: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_risk_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_transfer_threshold: Option<f64>,
    /// Carried through to the result untouched; no formula reads it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fx_rates: Option<BTreeMap<String, f64>>,
}

/// Strategy the simulation is run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMode {
    Conservative,
    Balanced,
    Aggressive,
    Custom,
}

impl SimulationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for SimulationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single simulation job. Also the input document shipped into the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub mode: SimulationMode,
    pub accounts: Vec<Account>,
    pub forecast: Vec<ForecastItem>,
    pub policy: Policy,
    #[serde(default)]
    pub parameters: Option<SimulationParameters>,
}

impl SimulationRequest {
    /// Reject amounts the formulas cannot handle.
    pub fn validate(&self) -> Result<(), String> {
        for account in &self.accounts {
            if !account.balance.is_finite() || account.balance < 0.0 {
                return Err(format!(
                    "account '{}' balance must be a non-negative number",
                    account.id
                ));
            }
        }
        for item in &self.forecast {
            if !item.inflow.is_finite() || !item.outflow.is_finite() {
                return Err(format!("forecast item '{}' has a non-finite amount", item.id));
            }
        }
        if !self.policy.min_liquidity.is_finite() || !self.policy.invest_above.is_finite() {
            return Err("policy thresholds must be finite".to_string());
        }
        Ok(())
    }
}

/// Where the recommended transfer moves cash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferDetails {
    pub from_account: String,
    pub to_account: String,
    pub amount: f64,
}

/// Output of the calculation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub idle_cash_pct: f64,
    pub liquidity_coverage_days: f64,
    pub est_yield_bps: i64,
    pub shortfall_risk_pct: f64,
    pub recommendation: String,
    pub transfer_details: TransferDetails,
}
