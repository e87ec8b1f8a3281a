//! Treasury metric calculation.
//!
//! Pure and deterministic: the same function backs `/simulate/local`, the
//! `local` subcommand and the `runner` subcommand executed inside sandboxes,
//! so local and remote results are bit-identical for the same input.

use crate::simulation::types::{
    Account, AccountCategory, ForecastItem, Metrics, Policy, SimulationMode,
    SimulationParameters, TransferDetails,
};

/// Forecast days considered when no horizon is given.
pub const DEFAULT_HORIZON_DAYS: usize = 7;

/// Coverage reported when there is no projected outflow.
pub const UNBOUNDED_COVERAGE_DAYS: f64 = 999.0;

const MAINTAIN: &str = "Maintain current positions";

impl SimulationMode {
    fn default_risk_multiplier(&self) -> f64 {
        match self {
            Self::Conservative => 1.5,
            Self::Balanced => 1.2,
            Self::Aggressive => 1.0,
            Self::Custom => 1.3,
        }
    }

    fn default_transfer_threshold(&self) -> f64 {
        match self {
            Self::Conservative => 0.8,
            Self::Balanced => 0.6,
            Self::Aggressive => 0.4,
            Self::Custom => 0.7,
        }
    }
}

/// Overrides set to zero count as unset.
fn nonzero(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v != 0.0)
}

fn appetite_multiplier(label: &str) -> f64 {
    match label {
        "low" => 1.5,
        "high" => 1.0,
        _ => 1.2,
    }
}

/// Compute the metrics for one scenario.
pub fn compute(
    mode: SimulationMode,
    accounts: &[Account],
    forecast: &[ForecastItem],
    policy: &Policy,
    parameters: Option<&SimulationParameters>,
) -> Metrics {
    let defaults = SimulationParameters::default();
    let params = parameters.unwrap_or(&defaults);

    let total_cash: f64 = accounts.iter().map(|a| a.balance).sum();
    let checking = accounts
        .iter()
        .find(|a| a.account_type == AccountCategory::Checking);
    let high_yield = accounts
        .iter()
        .find(|a| a.account_type == AccountCategory::HighYield);
    let checking_balance = checking.map(|a| a.balance).unwrap_or(0.0);

    let horizon = match params.investment_horizon_days {
        Some(days) if days >= 1 => days as usize,
        _ => DEFAULT_HORIZON_DAYS,
    };
    let window = &forecast[..horizon.min(forecast.len())];
    let horizon_outflow: f64 = window.iter().map(|f| f.outflow).sum();
    let avg_daily_outflow = if window.is_empty() {
        0.0
    } else {
        horizon_outflow / window.len() as f64
    };

    let risk_multiplier = nonzero(params.custom_risk_multiplier).unwrap_or_else(|| {
        match params.risk_appetite.as_deref().filter(|label| !label.is_empty()) {
            Some(label) => appetite_multiplier(label),
            None => mode.default_risk_multiplier(),
        }
    });
    let transfer_threshold = nonzero(params.custom_transfer_threshold)
        .unwrap_or_else(|| mode.default_transfer_threshold());

    let buffer = match nonzero(params.liquidity_threshold_pct) {
        Some(pct) => policy.min_liquidity.max(total_cash * pct / 100.0),
        None => policy.min_liquidity + horizon_outflow * risk_multiplier,
    };

    let idle_cash = (checking_balance - buffer).max(0.0);
    let idle_cash_pct = if total_cash > 0.0 {
        idle_cash / total_cash * 100.0
    } else {
        0.0
    };

    let coverage_days = if avg_daily_outflow > 0.0 {
        total_cash / avg_daily_outflow
    } else {
        UNBOUNDED_COVERAGE_DAYS
    };

    let (amount, recommendation, transfer) =
        if idle_cash > policy.invest_above * transfer_threshold {
            let amount = idle_cash * transfer_threshold;
            let from = checking.map(|a| a.name.as_str()).unwrap_or("Checking");
            let to = high_yield
                .map(|a| a.name.as_str())
                .unwrap_or("High-Yield account");
            let recommendation = format!(
                "Transfer ${} from {} to {}",
                format_thousands(amount),
                from,
                to
            );
            (amount, recommendation, (from.to_string(), to.to_string()))
        } else {
            (0.0, MAINTAIN.to_string(), (String::new(), String::new()))
        };

    let est_yield_bps = if amount > 0.0 && total_cash > 0.0 {
        (amount * 500.0 / total_cash).floor() as i64
    } else {
        0
    };

    let shortfall = match mode {
        SimulationMode::Aggressive => (5.0 + idle_cash_pct * 0.3).min(15.0),
        SimulationMode::Conservative => (8.0 - coverage_days * 0.2).max(2.0),
        SimulationMode::Balanced | SimulationMode::Custom => {
            5.0 + ((15.0 - coverage_days) * 0.3).max(0.0)
        }
    };
    let shortfall = shortfall.clamp(1.0, 20.0);

    Metrics {
        idle_cash_pct: round_to(idle_cash_pct, 2),
        liquidity_coverage_days: round_to(coverage_days, 1),
        est_yield_bps,
        shortfall_risk_pct: round_to(shortfall, 1),
        recommendation,
        transfer_details: TransferDetails {
            from_account: transfer.0,
            to_account: transfer.1,
            amount: round_to(amount, 2),
        },
    }
}

/// Round half away from zero to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Format a currency amount with thousands separators and no decimals.
pub fn format_thousands(value: f64) -> String {
    let rounded = value.round();
    let negative = rounded < 0.0;
    let digits = format!("{:.0}", rounded.abs());

    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if negative {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
