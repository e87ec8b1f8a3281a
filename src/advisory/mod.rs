//! Advisory reasoning over computed metrics.
//!
//! The advisory step asks an LLM to comment on a simulation result. It is
//! strictly best-effort: a missing credential or a provider failure yields
//! an [`Advisory`] with `enabled = false` and the job still succeeds on its
//! metrics alone.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::simulation::engine::format_thousands;
use crate::simulation::{Account, ForecastItem, Metrics, Policy, SimulationMode};

const SYSTEM_PROMPT: &str = "You are an expert treasury analyst AI agent embedded in a simulation sandbox. Provide precise, data-driven analysis.";

const SKIPPED_REASONING: &str = "Advisory analysis skipped - no API key provided";
const DEFAULT_REASONING: &str = "Analysis completed based on calculated metrics.";
const DEFAULT_RISK: &str = "MEDIUM";
const UNKNOWN_RISK: &str = "UNKNOWN";
const DEFAULT_CONFIDENCE: f64 = 0.75;
const DEGRADED_CONFIDENCE: f64 = 0.5;

/// Forecast days summarized in the prompt.
const PROMPT_FORECAST_DAYS: usize = 7;

/// Labels in the order they appear in a well-formed reply.
const LABELS: [&str; 4] = [
    "RECOMMENDATION:",
    "REASONING:",
    "RISK_ASSESSMENT:",
    "CONFIDENCE:",
];

static CONFIDENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CONFIDENCE:\s*([\d.]+)").expect("static regex"));

/// Result of the advisory step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Advisory {
    pub recommendation: String,
    pub reasoning: String,
    pub risk_assessment: String,
    pub confidence: f64,
    /// False when the advisory was skipped or degraded.
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Advisory {
    fn skipped(metrics: &Metrics) -> Self {
        Self {
            recommendation: metrics.recommendation.clone(),
            reasoning: SKIPPED_REASONING.to_string(),
            risk_assessment: UNKNOWN_RISK.to_string(),
            confidence: DEGRADED_CONFIDENCE,
            enabled: false,
            raw_response: None,
            error: None,
        }
    }

    fn failed(metrics: &Metrics, error: impl std::fmt::Display) -> Self {
        let error = error.to_string();
        Self {
            recommendation: metrics.recommendation.clone(),
            reasoning: format!(
                "Advisory analysis failed: {}. Using calculated metrics only.",
                error
            ),
            risk_assessment: UNKNOWN_RISK.to_string(),
            confidence: DEGRADED_CONFIDENCE,
            enabled: false,
            raw_response: None,
            error: Some(error),
        }
    }
}

/// Runs the advisory step against an optional provider.
#[derive(Clone)]
pub struct Advisor {
    provider: Option<Arc<dyn LlmProvider>>,
    max_tokens: u32,
}

impl Advisor {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            provider,
            max_tokens: 1024,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Produce an advisory for the given metrics. Never fails.
    pub async fn analyze(
        &self,
        metrics: &Metrics,
        mode: SimulationMode,
        accounts: &[Account],
        policy: &Policy,
        forecast: &[ForecastItem],
    ) -> Advisory {
        let Some(provider) = &self.provider else {
            tracing::info!(mode = %mode, "No advisory credential, skipping analysis");
            return Advisory::skipped(metrics);
        };

        let prompt = build_prompt(metrics, mode, accounts, policy, forecast);
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_system(SYSTEM_PROMPT)
            .with_max_tokens(self.max_tokens);

        tracing::info!(mode = %mode, model = %provider.model_name(), "Requesting advisory analysis");

        match provider.complete(request).await {
            Ok(response) => parse_reply(&response.content, metrics),
            Err(e) => {
                tracing::warn!(mode = %mode, error = %e, "Advisory analysis failed, using metrics only");
                Advisory::failed(metrics, e)
            }
        }
    }
}

fn build_prompt(
    metrics: &Metrics,
    mode: SimulationMode,
    accounts: &[Account],
    policy: &Policy,
    forecast: &[ForecastItem],
) -> String {
    let total_cash: f64 = accounts.iter().map(|a| a.balance).sum();
    let window = &forecast[..PROMPT_FORECAST_DAYS.min(forecast.len())];
    let inflow: f64 = window.iter().map(|f| f.inflow).sum();
    let outflow: f64 = window.iter().map(|f| f.outflow).sum();

    let account_lines = accounts
        .iter()
        .map(|a| {
            format!(
                "- {} ({}): ${}",
                a.name,
                a.account_type,
                format_thousands(a.balance)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are a treasury analyst reviewing a completed treasury simulation. Provide expert analysis of the result.

**SIMULATION MODE:** {mode}

**CALCULATED METRICS:**
- Idle Cash: {idle}%
- Liquidity Coverage: {coverage} days
- Estimated Yield: {bps} basis points
- Shortfall Risk: {shortfall}%
- Transfer Amount: ${amount}

**ACCOUNT CONTEXT:**
Total Cash Position: ${total}
{account_lines}

**TREASURY POLICY:**
- Minimum Liquidity Required: ${min_liquidity}
- Invest Above Threshold: ${invest_above}
- Risk Profile: {risk_profile}

**7-DAY FORECAST:**
- Expected Inflows: ${inflow}
- Expected Outflows: ${outflow}
- Net Position: ${net}

**YOUR TASK:**
Analyze these metrics and provide:

1. **RECOMMENDATION:** A clear, actionable recommendation (1-2 sentences)
2. **REASONING:** Why this recommendation makes sense given the metrics and how it aligns with the {mode_lower} strategy
3. **RISK_ASSESSMENT:** Rate the risk level (LOW/MEDIUM/HIGH) and explain why
4. **CONFIDENCE:** Your confidence score (0.0 to 1.0) in this recommendation

Format your response EXACTLY as:
RECOMMENDATION: [your recommendation]
REASONING: [your detailed reasoning]
RISK_ASSESSMENT: [LOW/MEDIUM/HIGH] - [explanation]
CONFIDENCE: [0.0-1.0]",
        mode = mode.as_str().to_uppercase(),
        mode_lower = mode,
        idle = metrics.idle_cash_pct,
        coverage = metrics.liquidity_coverage_days,
        bps = metrics.est_yield_bps,
        shortfall = metrics.shortfall_risk_pct,
        amount = format_thousands(metrics.transfer_details.amount),
        total = format_thousands(total_cash),
        min_liquidity = format_thousands(policy.min_liquidity),
        invest_above = format_thousands(policy.invest_above),
        risk_profile = policy.risk_profile,
        inflow = format_thousands(inflow),
        outflow = format_thousands(outflow),
        net = format_thousands(inflow - outflow),
    )
}

/// Text of the labelled section at `LABELS[index]`, up to the next label in
/// order or the end of the reply.
fn section(text: &str, index: usize) -> Option<String> {
    let label = LABELS[index];
    let start = text.find(label)? + label.len();
    let rest = &text[start..];
    let end = LABELS
        .get(index + 1)
        .and_then(|next| rest.find(next))
        .unwrap_or(rest.len());
    let value = rest[..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_reply(text: &str, metrics: &Metrics) -> Advisory {
    let confidence = CONFIDENCE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(DEFAULT_CONFIDENCE);

    Advisory {
        recommendation: section(text, 0).unwrap_or_else(|| metrics.recommendation.clone()),
        reasoning: section(text, 1).unwrap_or_else(|| DEFAULT_REASONING.to_string()),
        risk_assessment: section(text, 2).unwrap_or_else(|| DEFAULT_RISK.to_string()),
        confidence: confidence.clamp(0.0, 1.0),
        enabled: true,
        raw_response: Some(text.to_string()),
        error: None,
    }
}
