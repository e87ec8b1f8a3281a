//! Versioned result document written by the runner inside a sandbox.

use serde::{Deserialize, Serialize};

use crate::advisory::Advisory;
use crate::simulation::Metrics;

/// Current result document version.
pub const SCHEMA_VERSION: u32 = 1;

/// Top-level keys a result document may carry.
const KNOWN_KEYS: [&str; 8] = [
    "schemaVersion",
    "idleCashPct",
    "liquidityCoverageDays",
    "estYieldBps",
    "shortfallRiskPct",
    "recommendation",
    "transferDetails",
    "advisory",
];

/// What the runner writes to its output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDocument {
    pub schema_version: u32,
    #[serde(flatten)]
    pub metrics: Metrics,
    /// Absent when the job produced no advisory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<Advisory>,
}

impl ResultDocument {
    pub fn new(metrics: Metrics, advisory: Option<Advisory>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            metrics,
            advisory,
        }
    }

    /// Check a parsed JSON object against the schema.
    ///
    /// Rejects unknown top-level keys by name, missing or mistyped fields,
    /// an unsupported version, and out-of-range values.
    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        let Some(object) = value.as_object() else {
            return Err("result document must be a JSON object".to_string());
        };

        let mut unexpected: Vec<&str> = object
            .keys()
            .map(String::as_str)
            .filter(|key| !KNOWN_KEYS.contains(key))
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort_unstable();
            return Err(format!("unexpected field(s): {}", unexpected.join(", ")));
        }

        match object.get("schemaVersion").and_then(|v| v.as_u64()) {
            Some(v) if v == u64::from(SCHEMA_VERSION) => {}
            Some(v) => {
                return Err(format!(
                    "unsupported schemaVersion {} (expected {})",
                    v, SCHEMA_VERSION
                ));
            }
            None => return Err("missing or non-integer schemaVersion".to_string()),
        }

        let document: Self = serde_json::from_value(value).map_err(|e| e.to_string())?;
        document.check_ranges()?;
        Ok(document)
    }

    fn check_ranges(&self) -> Result<(), String> {
        let m = &self.metrics;
        if !m.idle_cash_pct.is_finite() || m.idle_cash_pct < 0.0 {
            return Err(format!("idleCashPct out of range: {}", m.idle_cash_pct));
        }
        if !m.liquidity_coverage_days.is_finite() || m.liquidity_coverage_days < 0.0 {
            return Err(format!(
                "liquidityCoverageDays out of range: {}",
                m.liquidity_coverage_days
            ));
        }
        if !(1.0..=20.0).contains(&m.shortfall_risk_pct) {
            return Err(format!(
                "shortfallRiskPct out of range: {}",
                m.shortfall_risk_pct
            ));
        }
        if !m.transfer_details.amount.is_finite() || m.transfer_details.amount < 0.0 {
            return Err(format!(
                "transferDetails.amount out of range: {}",
                m.transfer_details.amount
            ));
        }
        if let Some(advisory) = &self.advisory
            && !(0.0..=1.0).contains(&advisory.confidence)
        {
            return Err(format!(
                "advisory.confidence out of range: {}",
                advisory.confidence
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn valid() -> serde_json::Value {
        json!({
            "schemaVersion": 1,
            "idleCashPct": 39.33,
            "liquidityCoverageDays": 75.0,
            "estYieldBps": 157,
            "shortfallRiskPct": 2.0,
            "recommendation": "Transfer $47,200 from Operating to Yield",
            "transferDetails": {"fromAccount": "Operating", "toAccount": "Yield", "amount": 47200.0}
        })
    }

    #[test]
    fn accepts_valid_document_without_advisory() {
        let doc = ResultDocument::from_value(valid()).unwrap();
        assert_eq!(doc.metrics.est_yield_bps, 157);
        assert!(doc.advisory.is_none());
    }

    #[test]
    fn serializes_flat_with_version() {
        let doc = ResultDocument::from_value(valid()).unwrap();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value, valid());
    }

    #[test]
    fn names_unexpected_keys() {
        let mut value = valid();
        value["debug"] = json!(true);
        value["extra"] = json!(1);
        let err = ResultDocument::from_value(value).unwrap_err();
        assert_eq!(err, "unexpected field(s): debug, extra");
    }

    #[test]
    fn rejects_missing_and_mistyped_fields() {
        let mut value = valid();
        value.as_object_mut().unwrap().remove("recommendation");
        let err = ResultDocument::from_value(value).unwrap_err();
        assert!(err.contains("recommendation"), "{err}");

        let mut value = valid();
        value["estYieldBps"] = json!("157");
        assert!(ResultDocument::from_value(value).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut value = valid();
        value["schemaVersion"] = json!(2);
        assert!(ResultDocument::from_value(value).unwrap_err().contains("unsupported schemaVersion 2"));

        let mut value = valid();
        value.as_object_mut().unwrap().remove("schemaVersion");
        assert!(ResultDocument::from_value(value).unwrap_err().contains("schemaVersion"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut value = valid();
        value["shortfallRiskPct"] = json!(25.0);
        assert!(ResultDocument::from_value(value).unwrap_err().contains("shortfallRiskPct"));

        let mut value = valid();
        value["advisory"] = json!({
            "recommendation": "r",
            "reasoning": "r",
            "riskAssessment": "LOW",
            "confidence": 1.5,
            "enabled": true
        });
        assert!(ResultDocument::from_value(value).unwrap_err().contains("confidence"));
    }

    #[test]
    fn rejects_non_object() {
        assert!(ResultDocument::from_value(json!([1, 2])).is_err());
    }
}
