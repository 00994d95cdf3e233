//! Explanation generation for device risk predictions.
//!
//! Converts a prediction into the human-readable details shown next to a
//! risk check: per-class percentages, a justification, and a purchase
//! warning for high-risk devices.

use medrisk_model::{Alternative, ClassProbabilities, RiskClass, RiskPrediction};
use serde::{Deserialize, Serialize};

pub const JUSTIFICATION: &str = "Risk estimated from historical recall patterns for manufacturer & device similarity (character n-grams).";

pub const FEATURE_CONTRIBUTION_HINT: &str =
    "Character-level matches in device/manufacturer names influenced the score.";

pub const HIGH_RISK_WARNING: &str = "Avoid purchase of this device.";

/// Structured explanation attached to a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    /// Short summary (1 line)
    pub summary: String,

    /// Class probabilities scaled to percentages
    pub probabilities: ClassProbabilities,

    pub justification: String,

    pub feature_contribution_hint: String,

    /// Present for high-risk devices only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub fn purchase_warning(class: RiskClass) -> Option<&'static str> {
    match class {
        RiskClass::High => Some(HIGH_RISK_WARNING),
        RiskClass::Medium | RiskClass::Low => None,
    }
}

/// One-line risk summary, e.g. "High Risk (72.50%)".
pub fn summarize_risk(prediction: &RiskPrediction) -> String {
    format!("{} ({:.2}%)", prediction.risk_class, prediction.risk_percent)
}

/// Generate the explanation for a prediction.
pub fn explain_prediction(prediction: &RiskPrediction) -> Explanation {
    let p = prediction.class_probabilities;
    Explanation {
        summary: summarize_risk(prediction),
        probabilities: ClassProbabilities {
            low: p.low * 100.0,
            medium: p.medium * 100.0,
            high: p.high * 100.0,
        },
        justification: JUSTIFICATION.to_string(),
        feature_contribution_hint: FEATURE_CONTRIBUTION_HINT.to_string(),
        warning: purchase_warning(prediction.risk_class).map(str::to_string),
    }
}

/// "manufacturer | device (Expected: Low Risk)" lines for display.
pub fn describe_alternatives(alternatives: &[Alternative]) -> Vec<String> {
    alternatives
        .iter()
        .map(|a| format!("{} (Expected: {})", a.display_name(), a.expected_risk))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(p: [f64; 3]) -> RiskPrediction {
        RiskPrediction::from_probabilities(ClassProbabilities::from_array(p))
    }

    #[test]
    fn test_explain_high_risk_warns() {
        let explanation = explain_prediction(&prediction([0.1, 0.2, 0.7]));
        assert_eq!(explanation.summary, "High Risk (70.00%)");
        assert_eq!(explanation.warning.as_deref(), Some(HIGH_RISK_WARNING));
        assert!((explanation.probabilities.high - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_explain_low_risk_has_no_warning() {
        let explanation = explain_prediction(&prediction([0.7, 0.2, 0.1]));
        assert!(explanation.warning.is_none());
        assert!(explanation.justification.contains("character n-grams"));

        let json = serde_json::to_value(&explanation).unwrap();
        assert!(json.get("warning").is_none());
        assert!(json["probabilities"]["Low"].as_f64().unwrap() > 69.9);
    }

    #[test]
    fn test_describe_alternatives() {
        let alts = vec![Alternative {
            manufacturer_name: "acme".to_string(),
            device_name: "stent".to_string(),
            expected_risk: RiskClass::Low,
        }];
        assert_eq!(describe_alternatives(&alts), vec!["acme | stent (Expected: Low Risk)"]);
    }
}
