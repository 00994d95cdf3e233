//! Core domain model for medical device risk estimation.
//!
//! This crate defines the fundamental types used throughout the system:
//! - `DeviceRecord`: one normalized row of the historical dataset
//! - `RiskClass`: Low, Medium, High ordinal severity
//! - `ClassProbabilities` / `RiskPrediction`: classifier output
//! - `AlternativesIndexEntry` / `Alternative`: lower-risk suggestions

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of risk classes.
pub const NUM_CLASSES: usize = 3;

#[derive(Debug, Error, PartialEq)]
pub enum RiskClassError {
    #[error("Risk class out of range (expected 0, 1 or 2): {0}")]
    OutOfRange(i64),
}

/// Ordinal severity of a device.
///
/// The total order (`Low < Medium < High`) is used both for classifier
/// output and for ranking alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskClass {
    #[serde(rename = "Low Risk")]
    Low = 0,
    #[serde(rename = "Medium Risk")]
    Medium = 1,
    #[serde(rename = "High Risk")]
    High = 2,
}

impl Default for RiskClass {
    /// Medium is the uninformative class used for missing or unknown labels.
    fn default() -> Self {
        Self::Medium
    }
}

impl RiskClass {
    /// All classes in ordinal order.
    pub const ALL: [RiskClass; NUM_CLASSES] = [Self::Low, Self::Medium, Self::High];

    /// Ordinal value (0, 1 or 2).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Human-readable label, e.g. "High Risk".
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "Low Risk",
            Self::Medium => "Medium Risk",
            Self::High => "High Risk",
        }
    }

    /// Short name used for probability keys.
    pub fn short_name(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }

    /// Bucket a mean class value in [0, 2] back into a class.
    pub fn from_avg_class(avg_class: f64) -> Self {
        if avg_class < 0.5 {
            Self::Low
        } else if avg_class < 1.5 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

impl TryFrom<i64> for RiskClass {
    type Error = RiskClassError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(Self::from_index)
            .ok_or(RiskClassError::OutOfRange(value))
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One row of the historical dataset after ingestion.
///
/// Text fields are already normalized and never null; a missing value is
/// the empty string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default)]
    pub country: String,

    #[serde(default)]
    pub manufacturer_name: String,

    #[serde(default)]
    pub device_name: String,

    /// Raw regulatory action category, if the dataset carries one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_level: Option<String>,
}

impl DeviceRecord {
    /// Create a minimal record for testing.
    pub fn new(manufacturer_name: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            manufacturer_name: manufacturer_name.into(),
            device_name: device_name.into(),
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    pub fn with_action_level(mut self, action_level: impl Into<String>) -> Self {
        self.action_level = Some(action_level.into());
        self
    }
}

/// Probability distribution over the three risk classes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClassProbabilities {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl ClassProbabilities {
    pub fn from_array(p: [f64; NUM_CLASSES]) -> Self {
        Self {
            low: p[0],
            medium: p[1],
            high: p[2],
        }
    }

    pub fn as_array(&self) -> [f64; NUM_CLASSES] {
        [self.low, self.medium, self.high]
    }

    pub fn get(&self, class: RiskClass) -> f64 {
        self.as_array()[class.index()]
    }

    /// Most probable class. Ties resolve to the lower class.
    pub fn argmax(&self) -> RiskClass {
        let p = self.as_array();
        let mut best = 0;
        for k in 1..NUM_CLASSES {
            if p[k] > p[best] {
                best = k;
            }
        }
        RiskClass::ALL[best]
    }

    pub fn sum(&self) -> f64 {
        self.low + self.medium + self.high
    }
}

/// Output of the prediction call surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPrediction {
    /// 100 x probability of the predicted class
    pub risk_percent: f64,

    pub risk_class: RiskClass,

    pub class_probabilities: ClassProbabilities,
}

impl RiskPrediction {
    pub fn from_probabilities(class_probabilities: ClassProbabilities) -> Self {
        let risk_class = class_probabilities.argmax();
        Self {
            risk_percent: 100.0 * class_probabilities.get(risk_class),
            risk_class,
            class_probabilities,
        }
    }
}

/// One row of the alternatives index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativesIndexEntry {
    pub manufacturer_name: String,
    pub device_name: String,

    /// Mean predicted class over all historical occurrences, in [0, 2]
    pub avg_class: f64,
}

impl AlternativesIndexEntry {
    pub fn new(
        manufacturer_name: impl Into<String>,
        device_name: impl Into<String>,
        avg_class: f64,
    ) -> Self {
        Self {
            manufacturer_name: manufacturer_name.into(),
            device_name: device_name.into(),
            avg_class,
        }
    }

    pub fn expected_risk(&self) -> RiskClass {
        RiskClass::from_avg_class(self.avg_class)
    }
}

/// A suggested lower-risk device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alternative {
    pub manufacturer_name: String,
    pub device_name: String,
    pub expected_risk: RiskClass,
}

impl Alternative {
    /// "manufacturer | device" form used when alternatives are listed inline.
    pub fn display_name(&self) -> String {
        format!("{} | {}", self.manufacturer_name, self.device_name)
    }
}
