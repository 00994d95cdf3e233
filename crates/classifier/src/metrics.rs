//! Classification metrics for held-out evaluation.

use std::fmt;

use medrisk_model::{RiskClass, NUM_CLASSES};
use serde::{Deserialize, Serialize};

pub fn accuracy(y_true: &[RiskClass], y_pred: &[RiskClass]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

/// Per-class precision, recall and F1. Undefined ratios are reported as 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class: RiskClass,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    /// F1 averaged with class support as weights
    pub weighted_f1: f64,
    pub support: usize,
}

impl ClassificationReport {
    pub fn compute(y_true: &[RiskClass], y_pred: &[RiskClass]) -> Self {
        let mut true_positive = [0usize; NUM_CLASSES];
        let mut predicted = [0usize; NUM_CLASSES];
        let mut actual = [0usize; NUM_CLASSES];
        for (t, p) in y_true.iter().zip(y_pred) {
            actual[t.index()] += 1;
            predicted[p.index()] += 1;
            if t == p {
                true_positive[t.index()] += 1;
            }
        }

        let classes: Vec<ClassMetrics> = RiskClass::ALL
            .iter()
            .map(|&class| {
                let k = class.index();
                let precision = ratio(true_positive[k], predicted[k]);
                let recall = ratio(true_positive[k], actual[k]);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    class,
                    precision,
                    recall,
                    f1,
                    support: actual[k],
                }
            })
            .collect();

        let support = y_true.len();
        let weighted_f1 = if support == 0 {
            0.0
        } else {
            classes
                .iter()
                .map(|c| c.f1 * c.support as f64)
                .sum::<f64>()
                / support as f64
        };

        Self {
            classes,
            accuracy: accuracy(y_true, y_pred),
            weighted_f1,
            support,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>12} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for c in &self.classes {
            writeln!(
                f,
                "{:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                c.class.label(),
                c.precision,
                c.recall,
                c.f1,
                c.support
            )?;
        }
        writeln!(f)?;
        writeln!(f, "{:>12} {:>29.2} {:>9}", "accuracy", self.accuracy, self.support)?;
        write!(f, "{:>12} {:>29.2} {:>9}", "weighted f1", self.weighted_f1, self.support)
    }
}

/// Fold scores from cross-validation, with mean and population std-dev.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationResult {
    pub fold_scores: Vec<f64>,
    pub mean_score: f64,
    pub std_score: f64,
    pub metric_name: String,
}

impl CrossValidationResult {
    pub fn from_scores(scores: Vec<f64>, metric_name: &str) -> Self {
        let n = scores.len().max(1) as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Self {
            fold_scores: scores,
            mean_score: mean,
            std_score: variance.sqrt(),
            metric_name: metric_name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medrisk_model::RiskClass::{High, Low, Medium};

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[Low, Medium, High, High], &[Low, Medium, Medium, High]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_report_per_class() {
        let y_true = [Low, Low, Medium, High, High, High];
        let y_pred = [Low, Medium, Medium, High, High, Low];
        let report = ClassificationReport::compute(&y_true, &y_pred);

        let low = &report.classes[0];
        assert_eq!(low.support, 2);
        assert!((low.precision - 0.5).abs() < 1e-12);
        assert!((low.recall - 0.5).abs() < 1e-12);

        let high = &report.classes[2];
        assert!((high.precision - 1.0).abs() < 1e-12);
        assert!((high.recall - 2.0 / 3.0).abs() < 1e-12);

        // weighted: (2*0.5 + 1*(2/3) + 3*0.8) / 6
        let expected = (1.0 + 2.0 / 3.0 + 2.4) / 6.0;
        assert!((report.weighted_f1 - expected).abs() < 1e-12);
        assert!((report.accuracy - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_report_missing_class_scores_zero() {
        let report = ClassificationReport::compute(&[Low, Low], &[Low, Low]);
        assert_eq!(report.classes[2].f1, 0.0);
        assert_eq!(report.weighted_f1, 1.0);
        assert!(report.to_string().contains("High Risk"));
    }

    #[test]
    fn test_cross_validation_summary() {
        let cv = CrossValidationResult::from_scores(vec![0.8, 0.9, 1.0], "accuracy");
        assert!((cv.mean_score - 0.9).abs() < 1e-12);
        assert!((cv.std_score - (0.02f64 / 3.0).sqrt()).abs() < 1e-12);
    }
}
