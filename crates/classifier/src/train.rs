//! Offline training: stratified split, cross-validation, fit, evaluation.

use medrisk_model::{DeviceRecord, RiskClass};
use serde::{Deserialize, Serialize};

use crate::metrics::{accuracy, ClassificationReport, CrossValidationResult};
use crate::pipeline::RiskPipeline;
use crate::split::{stratified_kfold, stratified_train_test_split};
use crate::{ClassifierError, TrainConfig};

/// Evaluation summary produced alongside the fitted pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub n_train: usize,
    pub n_test: usize,
    /// Absent when `cv_folds < 2`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_validation: Option<CrossValidationResult>,
    pub test: ClassificationReport,
}

fn select<T: Clone>(items: &[T], idx: &[usize]) -> Vec<T> {
    idx.iter().map(|&i| items[i].clone()).collect()
}

/// Cross-validated accuracy of a fresh pipeline on `records`.
pub fn cross_validate(
    records: &[DeviceRecord],
    labels: &[RiskClass],
    config: &TrainConfig,
) -> Result<CrossValidationResult, ClassifierError> {
    let folds = stratified_kfold(labels, config.cv_folds, config.seed)?;
    let mut scores = Vec::with_capacity(folds.len());

    for (fold, (train_idx, validation_idx)) in folds.iter().enumerate() {
        let pipeline = RiskPipeline::fit(
            &select(records, train_idx),
            &select(labels, train_idx),
            config,
        )?;
        let predicted = pipeline.predict_records(&select(records, validation_idx));
        let score = accuracy(&select(labels, validation_idx), &predicted);
        tracing::debug!(fold = fold + 1, accuracy = score, "Cross-validation fold");
        scores.push(score);
    }

    Ok(CrossValidationResult::from_scores(scores, "accuracy"))
}

/// Split, cross-validate on the training part, fit, and score the held-out part.
pub fn train(
    records: &[DeviceRecord],
    labels: &[RiskClass],
    config: &TrainConfig,
) -> Result<(RiskPipeline, TrainingReport), ClassifierError> {
    if records.is_empty() {
        return Err(ClassifierError::EmptyTrainingSet);
    }
    if records.len() != labels.len() {
        return Err(ClassifierError::LengthMismatch {
            rows: records.len(),
            labels: labels.len(),
        });
    }

    let (train_idx, test_idx) = stratified_train_test_split(labels, config.test_size, config.seed)?;
    let train_records = select(records, &train_idx);
    let train_labels = select(labels, &train_idx);
    tracing::info!(train = train_idx.len(), test = test_idx.len(), "Split dataset");

    let cross_validation = if config.cv_folds >= 2 {
        let cv = cross_validate(&train_records, &train_labels, config)?;
        tracing::info!(
            mean = cv.mean_score,
            std = cv.std_score,
            folds = cv.fold_scores.len(),
            "CV accuracy"
        );
        Some(cv)
    } else {
        None
    };

    let pipeline = RiskPipeline::fit(&train_records, &train_labels, config)?;
    let predicted = pipeline.predict_records(&select(records, &test_idx));
    let test = ClassificationReport::compute(&select(labels, &test_idx), &predicted);
    tracing::info!(
        accuracy = test.accuracy,
        weighted_f1 = test.weighted_f1,
        "Held-out evaluation"
    );

    Ok((
        pipeline,
        TrainingReport {
            n_train: train_idx.len(),
            n_test: test_idx.len(),
            cross_validation,
            test,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booster::BoosterConfig;

    fn corpus() -> (Vec<DeviceRecord>, Vec<RiskClass>) {
        let mut records = Vec::new();
        let mut labels = Vec::new();
        for i in 0..10 {
            records.push(DeviceRecord::new("acme", format!("infusion pump {i}")));
            labels.push(RiskClass::High);
            records.push(DeviceRecord::new("medico", format!("bandage roll {i}")));
            labels.push(RiskClass::Low);
            records.push(DeviceRecord::new("cardiotech", format!("heart valve {i}")));
            labels.push(RiskClass::Medium);
        }
        (records, labels)
    }

    fn config(cv_folds: usize) -> TrainConfig {
        TrainConfig {
            cv_folds,
            booster: BoosterConfig {
                n_estimators: 20,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_train_reports_evaluation() {
        let (records, labels) = corpus();
        let (pipeline, report) = train(&records, &labels, &config(3)).unwrap();
        assert_eq!(report.n_train + report.n_test, 30);
        assert_eq!(report.n_test, 6);

        let cv = report.cross_validation.unwrap();
        assert_eq!(cv.fold_scores.len(), 3);
        assert!(cv.mean_score > 0.9);
        assert!(report.test.accuracy > 0.9);
        assert_eq!(pipeline.predict_class("acme", "infusion pump"), RiskClass::High);
    }

    #[test]
    fn test_train_is_reproducible() {
        let (records, labels) = corpus();
        let (a, report_a) = train(&records, &labels, &config(0)).unwrap();
        let (b, report_b) = train(&records, &labels, &config(0)).unwrap();
        assert!(report_a.cross_validation.is_none());
        assert_eq!(report_a, report_b);
        assert_eq!(a.predict("acme", "pump"), b.predict("acme", "pump"));
    }

    #[test]
    fn test_train_rejects_mismatch() {
        let (records, _) = corpus();
        assert!(matches!(
            train(&records, &[RiskClass::Low], &config(0)),
            Err(ClassifierError::LengthMismatch { .. })
        ));
    }
}
