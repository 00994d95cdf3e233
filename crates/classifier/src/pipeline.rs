//! Fitted text-to-risk pipeline: two n-gram vectorizers feeding one booster.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use medrisk_features::{normalize_text, CharNgramVectorizer, SparseVector};
use medrisk_model::{ClassProbabilities, DeviceRecord, RiskClass, RiskPrediction};
use serde::{Deserialize, Serialize};

use crate::booster::GradientBoostedTrees;
use crate::{ClassifierError, TrainConfig};

/// Current on-disk layout of the model artifact.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// A fitted classifier over concatenated feature vectors.
pub trait RiskEstimator {
    /// Hard class prediction.
    fn predict_class(&self, x: &SparseVector) -> RiskClass;

    /// Calibrated class probabilities, if the estimator provides them.
    fn predict_proba(&self, _x: &SparseVector) -> Option<ClassProbabilities> {
        None
    }
}

/// Fixed distribution substituted when an estimator only predicts a class.
pub fn fallback_probabilities(class: RiskClass) -> ClassProbabilities {
    match class {
        RiskClass::High => ClassProbabilities::from_array([0.2, 0.3, 0.5]),
        RiskClass::Medium => ClassProbabilities::from_array([0.3, 0.5, 0.2]),
        RiskClass::Low => ClassProbabilities::from_array([0.7, 0.2, 0.1]),
    }
}

/// Class probabilities from any estimator, degrading to the fallback table
/// for estimators without probability output.
pub fn class_probabilities<E: RiskEstimator + ?Sized>(
    estimator: &E,
    x: &SparseVector,
) -> ClassProbabilities {
    match estimator.predict_proba(x) {
        Some(probabilities) => probabilities,
        None => fallback_probabilities(estimator.predict_class(x)),
    }
}

/// Vectorizers and classifier, fitted together and persisted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPipeline {
    manufacturer: CharNgramVectorizer,
    device: CharNgramVectorizer,
    classifier: GradientBoostedTrees,
}

#[derive(Serialize)]
struct ArtifactRef<'a> {
    format_version: u32,
    pipeline: &'a RiskPipeline,
}

#[derive(Deserialize)]
struct Artifact {
    format_version: u32,
    pipeline: RiskPipeline,
}

impl RiskPipeline {
    /// Fit vectorizers and classifier on parallel records and labels.
    pub fn fit(
        records: &[DeviceRecord],
        labels: &[RiskClass],
        config: &TrainConfig,
    ) -> Result<Self, ClassifierError> {
        if records.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        if records.len() != labels.len() {
            return Err(ClassifierError::LengthMismatch {
                rows: records.len(),
                labels: labels.len(),
            });
        }

        let manufacturers: Vec<String> = records
            .iter()
            .map(|r| normalize_text(&r.manufacturer_name))
            .collect();
        let devices: Vec<String> = records
            .iter()
            .map(|r| normalize_text(&r.device_name))
            .collect();

        let manufacturer = CharNgramVectorizer::fit(config.vectorizer, &manufacturers);
        let device = CharNgramVectorizer::fit(config.vectorizer, &devices);
        if manufacturer.is_empty() && device.is_empty() {
            tracing::warn!("No n-gram reached min_df, classifier falls back to class priors");
        }
        tracing::debug!(
            manufacturer_features = manufacturer.len(),
            device_features = device.len(),
            "Vectorizers fitted"
        );

        let rows: Vec<SparseVector> = manufacturers
            .iter()
            .zip(&devices)
            .map(|(m, d)| manufacturer.transform(m).concat(&device.transform(d), manufacturer.len()))
            .collect();
        let n_features = manufacturer.len() + device.len();

        let classifier = GradientBoostedTrees::fit(&rows, labels, n_features, config.booster)?;

        Ok(Self {
            manufacturer,
            device,
            classifier,
        })
    }

    /// Feature vector for a raw (manufacturer, device) pair.
    pub fn features(&self, manufacturer: &str, device: &str) -> SparseVector {
        let m = self.manufacturer.transform(&normalize_text(manufacturer));
        let d = self.device.transform(&normalize_text(device));
        m.concat(&d, self.manufacturer.len())
    }

    pub fn n_features(&self) -> usize {
        self.manufacturer.len() + self.device.len()
    }

    pub fn predict_proba(&self, manufacturer: &str, device: &str) -> ClassProbabilities {
        class_probabilities(&self.classifier, &self.features(manufacturer, device))
    }

    /// Risk label, percent and per-class probabilities for one pair.
    pub fn predict(&self, manufacturer: &str, device: &str) -> RiskPrediction {
        RiskPrediction::from_probabilities(self.predict_proba(manufacturer, device))
    }

    pub fn predict_class(&self, manufacturer: &str, device: &str) -> RiskClass {
        self.classifier
            .predict_class(&self.features(manufacturer, device))
    }

    /// Hard predictions for every record, in order.
    pub fn predict_records(&self, records: &[DeviceRecord]) -> Vec<RiskClass> {
        records
            .iter()
            .map(|r| self.predict_class(&r.manufacturer_name, &r.device_name))
            .collect()
    }

    /// Structural checks for an artifact that did not come from [`RiskPipeline::fit`].
    pub fn validate(&self) -> Result<(), ClassifierError> {
        for (field, vectorizer) in [("manufacturer", &self.manufacturer), ("device", &self.device)] {
            vectorizer
                .validate()
                .map_err(|e| ClassifierError::CorruptArtifact(format!("{field} vectorizer: {e}")))?;
        }
        if self.classifier.n_features() != self.n_features() {
            return Err(ClassifierError::CorruptArtifact(format!(
                "classifier expects {} features, vectorizers produce {}",
                self.classifier.n_features(),
                self.n_features()
            )));
        }
        self.classifier.validate()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ClassifierError> {
        let path = path.as_ref();
        self.write_json(File::create(path)?)?;
        tracing::info!(path = %path.display(), "Saved model artifact");
        Ok(())
    }

    /// Write the versioned artifact to any sink.
    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), ClassifierError> {
        let mut writer = BufWriter::new(writer);
        serde_json::to_writer(
            &mut writer,
            &ArtifactRef {
                format_version: ARTIFACT_FORMAT_VERSION,
                pipeline: self,
            },
        )?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let artifact: Artifact = serde_json::from_reader(reader)?;
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ClassifierError::UnsupportedArtifact(artifact.format_version));
        }
        artifact.pipeline.validate()?;
        tracing::info!(
            path = %path.display(),
            features = artifact.pipeline.n_features(),
            "Loaded model artifact"
        );
        Ok(artifact.pipeline)
    }
}
