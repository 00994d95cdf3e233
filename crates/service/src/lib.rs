//! Risk prediction service over a loaded model and alternatives index.
//!
//! Provides the call surfaces used by serving layers (`predict`, `suggest`,
//! `assess`) and the offline retraining flow that produces a fresh
//! artifact pair and swaps it in.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use medrisk_alternatives::{
    build_alternatives_index, suggest_alternatives, AlternativesIndex, IndexError, RankConfig,
};
use medrisk_classifier::{train, ClassifierError, RiskPipeline, TrainConfig, TrainingReport};
use medrisk_dataset::{Dataset, DatasetError};
use medrisk_explain::{explain_prediction, Explanation};
use medrisk_model::{Alternative, RiskPrediction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod store;

pub use store::{ArtifactPaths, ArtifactSource, ArtifactStore, Artifacts};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Model not trained yet, run `medrisk train` first")]
    ModelUnavailable,

    #[error("Alternatives index not available")]
    IndexUnavailable,

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Full risk check: prediction, explanation, and alternatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(flatten)]
    pub prediction: RiskPrediction,
    pub details: Explanation,
    pub alternatives: Vec<Alternative>,
}

/// Which artifacts are currently served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub model_loaded: bool,
    pub model_features: Option<usize>,
    pub index_entries: Option<usize>,
}

/// Serving facade over an [`ArtifactStore`] backed by an [`ArtifactSource`].
///
/// Reads never block on training. Publishing (persist + install) is
/// serialized so the pair on disk and in memory always comes from the same
/// call.
pub struct RiskService<S: ArtifactSource> {
    source: S,
    store: ArtifactStore,
    rank: RankConfig,
    publish_lock: Mutex<()>,
}

impl<S: ArtifactSource> RiskService<S> {
    /// Load artifacts from `source` once.
    pub fn open(source: S, rank: RankConfig) -> Result<Self, ServiceError> {
        let store = ArtifactStore::open(&source)?;
        Ok(Self::with_store(source, store, rank))
    }

    /// Start with nothing loaded, ignoring whatever `source` currently holds.
    ///
    /// Used for retraining, which must work even when the persisted model
    /// is unreadable.
    pub fn empty(source: S, rank: RankConfig) -> Self {
        Self::with_store(source, ArtifactStore::default(), rank)
    }

    fn with_store(source: S, store: ArtifactStore, rank: RankConfig) -> Self {
        Self {
            source,
            store,
            rank,
            publish_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn health(&self) -> Health {
        let artifacts = self.store.snapshot();
        Health {
            model_loaded: artifacts.pipeline.is_some(),
            model_features: artifacts.pipeline.as_ref().map(|p| p.n_features()),
            index_entries: artifacts.index.as_ref().map(|i| i.len()),
        }
    }

    pub fn predict(&self, manufacturer: &str, device: &str) -> Result<RiskPrediction, ServiceError> {
        let artifacts = self.store.snapshot();
        let pipeline = artifacts
            .pipeline
            .as_ref()
            .ok_or(ServiceError::ModelUnavailable)?;
        Ok(pipeline.predict(manufacturer, device))
    }

    pub fn suggest(
        &self,
        manufacturer: &str,
        device: &str,
        top_k: usize,
    ) -> Result<Vec<Alternative>, ServiceError> {
        let artifacts = self.store.snapshot();
        let index = artifacts
            .index
            .as_ref()
            .ok_or(ServiceError::IndexUnavailable)?;
        Ok(suggest_alternatives(index, manufacturer, device, top_k, &self.rank))
    }

    /// Prediction plus explanation, with alternatives when an index is loaded.
    pub fn assess(&self, manufacturer: &str, device: &str) -> Result<Assessment, ServiceError> {
        let artifacts = self.store.snapshot();
        let pipeline = artifacts
            .pipeline
            .as_ref()
            .ok_or(ServiceError::ModelUnavailable)?;
        let prediction = pipeline.predict(manufacturer, device);

        let alternatives = artifacts
            .index
            .as_ref()
            .map(|index| {
                suggest_alternatives(index, manufacturer, device, self.rank.default_top_k, &self.rank)
            })
            .unwrap_or_default();

        Ok(Assessment {
            details: explain_prediction(&prediction),
            prediction,
            alternatives,
        })
    }

    /// Train on `dataset`, rebuild the index, persist both, and swap them in.
    ///
    /// Training does not depend on the served pair, so it runs outside the
    /// publish lock; concurrent retrains publish in completion order.
    pub fn retrain(&self, dataset: &Dataset, config: &TrainConfig) -> Result<TrainingReport, ServiceError> {
        let (artifacts, report) = train_artifacts(dataset, config)?;
        let guard = self.lock_publish();
        self.publish(&guard, artifacts)?;
        Ok(report)
    }

    /// Rebuild the index from the current model and `dataset`.
    ///
    /// Holds the publish lock from snapshot to install, so a retrain that
    /// lands meanwhile is never overwritten with the older model.
    pub fn rebuild_index(&self, dataset: &Dataset) -> Result<usize, ServiceError> {
        let guard = self.lock_publish();
        let current = self.store.snapshot();
        let pipeline = current
            .pipeline
            .clone()
            .ok_or(ServiceError::ModelUnavailable)?;
        let index = index_from_predictions(&pipeline, dataset)?;
        let entries = index.len();
        self.publish(
            &guard,
            Artifacts {
                pipeline: Some(pipeline),
                index: Some(index),
            },
        )?;
        Ok(entries)
    }

    fn lock_publish(&self) -> MutexGuard<'_, ()> {
        self.publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist then install. Callers must hold the publish lock.
    fn publish(
        &self,
        _guard: &MutexGuard<'_, ()>,
        artifacts: Artifacts,
    ) -> Result<Arc<Artifacts>, ServiceError> {
        if let (Some(pipeline), Some(index)) = (&artifacts.pipeline, &artifacts.index) {
            self.source.save(pipeline, index)?;
        }
        let previous = self.store.install(artifacts);
        tracing::info!(source = self.source.name(), "Installed new artifacts");
        Ok(previous)
    }
}

fn index_from_predictions(
    pipeline: &RiskPipeline,
    dataset: &Dataset,
) -> Result<AlternativesIndex, ServiceError> {
    // In-sample predictions: avg_class is optimistic for rows the model was fitted on.
    tracing::debug!("Building alternatives index from in-sample predictions");
    let predicted = pipeline.predict_records(&dataset.records);
    let index = build_alternatives_index(&dataset.records, &predicted)?;
    tracing::info!(entries = index.len(), rows = dataset.len(), "Alternatives index built");
    Ok(index)
}

/// Offline flow without publishing: fit, evaluate, and build the index over
/// the full dataset.
pub fn train_artifacts(
    dataset: &Dataset,
    config: &TrainConfig,
) -> Result<(Artifacts, TrainingReport), ServiceError> {
    let (records, labels) = dataset.training_view()?;
    let (pipeline, report) = train(records, labels, config)?;
    let index = index_from_predictions(&pipeline, dataset)?;
    Ok((
        Artifacts {
            pipeline: Some(pipeline),
            index: Some(index),
        },
        report,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use medrisk_classifier::BoosterConfig;
    use medrisk_dataset::read_dataset;
    use medrisk_model::RiskClass;

    fn dataset() -> Dataset {
        let mut csv = String::from("manufacturer_name,device_name,Action_Level\n");
        for i in 0..8 {
            csv.push_str(&format!("Acme,Infusion Pump {i},Class I\n"));
            csv.push_str(&format!("Medico,Bandage Roll {i},Retail\n"));
            csv.push_str(&format!("CardioTech,Heart Valve {i},Class II\n"));
        }
        read_dataset(csv.as_bytes()).unwrap()
    }

    fn other_dataset() -> Dataset {
        let mut csv = String::from("manufacturer_name,device_name,Action_Level\n");
        for i in 0..6 {
            csv.push_str(&format!("Zenith,Catheter Tube {i},Class I\n"));
            csv.push_str(&format!("Orbis,Gauze Swab {i},Retail\n"));
        }
        read_dataset(csv.as_bytes()).unwrap()
    }

    fn pipeline_json(artifacts: &Artifacts) -> serde_json::Value {
        serde_json::to_value(artifacts.pipeline.as_ref().unwrap()).unwrap()
    }

    fn config() -> TrainConfig {
        TrainConfig {
            cv_folds: 2,
            booster: BoosterConfig {
                n_estimators: 20,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn service(dir: &std::path::Path) -> RiskService<ArtifactPaths> {
        RiskService::open(ArtifactPaths::new(dir), RankConfig::default()).unwrap()
    }

    #[test]
    fn test_unavailable_without_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert!(matches!(svc.predict("acme", "pump"), Err(ServiceError::ModelUnavailable)));
        assert!(matches!(svc.assess("acme", "pump"), Err(ServiceError::ModelUnavailable)));
        assert!(matches!(svc.suggest("acme", "pump", 5), Err(ServiceError::IndexUnavailable)));
        assert!(!svc.health().model_loaded);
    }

    #[test]
    fn test_retrain_publishes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let report = svc.retrain(&dataset(), &config()).unwrap();
        assert_eq!(report.n_train + report.n_test, 24);

        let prediction = svc.predict("ACME", "infusion pump 3").unwrap();
        assert_eq!(prediction.risk_class, RiskClass::High);

        let health = svc.health();
        assert!(health.model_loaded);
        assert_eq!(health.index_entries, Some(24));

        // A fresh service sees the persisted pair
        let reopened = service(dir.path());
        assert_eq!(reopened.predict("ACME", "infusion pump 3").unwrap(), prediction);
    }

    #[test]
    fn test_retrain_replaces_unreadable_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(store::MODEL_FILE), "{ not json").unwrap();
        assert!(matches!(
            RiskService::open(ArtifactPaths::new(dir.path()), RankConfig::default()),
            Err(ServiceError::Classifier(_))
        ));

        let svc = RiskService::empty(ArtifactPaths::new(dir.path()), RankConfig::default());
        assert!(!svc.health().model_loaded);
        svc.retrain(&dataset(), &config()).unwrap();

        let reopened = service(dir.path());
        assert_eq!(
            reopened.predict("acme", "infusion pump 2").unwrap().risk_class,
            RiskClass::High
        );
    }

    #[test]
    fn test_rebuild_index_never_reverts_concurrent_retrain() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.retrain(&dataset(), &config()).unwrap();
        let old = pipeline_json(&svc.store().snapshot());

        let (expected, _) = train_artifacts(&other_dataset(), &config()).unwrap();
        let expected = pipeline_json(&expected);
        assert_ne!(old, expected);

        for _ in 0..3 {
            std::thread::scope(|scope| {
                scope.spawn(|| svc.rebuild_index(&dataset()).unwrap());
                scope.spawn(|| svc.retrain(&other_dataset(), &config()).unwrap());
            });

            let served = svc.store().snapshot();
            assert_eq!(pipeline_json(&served), expected);
            let on_disk = ArtifactPaths::new(dir.path()).load().unwrap();
            assert_eq!(pipeline_json(&on_disk), expected);
            assert_eq!(
                on_disk.index.as_ref().map(|i| i.entries().to_vec()),
                served.index.as_ref().map(|i| i.entries().to_vec())
            );
        }
    }

    #[test]
    fn test_assess_suggests_lower_risk_alternatives() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.retrain(&dataset(), &config()).unwrap();

        let assessment = svc.assess("acme", "infusion pump 1").unwrap();
        assert_eq!(assessment.prediction.risk_class, RiskClass::High);
        assert!(assessment.details.warning.is_some());
        assert!(assessment.alternatives.len() <= 5);
        assert!(assessment
            .alternatives
            .iter()
            .all(|a| a.device_name != "infusion pump 1"));

        let alternatives = svc.suggest("Unknown Maker", "widget", 3).unwrap();
        assert_eq!(alternatives.len(), 3);
        assert!(alternatives.iter().all(|a| a.expected_risk == RiskClass::Low));
    }

    #[test]
    fn test_retrain_requires_labels() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let unlabeled = read_dataset("manufacturer_name,device_name\nacme,pump\n".as_bytes()).unwrap();
        assert!(matches!(
            svc.retrain(&unlabeled, &config()),
            Err(ServiceError::Dataset(DatasetError::MissingLabelColumn))
        ));
    }

    #[test]
    fn test_rebuild_index_needs_model() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert!(matches!(svc.rebuild_index(&dataset()), Err(ServiceError::ModelUnavailable)));

        svc.retrain(&dataset(), &config()).unwrap();
        assert_eq!(svc.rebuild_index(&dataset()).unwrap(), 24);
    }
}
