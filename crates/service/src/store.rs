//! Artifact storage and the shared, swap-on-retrain artifact pair.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use medrisk_alternatives::AlternativesIndex;
use medrisk_classifier::RiskPipeline;
use tempfile::NamedTempFile;

use crate::ServiceError;

pub const MODEL_FILE: &str = "risk_model.json";
pub const INDEX_FILE: &str = "alternatives.csv";

/// The model and index served together.
///
/// Either may be absent; callers get a service-unavailable error for the
/// missing one instead of a substitute.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub pipeline: Option<RiskPipeline>,
    pub index: Option<AlternativesIndex>,
}

/// Where artifacts are persisted.
pub trait ArtifactSource {
    fn load(&self) -> Result<Artifacts, ServiceError>;

    fn save(&self, pipeline: &RiskPipeline, index: &AlternativesIndex) -> Result<(), ServiceError>;

    /// Source name for logging.
    fn name(&self) -> &'static str;
}

/// Artifact directory layout on disk.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("artifacts"),
        }
    }
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }
}

/// Copy of the file at `path`, if any, kept until the new pair is in place.
fn backup(dir: &Path, path: &Path) -> io::Result<Option<NamedTempFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let copy = NamedTempFile::new_in(dir)?;
    fs::copy(path, copy.path())?;
    Ok(Some(copy))
}

fn restore(backup: Option<NamedTempFile>, path: &Path) {
    let result = match backup {
        Some(copy) => copy.persist(path).map(drop).map_err(|e| e.error),
        None => fs::remove_file(path),
    };
    if let Err(e) = result {
        tracing::error!(path = %path.display(), error = %e, "Failed to roll back model artifact");
    }
}

impl ArtifactSource for ArtifactPaths {
    fn load(&self) -> Result<Artifacts, ServiceError> {
        let model_path = self.model_path();
        let pipeline = if model_path.exists() {
            Some(RiskPipeline::load(&model_path)?)
        } else {
            tracing::warn!(path = %model_path.display(), "Model not found, run `medrisk train` first");
            None
        };

        let index_path = self.index_path();
        let index = if index_path.exists() {
            Some(AlternativesIndex::load(&index_path)?)
        } else {
            tracing::warn!(path = %index_path.display(), "Alternatives index not found");
            None
        };

        Ok(Artifacts { pipeline, index })
    }

    /// Stage both files under unique names in the artifact directory, then
    /// rename into place. If the index cannot be placed, the previous model
    /// file is put back so the pair on disk stays matched.
    fn save(&self, pipeline: &RiskPipeline, index: &AlternativesIndex) -> Result<(), ServiceError> {
        fs::create_dir_all(&self.dir)?;

        let mut model_tmp = NamedTempFile::new_in(&self.dir)?;
        pipeline.write_json(model_tmp.as_file_mut())?;
        model_tmp.as_file().sync_all()?;

        let mut index_tmp = NamedTempFile::new_in(&self.dir)?;
        index.write_csv(index_tmp.as_file_mut())?;
        index_tmp.as_file().sync_all()?;

        let model_path = self.model_path();
        let previous = backup(&self.dir, &model_path)?;
        model_tmp.persist(&model_path).map_err(|e| e.error)?;

        let index_path = self.index_path();
        if let Err(e) = index_tmp.persist(&index_path) {
            restore(previous, &model_path);
            return Err(e.error.into());
        }

        tracing::info!(
            model = %model_path.display(),
            index = %index_path.display(),
            entries = index.len(),
            "Saved artifacts"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

/// Shared read-only artifacts, replaced wholesale on retrain.
///
/// Readers take an `Arc` snapshot and keep it for the whole call, so a
/// concurrent [`ArtifactStore::install`] never exposes a half-updated pair.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    current: RwLock<Arc<Artifacts>>,
}

impl ArtifactStore {
    pub fn new(artifacts: Artifacts) -> Self {
        Self {
            current: RwLock::new(Arc::new(artifacts)),
        }
    }

    pub fn open<S: ArtifactSource + ?Sized>(source: &S) -> Result<Self, ServiceError> {
        let artifacts = source.load()?;
        tracing::info!(
            source = source.name(),
            model = artifacts.pipeline.is_some(),
            index = artifacts.index.is_some(),
            "Artifacts loaded"
        );
        Ok(Self::new(artifacts))
    }

    pub fn snapshot(&self) -> Arc<Artifacts> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new pair; returns the previous one.
    pub fn install(&self, artifacts: Artifacts) -> Arc<Artifacts> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(artifacts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medrisk_classifier::{BoosterConfig, TrainConfig};
    use medrisk_model::{AlternativesIndexEntry, DeviceRecord, RiskClass};

    fn pipeline(maker: &str) -> RiskPipeline {
        let records = [
            DeviceRecord::new(maker, "infusion pump"),
            DeviceRecord::new(maker, "insulin pump"),
            DeviceRecord::new(maker, "bandage roll"),
            DeviceRecord::new(maker, "bandage pad"),
        ];
        let labels = [RiskClass::High, RiskClass::High, RiskClass::Low, RiskClass::Low];
        let config = TrainConfig {
            booster: BoosterConfig {
                n_estimators: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        RiskPipeline::fit(&records, &labels, &config).unwrap()
    }

    fn index() -> AlternativesIndex {
        AlternativesIndex::from_entries(vec![AlternativesIndexEntry::new("a", "b", 0.0)]).unwrap()
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_missing_files_load_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactPaths::new(dir.path()).load().unwrap();
        assert!(artifacts.pipeline.is_none());
        assert!(artifacts.index.is_none());
    }

    #[test]
    fn test_install_keeps_old_snapshot_alive() {
        let store = ArtifactStore::default();
        let before = store.snapshot();
        assert!(before.index.is_none());

        let previous = store.install(Artifacts {
            pipeline: None,
            index: Some(index()),
        });

        assert!(Arc::ptr_eq(&before, &previous));
        assert!(before.index.is_none());
        assert_eq!(store.snapshot().index.as_ref().map(|i| i.len()), Some(1));
    }

    #[test]
    fn test_save_leaves_only_the_pair() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path().join("nested"));
        paths.save(&pipeline("acme"), &index()).unwrap();
        paths.save(&pipeline("medico"), &index()).unwrap();

        assert_eq!(file_names(&paths.dir), vec![INDEX_FILE, MODEL_FILE]);
        let loaded = paths.load().unwrap();
        assert!(loaded.pipeline.is_some());
        assert_eq!(loaded.index.map(|i| i.len()), Some(1));
    }

    #[test]
    fn test_failed_index_write_restores_model() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        pipeline("acme").save(paths.model_path()).unwrap();
        let before = fs::read(paths.model_path()).unwrap();

        // A non-empty directory where the index file belongs cannot be replaced
        fs::create_dir(paths.index_path()).unwrap();
        fs::write(paths.index_path().join("keep"), "x").unwrap();

        assert!(matches!(
            paths.save(&pipeline("medico"), &index()),
            Err(ServiceError::Io(_))
        ));
        assert_eq!(fs::read(paths.model_path()).unwrap(), before);
        assert_eq!(file_names(dir.path()), vec![INDEX_FILE, MODEL_FILE]);
    }

    #[test]
    fn test_failed_first_save_leaves_no_model() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        fs::create_dir(paths.index_path()).unwrap();
        fs::write(paths.index_path().join("keep"), "x").unwrap();

        assert!(paths.save(&pipeline("acme"), &index()).is_err());
        assert!(!paths.model_path().exists());
        assert_eq!(file_names(dir.path()), vec![INDEX_FILE]);
    }
}
