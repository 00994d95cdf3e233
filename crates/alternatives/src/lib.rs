//! Lower-risk alternative suggestions.
//!
//! The index aggregates model predictions over the historical dataset into
//! one mean risk value per (manufacturer, device) pair. Ranking then picks
//! the lowest-risk devices, preferring the query's own manufacturer.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use medrisk_features::normalize_text;
use medrisk_model::{AlternativesIndexEntry, Alternative, DeviceRecord, RiskClass};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Got {records} records but {predictions} predictions")]
    LengthMismatch { records: usize, predictions: usize },

    #[error("Duplicate index entry for ({manufacturer_name:?}, {device_name:?})")]
    DuplicateEntry {
        manufacturer_name: String,
        device_name: String,
    },

    #[error("avg_class out of range [0, 2] for {device_name:?}: {avg_class}")]
    InvalidAvgClass { device_name: String, avg_class: f64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Configuration for ranking.
#[derive(Debug, Clone)]
pub struct RankConfig {
    /// Same-manufacturer entries needed before the pool is restricted to them
    pub min_same_manufacturer: usize,
    /// Sorted candidates considered before filtering
    pub candidate_cap: usize,
    /// Suggestions returned when the caller does not ask for a count
    pub default_top_k: usize,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            min_same_manufacturer: 3,
            candidate_cap: 50,
            default_top_k: 5,
        }
    }
}

/// Read-only table of per-pair mean predicted risk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlternativesIndex {
    entries: Vec<AlternativesIndexEntry>,
}

impl AlternativesIndex {
    /// Build from entries, enforcing one entry per pair and `avg_class` in [0, 2].
    pub fn from_entries(entries: Vec<AlternativesIndexEntry>) -> Result<Self, IndexError> {
        Self::validate(&entries)?;
        Ok(Self { entries })
    }

    fn validate(entries: &[AlternativesIndexEntry]) -> Result<(), IndexError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in entries {
            if !(0.0..=2.0).contains(&entry.avg_class) {
                return Err(IndexError::InvalidAvgClass {
                    device_name: entry.device_name.clone(),
                    avg_class: entry.avg_class,
                });
            }
            if !seen.insert((entry.manufacturer_name.as_str(), entry.device_name.as_str())) {
                return Err(IndexError::DuplicateEntry {
                    manufacturer_name: entry.manufacturer_name.clone(),
                    device_name: entry.device_name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[AlternativesIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let index = Self::read_csv(File::open(path)?)?;
        tracing::info!(path = %path.display(), entries = index.len(), "Loaded alternatives index");
        Ok(index)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let path = path.as_ref();
        self.write_csv(File::create(path)?)?;
        tracing::info!(path = %path.display(), entries = self.len(), "Saved alternatives index");
        Ok(())
    }

    /// Read the `manufacturer_name,device_name,avg_class` table.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self, IndexError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let entries = rdr
            .deserialize()
            .collect::<Result<Vec<AlternativesIndexEntry>, _>>()?;
        Self::from_entries(entries)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), IndexError> {
        let mut wtr = csv::Writer::from_writer(writer);
        for entry in &self.entries {
            wtr.serialize(entry)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Aggregate model predictions over the historical records.
///
/// `predicted` must be parallel to `history`. Produces exactly one entry per
/// distinct (manufacturer_name, device_name) pair.
pub fn build_alternatives_index(
    history: &[DeviceRecord],
    predicted: &[RiskClass],
) -> Result<AlternativesIndex, IndexError> {
    if history.len() != predicted.len() {
        return Err(IndexError::LengthMismatch {
            records: history.len(),
            predictions: predicted.len(),
        });
    }

    let mut groups: BTreeMap<(&str, &str), (usize, usize)> = BTreeMap::new();
    for (record, class) in history.iter().zip(predicted) {
        let group = groups
            .entry((record.manufacturer_name.as_str(), record.device_name.as_str()))
            .or_insert((0, 0));
        group.0 += class.index();
        group.1 += 1;
    }

    let entries = groups
        .into_iter()
        .map(|((manufacturer, device), (sum, count))| {
            AlternativesIndexEntry::new(manufacturer, device, sum as f64 / count as f64)
        })
        .collect();

    tracing::debug!(records = history.len(), "Built alternatives index");
    Ok(AlternativesIndex { entries })
}

/// Suggest up to `top_k` lower-risk devices for a query pair.
///
/// Prefers the query's manufacturer when it has enough entries, otherwise
/// ranks the whole index. Never suggests the query device itself.
pub fn suggest_alternatives(
    index: &AlternativesIndex,
    manufacturer: &str,
    device: &str,
    top_k: usize,
    config: &RankConfig,
) -> Vec<Alternative> {
    let manufacturer = normalize_text(manufacturer);
    let device = normalize_text(device);

    let same_manufacturer: Vec<&AlternativesIndexEntry> = index
        .entries
        .iter()
        .filter(|e| e.manufacturer_name == manufacturer)
        .collect();

    let mut pool = if same_manufacturer.len() >= config.min_same_manufacturer {
        same_manufacturer
    } else {
        tracing::debug!(
            manufacturer = %manufacturer,
            matches = same_manufacturer.len(),
            "Too few same-manufacturer entries, ranking full index"
        );
        index.entries.iter().collect()
    };

    pool.sort_by(|a, b| {
        a.avg_class
            .total_cmp(&b.avg_class)
            .then_with(|| a.device_name.cmp(&b.device_name))
            .then_with(|| a.manufacturer_name.cmp(&b.manufacturer_name))
    });
    pool.truncate(config.candidate_cap);

    pool.into_iter()
        .filter(|e| e.device_name != device)
        .take(top_k)
        .map(|e| Alternative {
            manufacturer_name: e.manufacturer_name.clone(),
            device_name: e.device_name.clone(),
            expected_risk: e.expected_risk(),
        })
        .collect()
}
