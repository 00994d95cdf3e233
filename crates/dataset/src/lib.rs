//! Dataset ingestion for device risk training.
//!
//! Reads the historical recall table from CSV and produces validated
//! [`DeviceRecord`]s plus training labels. Everything schema-dependent
//! happens here; downstream crates only see typed records.
//!
//! Recognized columns:
//! - `manufacturer_name`, `device_name`: used directly when both exist
//! - `Device` (+ optional `Country`): composite slug fallback
//! - `Action_Level`: raw regulatory category, mapped to a label
//! - `risk_class`: precomputed label in {0, 1, 2}

use std::fs::File;
use std::io::Read;
use std::path::Path;

use medrisk_features::{action_to_risk_class, normalize_opt, split_device_slug};
use medrisk_model::{DeviceRecord, RiskClass};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Dataset must have 'Action_Level' or 'risk_class' column")]
    MissingLabelColumn,

    #[error("Invalid risk_class on line {line}: {value:?}")]
    InvalidRiskClass { line: u64, value: String },

    #[error("Dataset has no rows")]
    Empty,
}

/// Cell values treated as missing, matching common CSV export conventions.
const NULL_MARKERS: &[&str] = &[
    "", "nan", "NaN", "-nan", "-NaN", "NA", "N/A", "n/a", "<NA>", "#N/A", "#N/A N/A", "#NA",
    "NULL", "null", "None", "1.#IND", "-1.#IND", "1.#QNAN", "-1.#QNAN",
];

fn is_null_like(cell: &str) -> bool {
    NULL_MARKERS.contains(&cell.trim())
}

/// Where training labels came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSource {
    ActionLevel,
    RiskClass,
    None,
}

/// A loaded dataset: parallel records and (optional) labels.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub records: Vec<DeviceRecord>,
    labels: Vec<RiskClass>,
    label_source: LabelSource,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn label_source(&self) -> LabelSource {
        self.label_source
    }

    /// Training labels, parallel to `records`.
    pub fn labels(&self) -> Result<&[RiskClass], DatasetError> {
        match self.label_source {
            LabelSource::None => Err(DatasetError::MissingLabelColumn),
            _ => Ok(&self.labels),
        }
    }

    /// Records and labels together; fails when the dataset cannot be trained on.
    pub fn training_view(&self) -> Result<(&[DeviceRecord], &[RiskClass]), DatasetError> {
        let labels = self.labels()?;
        if self.records.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok((&self.records, labels))
    }
}

#[derive(Debug, Default)]
struct Columns {
    manufacturer: Option<usize>,
    device: Option<usize>,
    slug: Option<usize>,
    country: Option<usize>,
    action_level: Option<usize>,
    risk_class: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        Self {
            manufacturer: find("manufacturer_name"),
            device: find("device_name"),
            slug: find("Device"),
            country: find("Country"),
            action_level: find("Action_Level"),
            risk_class: find("risk_class"),
        }
    }

    fn label_source(&self) -> LabelSource {
        if self.action_level.is_some() {
            LabelSource::ActionLevel
        } else if self.risk_class.is_some() {
            LabelSource::RiskClass
        } else {
            LabelSource::None
        }
    }
}

fn cell(row: &csv::StringRecord, column: Option<usize>) -> Option<&str> {
    column
        .and_then(|i| row.get(i))
        .filter(|v| !is_null_like(v))
}

fn parse_risk_class(raw: Option<&str>, line: u64) -> Result<RiskClass, DatasetError> {
    let invalid = || DatasetError::InvalidRiskClass {
        line,
        value: raw.unwrap_or_default().to_string(),
    };

    let text = raw.ok_or_else(invalid)?.trim();
    let value = match text.parse::<i64>() {
        Ok(v) => v,
        // Integer columns exported through a float type, e.g. "2.0"
        Err(_) => match text.parse::<f64>() {
            Ok(f) if f.fract() == 0.0 => f as i64,
            _ => return Err(invalid()),
        },
    };

    RiskClass::try_from(value).map_err(|_| invalid())
}

/// Load a dataset from a CSV file.
pub fn load_dataset(path: impl AsRef<Path>) -> Result<Dataset, DatasetError> {
    let path = path.as_ref();
    tracing::info!(path = %path.display(), "Loading dataset");
    let file = File::open(path)?;
    read_dataset(file)
}

/// Read a dataset from any CSV source.
pub fn read_dataset<R: Read>(reader: R) -> Result<Dataset, DatasetError> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv::StringRecord::from_byte_record_lossy(rdr.byte_headers()?.clone());
    let columns = Columns::from_headers(&headers);
    let label_source = columns.label_source();
    let use_slug = columns.manufacturer.is_none() || columns.device.is_none();

    if use_slug {
        tracing::debug!(
            has_slug = columns.slug.is_some(),
            "manufacturer_name/device_name missing, deriving from Device slug"
        );
    }

    let mut records = Vec::new();
    let mut labels = Vec::new();
    let mut degraded = 0usize;
    let mut lossy = 0usize;

    for result in rdr.byte_records() {
        let raw = result?;
        let line = raw.position().map(|p| p.line()).unwrap_or_default();
        if std::str::from_utf8(raw.as_slice()).is_err() {
            lossy += 1;
        }
        // Invalid UTF-8 becomes U+FFFD, which normalization then drops
        let row = csv::StringRecord::from_byte_record_lossy(raw);

        let mut record = if use_slug {
            let slug = split_device_slug(cell(&row, columns.slug).unwrap_or_default());
            let country = match columns.country {
                Some(_) => normalize_opt(cell(&row, columns.country)),
                None => slug.country,
            };
            DeviceRecord::new(slug.manufacturer, slug.device).with_country(country)
        } else {
            DeviceRecord::new(
                normalize_opt(cell(&row, columns.manufacturer)),
                normalize_opt(cell(&row, columns.device)),
            )
            .with_country(normalize_opt(cell(&row, columns.country)))
        };

        if record.device_name.is_empty() {
            degraded += 1;
        }

        match label_source {
            LabelSource::ActionLevel => {
                let action = cell(&row, columns.action_level);
                labels.push(action_to_risk_class(action));
                record.action_level = action.map(str::to_string);
            }
            LabelSource::RiskClass => {
                labels.push(parse_risk_class(cell(&row, columns.risk_class), line)?);
            }
            LabelSource::None => {}
        }

        records.push(record);
    }

    if lossy > 0 {
        tracing::warn!(rows = lossy, "Rows with invalid UTF-8, decoded lossily");
    }
    if degraded > 0 {
        tracing::warn!(rows = degraded, "Rows with empty device name");
    }
    tracing::info!(rows = records.len(), label_source = ?label_source, "Dataset loaded");

    Ok(Dataset {
        records,
        labels,
        label_source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn read(csv: &str) -> Dataset {
        read_dataset(csv.as_bytes()).unwrap()
    }

    #[test]
    fn test_dedicated_columns_are_normalized() {
        let ds = read(
            "manufacturer_name,device_name,Country,Action_Level\n\
             ACME Corp.,Infusion  Pump,US,Class I\n",
        );
        assert_eq!(ds.len(), 1);
        assert_eq!(
            ds.records[0],
            DeviceRecord::new("acme corp", "infusion pump")
                .with_country("us")
                .with_action_level("Class I")
        );
        assert_eq!(ds.labels().unwrap(), &[RiskClass::High]);
        assert_eq!(ds.label_source(), LabelSource::ActionLevel);
    }

    #[test]
    fn test_slug_fallback() {
        let ds = read("Device,risk_class\nUS-Acme-Infusion Pump,0\nAcme,2\n");
        assert_eq!(ds.records[0], DeviceRecord::new("acme", "infusion pump").with_country("us"));
        assert_eq!(ds.records[1], DeviceRecord::new("", "").with_country("acme"));
        assert_eq!(ds.labels().unwrap(), &[RiskClass::Low, RiskClass::High]);
    }

    #[test]
    fn test_slug_fallback_keeps_country_column() {
        let ds = read("Device,Country,risk_class\nUS-Acme-Pump,Germany,1\n");
        assert_eq!(ds.records[0].country, "germany");
        assert_eq!(ds.records[0].manufacturer_name, "acme");
    }

    #[test]
    fn test_action_level_takes_precedence() {
        let ds = read("manufacturer_name,device_name,Action_Level,risk_class\nacme,pump,Retail,2\n");
        assert_eq!(ds.labels().unwrap(), &[RiskClass::Low]);
    }

    #[test]
    fn test_missing_action_level_defaults_to_medium() {
        let ds = read("manufacturer_name,device_name,Action_Level\nacme,pump,\nacme,stent,NaN\n");
        assert_eq!(ds.labels().unwrap(), &[RiskClass::Medium, RiskClass::Medium]);
        assert_eq!(ds.records[0].action_level, None);
    }

    #[test]
    fn test_short_rows_degrade_to_empty_fields() {
        let ds = read("manufacturer_name,device_name,Action_Level\nacme\n");
        assert_eq!(ds.records[0], DeviceRecord::new("acme", ""));
        assert_eq!(ds.labels().unwrap(), &[RiskClass::Medium]);
    }

    #[test]
    fn test_missing_label_column() {
        let ds = read("manufacturer_name,device_name\nacme,pump\n");
        assert_eq!(ds.len(), 1);
        assert!(matches!(ds.labels(), Err(DatasetError::MissingLabelColumn)));
        assert!(matches!(ds.training_view(), Err(DatasetError::MissingLabelColumn)));
    }

    #[test]
    fn test_empty_dataset_cannot_train() {
        let ds = read("manufacturer_name,device_name,risk_class\n");
        assert!(matches!(ds.training_view(), Err(DatasetError::Empty)));
    }

    #[test]
    fn test_invalid_risk_class() {
        let err = read_dataset("manufacturer_name,device_name,risk_class\nacme,pump,7\n".as_bytes())
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidRiskClass { line: 2, .. }));

        let ds = read("manufacturer_name,device_name,risk_class\nacme,pump,2.0\n");
        assert_eq!(ds.labels().unwrap(), &[RiskClass::High]);
    }

    #[test]
    fn test_invalid_utf8_row_is_kept() {
        let bytes = b"manufacturer_name,device_name,Action_Level\n\
                      Acme\xff,Infusion Pump,Class I\n\
                      Medico,Bandage\xfe\xfdRoll,Retail\n";
        let ds = read_dataset(&bytes[..]).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.records[0], DeviceRecord::new("acme", "infusion pump").with_action_level("Class I"));
        assert_eq!(ds.records[1].device_name, "bandageroll");
        assert_eq!(ds.labels().unwrap(), &[RiskClass::High, RiskClass::Low]);
    }

    #[test]
    fn test_invalid_utf8_keeps_line_numbers() {
        let bytes = b"manufacturer_name,device_name,risk_class\nAcme\xff,Pump,1\nAcme,Stent,9\n";
        let err = read_dataset(&bytes[..]).unwrap_err();
        assert!(matches!(err, DatasetError::InvalidRiskClass { line: 3, .. }));
    }

    #[test]
    fn test_load_dataset_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "manufacturer_name,device_name,risk_class").unwrap();
        writeln!(file, "Medico,Heart Valve,2").unwrap();
        let ds = load_dataset(file.path()).unwrap();
        assert_eq!(ds.records[0].device_name, "heart valve");
    }
}
