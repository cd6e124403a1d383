//! Boundary adapters for the two upstream feeds: scraped channel messages and
//! object-detection results.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use medwh_core::time::parse_timestamp;
use medwh_core::{DataDefect, RawDetection, RawMessage, RecordRef};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "medwh-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{path}: expected a JSON array of records")]
    NotAnArray { path: PathBuf },
    #[error("message data lake {0} does not exist")]
    MissingRoot(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub files: usize,
    pub records: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub records: Vec<T>,
    pub stats: LoadStats,
    /// Records that carried their natural key but could not be read faithfully.
    pub defects: Vec<DataDefect>,
}

/// Why a scraped record did not become a [`RawMessage`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectedRecord {
    #[error("record without message id or channel name")]
    MissingKey,
    #[error(transparent)]
    Defect(DataDefect),
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    fn source_id(&self) -> &str;
    async fn load_messages(&self) -> Result<Loaded<RawMessage>, SourceError>;
}

#[async_trait]
pub trait DetectionSource: Send + Sync {
    fn source_id(&self) -> &str;
    async fn load_detections(&self) -> Result<Loaded<RawDetection>, SourceError>;
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str()
}

/// Whole-number counter. `Err` carries a numeric value that is fractional or outside `i64`.
fn json_i64(value: &JsonValue, key: &str) -> Result<Option<i64>, f64> {
    match value.get(key) {
        Some(JsonValue::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(whole), _) => Ok(Some(whole)),
            (None, Some(f))
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 =>
            {
                Ok(Some(f as i64))
            }
            (None, f) => Err(f.unwrap_or(f64::NAN)),
        },
        Some(JsonValue::String(s)) => Ok(s.trim().parse().ok()),
        _ => Ok(None),
    }
}

fn counter(
    record: &JsonValue,
    key: &str,
    field: &'static str,
    record_ref: impl FnOnce() -> RecordRef,
) -> Result<Option<i64>, RejectedRecord> {
    json_i64(record, key).map_err(|value| {
        RejectedRecord::Defect(DataDefect::NonIntegralCounter {
            record: record_ref(),
            field,
            value,
        })
    })
}

fn json_id(value: &JsonValue, key: &str) -> Option<String> {
    let id = match value.get(key)? {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Some(id).filter(|id| !id.is_empty())
}

/// Map one scraped record. Rejected when the natural key (message id + channel) is absent or a
/// counter is not a whole number.
pub fn raw_message_from_json(record: &JsonValue) -> Result<RawMessage, RejectedRecord> {
    let message_id = json_id(record, "message_id").ok_or(RejectedRecord::MissingKey)?;
    let channel_name = json_str(record, "channel_name")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(RejectedRecord::MissingKey)?
        .to_string();
    let record_ref = || RecordRef::new(message_id.clone(), channel_name.clone());
    let views = counter(record, "views", "view", record_ref)?;
    let forwards = counter(record, "forwards", "forward", record_ref)?;

    Ok(RawMessage {
        message_id,
        channel_name,
        message_date: json_str(record, "message_date").and_then(parse_timestamp),
        message_text: json_str(record, "message_text").map(|t| t.replace('\0', "")),
        has_media: record
            .get("has_media")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
        image_path: json_str(record, "image_path").map(str::to_string),
        views,
        forwards,
        scraped_at: json_str(record, "scraped_at").and_then(parse_timestamp),
        raw_data: record.clone(),
    })
}

async fn read_json_array(path: &Path) -> Result<Vec<JsonValue>, SourceError> {
    let text = fs::read_to_string(path).await.map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: JsonValue = serde_json::from_str(&text).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        JsonValue::Array(items) => Ok(items),
        _ => Err(SourceError::NotAnArray {
            path: path.to_path_buf(),
        }),
    }
}

async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let io = |source: std::io::Error| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir).await.map_err(io)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io)? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Partitioned JSON data lake: `<root>/<YYYY-MM-DD>/<channel>.json`, each file an array of
/// scraped message records. Files are read in path order so the output order is stable.
#[derive(Debug, Clone)]
pub struct JsonLakeMessageSource {
    root: PathBuf,
}

impl JsonLakeMessageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl MessageSource for JsonLakeMessageSource {
    fn source_id(&self) -> &str {
        "json-lake"
    }

    async fn load_messages(&self) -> Result<Loaded<RawMessage>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::MissingRoot(self.root.clone()));
        }
        let mut stats = LoadStats::default();
        let mut records = Vec::new();
        let mut defects = Vec::new();

        for partition in sorted_entries(&self.root).await? {
            let is_date_partition = partition.is_dir()
                && partition
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").is_ok());
            if !is_date_partition {
                debug!(path = %partition.display(), "skipping non-partition entry");
                continue;
            }

            for file in sorted_entries(&partition).await? {
                if file.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                stats.files += 1;
                for item in read_json_array(&file).await? {
                    stats.records += 1;
                    match raw_message_from_json(&item) {
                        Ok(message) => records.push(message),
                        Err(rejected) => {
                            stats.rejected += 1;
                            warn!(path = %file.display(), reason = %rejected, "rejected scraped record");
                            if let RejectedRecord::Defect(defect) = rejected {
                                defects.push(defect);
                            }
                        }
                    }
                }
            }
        }

        info!(
            root = %self.root.display(),
            files = stats.files,
            records = stats.records,
            rejected = stats.rejected,
            "loaded raw messages"
        );
        Ok(Loaded {
            records,
            stats,
            defects,
        })
    }
}

/// JSON array of detection results. A missing file means nothing has been detected yet.
#[derive(Debug, Clone)]
pub struct JsonDetectionSource {
    path: PathBuf,
}

impl JsonDetectionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DetectionSource for JsonDetectionSource {
    fn source_id(&self) -> &str {
        "json-detections"
    }

    async fn load_detections(&self) -> Result<Loaded<RawDetection>, SourceError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no detection results file; continuing without detections");
            return Ok(Loaded {
                records: Vec::new(),
                stats: LoadStats::default(),
                defects: Vec::new(),
            });
        }

        let items = read_json_array(&self.path).await?;
        let mut stats = LoadStats {
            files: 1,
            records: items.len(),
            rejected: 0,
        };
        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<RawDetection>(item) {
                Ok(detection) => records.push(detection),
                Err(err) => {
                    stats.rejected += 1;
                    warn!(path = %self.path.display(), index, error = %err, "unreadable detection record");
                }
            }
        }
        info!(
            path = %self.path.display(),
            records = stats.records,
            rejected = stats.rejected,
            "loaded detections"
        );
        Ok(Loaded {
            records,
            stats,
            defects: Vec::new(),
        })
    }
}

/// Fixed in-memory feeds.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    pub messages: Vec<RawMessage>,
    pub detections: Vec<RawDetection>,
}

#[async_trait]
impl MessageSource for InMemorySource {
    fn source_id(&self) -> &str {
        "in-memory"
    }

    async fn load_messages(&self) -> Result<Loaded<RawMessage>, SourceError> {
        Ok(Loaded {
            records: self.messages.clone(),
            stats: LoadStats {
                files: 0,
                records: self.messages.len(),
                rejected: 0,
            },
            defects: Vec::new(),
        })
    }
}

#[async_trait]
impl DetectionSource for InMemorySource {
    fn source_id(&self) -> &str {
        "in-memory"
    }

    async fn load_detections(&self) -> Result<Loaded<RawDetection>, SourceError> {
        Ok(Loaded {
            records: self.detections.clone(),
            stats: LoadStats {
                files: 0,
                records: self.detections.len(),
                rejected: 0,
            },
            defects: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn maps_scraper_record_fields() {
        let record = json!({
            "message_id": 1001,
            "channel_name": "tikvahpharma",
            "message_date": "2025-01-15T09:30:00+00:00",
            "message_text": "Amoxicillin\u{0000} 500mg",
            "has_media": true,
            "image_path": "data/raw/images/tikvahpharma/1001.jpg",
            "views": 250,
            "forwards": "4",
            "scraped_at": "2025-01-16T08:00:00"
        });
        let raw = raw_message_from_json(&record).expect("mapped");
        assert_eq!(raw.message_id, "1001");
        assert_eq!(raw.message_text.as_deref(), Some("Amoxicillin 500mg"));
        assert_eq!(raw.message_date, Some(Utc.with_ymd_and_hms(2025, 1, 15, 9, 30, 0).unwrap()));
        assert_eq!(raw.views, Some(250));
        assert_eq!(raw.forwards, Some(4));
        assert!(raw.has_media);
        assert_eq!(raw.raw_data, record);
    }

    #[test]
    fn missing_natural_key_is_rejected() {
        assert_eq!(
            raw_message_from_json(&json!({"channel_name": "chemed"})).unwrap_err(),
            RejectedRecord::MissingKey
        );
        assert_eq!(
            raw_message_from_json(&json!({"message_id": 5, "channel_name": "  "})).unwrap_err(),
            RejectedRecord::MissingKey
        );
        let partial = raw_message_from_json(&json!({"message_id": "5", "channel_name": "chemed"}))
            .expect("mapped");
        assert!(partial.message_date.is_none());
        assert!(partial.views.is_none());
    }

    #[test]
    fn fractional_or_oversized_counters_are_defects() {
        let fractional = raw_message_from_json(&json!({
            "message_id": 9, "channel_name": "chemed", "views": 12.7
        }))
        .unwrap_err();
        assert!(matches!(
            fractional,
            RejectedRecord::Defect(DataDefect::NonIntegralCounter { field: "view", value, .. })
                if value == 12.7
        ));
        let huge = raw_message_from_json(&json!({
            "message_id": 9, "channel_name": "chemed", "forwards": 1e30
        }))
        .unwrap_err();
        assert!(matches!(
            huge,
            RejectedRecord::Defect(DataDefect::NonIntegralCounter { field: "forward", .. })
        ));
        let whole = raw_message_from_json(&json!({
            "message_id": 9, "channel_name": "chemed", "views": 40.0
        }))
        .expect("whole float");
        assert_eq!(whole.views, Some(40));
    }

    #[tokio::test]
    async fn lake_is_read_in_partition_order() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("2025-01-16")).unwrap();
        std::fs::create_dir_all(root.join("2025-01-15")).unwrap();
        std::fs::create_dir_all(root.join("not-a-date")).unwrap();
        std::fs::write(
            root.join("2025-01-16/chemed.json"),
            r#"[{"message_id": 2, "channel_name": "chemed", "message_date": "2025-01-16 10:00:00"}]"#,
        )
        .unwrap();
        std::fs::write(
            root.join("2025-01-15/chemed.json"),
            r#"[{"message_id": 1, "channel_name": "chemed"}, {"message_text": "orphan"},
                {"message_id": 3, "channel_name": "chemed", "views": 2.5}]"#,
        )
        .unwrap();
        std::fs::write(root.join("not-a-date/x.json"), "[]").unwrap();

        let loaded = JsonLakeMessageSource::new(root).load_messages().await.expect("load");
        let ids: Vec<_> = loaded.records.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(loaded.stats, LoadStats { files: 2, records: 4, rejected: 2 });
        assert_eq!(loaded.defects.len(), 1);
        assert_eq!(loaded.defects[0].record().message_id, "3");
    }

    #[tokio::test]
    async fn malformed_lake_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("2025-01-15")).unwrap();
        std::fs::write(dir.path().join("2025-01-15/chemed.json"), "{\"not\": \"array\"}").unwrap();
        let err = JsonLakeMessageSource::new(dir.path()).load_messages().await.unwrap_err();
        assert!(matches!(err, SourceError::NotAnArray { .. }));
    }

    #[tokio::test]
    async fn detections_file_is_optional_and_lenient_per_record() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("detections.json");
        let none = JsonDetectionSource::new(&path).load_detections().await.expect("absent");
        assert!(none.records.is_empty());

        std::fs::write(
            &path,
            r#"[
                {"message_id": 55, "channel_name": "lobelia4cosmetics", "image_path": "a.jpg",
                 "detected_objects": ["person"], "confidence_scores": [0.8],
                 "processed_at": "2025-01-20T08:00:00"},
                {"channel_name": "missing id"}
            ]"#,
        )
        .unwrap();
        let loaded = JsonDetectionSource::new(&path).load_detections().await.expect("load");
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].message_id, "55");
        assert_eq!(loaded.stats.rejected, 1);
    }
}
