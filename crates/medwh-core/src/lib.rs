//! Core record model for the channel warehouse: raw inputs, cleaned staging records,
//! conformed dimension rows and fact rows.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod error;
pub mod keys;
pub mod labels;
pub mod time;

pub use error::{DataDefect, JoinError};
pub use keys::{ChannelKey, DateKey, DetectionKey, MessageKey};
pub use labels::{
    ActivityStatus, ChannelType, ContentStrategy, DetectionQuality, LengthCategory,
    ProductCategory, SceneComposition,
};

pub const CRATE_NAME: &str = "medwh-core";

/// Natural identity of a scraped message, used to point at offending records in reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub message_id: String,
    pub channel_name: String,
}

impl RecordRef {
    pub fn new(message_id: impl Into<String>, channel_name: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            channel_name: channel_name.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message {} in channel {:?}", self.message_id, self.channel_name)
    }
}

/// Message record as captured by the channel scraper. Append-only, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub message_id: String,
    pub channel_name: String,
    pub message_date: Option<DateTime<Utc>>,
    pub message_text: Option<String>,
    pub has_media: bool,
    pub image_path: Option<String>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub scraped_at: Option<DateTime<Utc>>,
    pub raw_data: JsonValue,
}

impl RawMessage {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.message_id.clone(), self.channel_name.clone())
    }
}

/// Canonical staging record. Only rows with `!is_empty && !is_future_dated` are ever emitted;
/// the flags are kept so downstream checks can re-assert the invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedMessage {
    pub message_key: MessageKey,
    pub message_id: String,
    pub channel_name: String,
    pub message_date: DateTime<Utc>,
    pub message_text: String,
    pub message_length: usize,
    pub has_media: bool,
    pub has_image: bool,
    pub image_path: Option<String>,
    pub view_count: i64,
    pub forward_count: i64,
    pub product_category: ProductCategory,
    pub is_empty: bool,
    pub is_future_dated: bool,
    pub scraped_at: Option<DateTime<Utc>>,
}

impl CleanedMessage {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.message_id.clone(), self.channel_name.clone())
    }
}

/// One row per distinct channel, recomputed wholesale every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub channel_key: ChannelKey,
    pub channel_name: String,
    pub channel_type: ChannelType,
    pub first_post_date: DateTime<Utc>,
    pub last_post_date: DateTime<Utc>,
    pub total_posts: u64,
    pub avg_views: f64,
    pub avg_forwards: f64,
    pub total_images: u64,
    pub image_percentage: f64,
    pub activity_status: ActivityStatus,
}

/// One row per calendar day of the generated horizon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRow {
    pub date_key: DateKey,
    pub full_date: NaiveDate,
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub month_name: String,
    pub week_of_year: u32,
    pub day_of_month: u32,
    /// ISO weekday, Monday = 1 through Sunday = 7.
    pub day_of_week: u32,
    pub day_name: String,
    pub day_of_year: u32,
    pub is_weekend: bool,
    pub holiday_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFactRow {
    pub message_key: MessageKey,
    pub message_id: String,
    pub channel_key: ChannelKey,
    pub date_key: DateKey,
    pub message_date: DateTime<Utc>,
    pub message_text: String,
    pub message_length: usize,
    pub view_count: i64,
    pub forward_count: i64,
    pub has_image: bool,
    pub image_path: Option<String>,
    pub product_category: ProductCategory,
    pub engagement_score: f64,
    pub length_category: LengthCategory,
}

/// Detection result as produced by the object-detection stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(deserialize_with = "keys::string_or_number")]
    pub message_id: String,
    pub channel_name: String,
    pub image_path: String,
    #[serde(default)]
    pub detected_objects: Option<Vec<String>>,
    #[serde(default)]
    pub confidence_scores: Option<Vec<f64>>,
    #[serde(default)]
    pub detection_count: Option<u32>,
    #[serde(default)]
    pub image_category: Option<String>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default, deserialize_with = "time::lenient_timestamp")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl RawDetection {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.message_id.clone(), self.channel_name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedDetection {
    pub detection_key: DetectionKey,
    pub message_id: String,
    pub channel_name: String,
    pub image_path: String,
    pub detected_objects: Vec<String>,
    pub confidence_scores: Vec<f64>,
    pub detection_count: u32,
    pub image_category: String,
    pub processing_time: Option<f64>,
    pub model_version: String,
    pub processed_at: DateTime<Utc>,
}

impl CleanedDetection {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.message_id.clone(), self.channel_name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFactRow {
    pub detection_key: DetectionKey,
    pub message_id: String,
    pub channel_key: ChannelKey,
    pub date_key: DateKey,
    pub image_path: String,
    pub detected_objects: Vec<String>,
    pub confidence_scores: Vec<f64>,
    pub detection_count: u32,
    pub image_category: String,
    pub avg_confidence: f64,
    pub max_confidence: f64,
    pub has_person: bool,
    pub has_container: bool,
    pub scene_composition: SceneComposition,
    pub detection_quality: DetectionQuality,
    pub content_strategy: ContentStrategy,
    pub processing_time: Option<f64>,
    pub model_version: String,
    pub processed_at: DateTime<Utc>,
}

/// Round half away from zero to a fixed number of decimal places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ref_display_names_both_fields() {
        let r = RecordRef::new("42", "tikvahpharma");
        assert_eq!(r.to_string(), "message 42 in channel \"tikvahpharma\"");
    }

    #[test]
    fn rounding_keeps_requested_precision() {
        assert_eq!(round_to((0.2 + 0.9) / 2.0, 4), 0.55);
        assert_eq!(round_to(12.3456, 2), 12.35);
        assert_eq!(round_to(30.0, 2), 30.0);
    }

    #[test]
    fn raw_detection_accepts_numeric_message_ids() {
        let raw: RawDetection = serde_json::from_str(
            r#"{"message_id": 1001, "channel_name": "chemed", "image_path": "a.jpg",
                "processed_at": "2025-01-15 10:00:00"}"#,
        )
        .expect("parse");
        assert_eq!(raw.message_id, "1001");
        assert!(raw.detected_objects.is_none());
        assert!(raw.processed_at.is_some());
    }
}
