//! Detection normalizer: null-safety for raw detector output.
//!
//! Only structural defects are excluded here. Confidence-based filtering is left to the
//! detection fact builder and the quality gate.

use medwh_core::{CleanedDetection, DataDefect, DetectionKey, RawDetection};
use serde::Serialize;
use tracing::warn;

/// Object label the detector emits, paired with a `0.0` score, when it finds nothing.
pub const NO_DETECTION_LABEL: &str = "no_detection";
pub const DEFAULT_IMAGE_CATEGORY: &str = "other";
pub const UNKNOWN_MODEL_VERSION: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionStats {
    pub input_rows: usize,
    pub defects: usize,
    pub placeholders_cleared: usize,
    pub emitted: usize,
}

#[derive(Debug, Clone)]
pub struct NormalizedDetections {
    pub detections: Vec<CleanedDetection>,
    pub defects: Vec<DataDefect>,
    pub stats: DetectionStats,
}

pub fn normalize_one(raw: &RawDetection) -> Result<CleanedDetection, DataDefect> {
    let mut detected_objects = raw.detected_objects.clone().unwrap_or_default();
    let mut confidence_scores = raw.confidence_scores.clone().unwrap_or_default();

    if detected_objects.len() != confidence_scores.len() {
        return Err(DataDefect::ScoreLengthMismatch {
            record: raw.record_ref(),
            objects: detected_objects.len(),
            scores: confidence_scores.len(),
        });
    }
    if let Some(&score) = confidence_scores
        .iter()
        .find(|s| !(0.0..=1.0).contains(*s))
    {
        return Err(DataDefect::ConfidenceOutOfRange {
            record: raw.record_ref(),
            score,
        });
    }
    let processed_at = raw.processed_at.ok_or_else(|| DataDefect::MissingProcessedAt {
        record: raw.record_ref(),
    })?;

    if is_placeholder(&detected_objects) {
        detected_objects.clear();
        confidence_scores.clear();
    }

    let detection_count = match raw.detection_count {
        Some(n) if !is_placeholder(raw.detected_objects.as_deref().unwrap_or_default()) => n,
        _ => detected_objects.len() as u32,
    };

    Ok(CleanedDetection {
        detection_key: DetectionKey::derive(&raw.message_id, &raw.channel_name, &raw.image_path),
        message_id: raw.message_id.clone(),
        channel_name: raw.channel_name.clone(),
        image_path: raw.image_path.clone(),
        detected_objects,
        confidence_scores,
        detection_count,
        image_category: raw
            .image_category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_IMAGE_CATEGORY)
            .to_string(),
        processing_time: raw.processing_time,
        model_version: raw
            .model_version
            .clone()
            .unwrap_or_else(|| UNKNOWN_MODEL_VERSION.to_string()),
        processed_at,
    })
}

fn is_placeholder(objects: &[String]) -> bool {
    objects.len() == 1 && objects[0] == NO_DETECTION_LABEL
}

pub fn normalize(raws: &[RawDetection]) -> NormalizedDetections {
    let mut stats = DetectionStats {
        input_rows: raws.len(),
        ..Default::default()
    };
    let mut detections = Vec::with_capacity(raws.len());
    let mut defects = Vec::new();

    for raw in raws {
        match normalize_one(raw) {
            Ok(detection) => {
                if raw
                    .detected_objects
                    .as_deref()
                    .is_some_and(is_placeholder)
                {
                    stats.placeholders_cleared += 1;
                }
                detections.push(detection);
            }
            Err(defect) => {
                warn!(
                    message_id = %raw.message_id,
                    channel = %raw.channel_name,
                    image_path = %raw.image_path,
                    %defect,
                    "detection defect"
                );
                defects.push(defect);
            }
        }
    }

    stats.defects = defects.len();
    stats.emitted = detections.len();
    NormalizedDetections {
        detections,
        defects,
        stats,
    }
}
