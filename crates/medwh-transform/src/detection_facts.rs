//! Detection fact builder: confidence statistics and scene classification per detection,
//! joined to the channel dimension and to the date of processing.

use medwh_core::{
    round_to, CleanedDetection, ContentStrategy, DetectionFactRow, DetectionQuality, JoinError,
    SceneComposition,
};

use crate::rules::RuleTable;
use crate::{apply_policy, Dimensions, FactBuild, JoinPolicy, TransformError};

pub const PERSON_LABEL: &str = "person";
pub const CONTAINER_LABELS: [&str; 4] = ["bottle", "cup", "bowl", "vase"];

pub const MEDIUM_CONFIDENCE_FLOOR: f64 = 0.3;
pub const HIGH_CONFIDENCE_FLOOR: f64 = 0.7;

/// `(avg, max)` of the scores, both rounded to 4 places; `(0, 0)` for an empty set.
pub fn confidence_stats(scores: &[f64]) -> (f64, f64) {
    if scores.is_empty() {
        return (0.0, 0.0);
    }
    let sum: f64 = scores.iter().sum();
    let max = scores.iter().copied().fold(0.0_f64, f64::max);
    (round_to(sum / scores.len() as f64, 4), round_to(max, 4))
}

pub fn detection_quality(scores: &[f64], avg_confidence: f64) -> DetectionQuality {
    if scores.is_empty() {
        DetectionQuality::NoDetection
    } else if avg_confidence >= HIGH_CONFIDENCE_FLOOR {
        DetectionQuality::High
    } else if avg_confidence >= MEDIUM_CONFIDENCE_FLOOR {
        DetectionQuality::Medium
    } else {
        DetectionQuality::Low
    }
}

pub fn scene_composition(has_person: bool, has_container: bool) -> SceneComposition {
    match (has_person, has_container) {
        (true, true) => SceneComposition::PersonWithProduct,
        (true, false) => SceneComposition::PersonOnly,
        (false, true) => SceneComposition::ProductOnly,
        (false, false) => SceneComposition::NoPersonOrProduct,
    }
}

fn has_label(objects: &[String], wanted: impl Fn(&str) -> bool) -> bool {
    objects.iter().any(|o| wanted(o.trim().to_lowercase().as_str()))
}

pub struct DetectionFactBuilder<'a> {
    dims: &'a Dimensions,
    content_strategies: &'a RuleTable<ContentStrategy>,
    policy: JoinPolicy,
}

impl<'a> DetectionFactBuilder<'a> {
    pub fn new(
        dims: &'a Dimensions,
        content_strategies: &'a RuleTable<ContentStrategy>,
        policy: JoinPolicy,
    ) -> Self {
        Self {
            dims,
            content_strategies,
            policy,
        }
    }

    pub fn fact_for(&self, d: &CleanedDetection) -> Result<DetectionFactRow, JoinError> {
        let channel_key = self
            .dims
            .channels
            .resolve(&d.channel_name)
            .ok_or_else(|| JoinError::UnknownChannel {
                record: d.record_ref(),
            })?;
        let date = d.processed_at.date_naive();
        let date_key = self
            .dims
            .dates
            .resolve(date)
            .ok_or_else(|| JoinError::DateOutOfHorizon {
                record: d.record_ref(),
                date,
            })?;

        let (avg_confidence, max_confidence) = confidence_stats(&d.confidence_scores);
        let has_person = has_label(&d.detected_objects, |o| o == PERSON_LABEL);
        let has_container = has_label(&d.detected_objects, |o| CONTAINER_LABELS.contains(&o));

        Ok(DetectionFactRow {
            detection_key: d.detection_key,
            message_id: d.message_id.clone(),
            channel_key,
            date_key,
            image_path: d.image_path.clone(),
            detected_objects: d.detected_objects.clone(),
            confidence_scores: d.confidence_scores.clone(),
            detection_count: d.detection_count,
            image_category: d.image_category.clone(),
            avg_confidence,
            max_confidence,
            has_person,
            has_container,
            scene_composition: scene_composition(has_person, has_container),
            detection_quality: detection_quality(&d.confidence_scores, avg_confidence),
            content_strategy: self.content_strategies.classify(d.image_category.trim()),
            processing_time: d.processing_time,
            model_version: d.model_version.clone(),
            processed_at: d.processed_at,
        })
    }

    pub fn build(
        &self,
        detections: &[CleanedDetection],
    ) -> Result<FactBuild<DetectionFactRow>, TransformError> {
        let mut rows = Vec::with_capacity(detections.len());
        let mut quarantined = Vec::new();
        for d in detections {
            if let Some(row) = apply_policy(self.policy, self.fact_for(d), &mut quarantined)? {
                rows.push(row);
            }
        }
        Ok(FactBuild { rows, quarantined })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelDimension;
    use crate::dates::{DateDimension, DateHorizon};
    use crate::rules::RuleBook;
    use crate::staging::StagingSnapshot;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use medwh_core::{CleanedMessage, DateKey, DetectionKey, MessageKey, ProductCategory};

    fn processed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap()
    }

    fn dims() -> Dimensions {
        let book = RuleBook::builtin().unwrap();
        let message = CleanedMessage {
            message_key: MessageKey::derive("55", "lobelia4cosmetics"),
            message_id: "55".into(),
            channel_name: "lobelia4cosmetics".into(),
            message_date: processed_at() - Duration::days(2),
            message_text: "Sunscreen SPF 50".into(),
            message_length: 16,
            has_media: true,
            has_image: true,
            image_path: Some("img/55.jpg".into()),
            view_count: 10,
            forward_count: 0,
            product_category: ProductCategory::Cosmetics,
            is_empty: false,
            is_future_dated: false,
            scraped_at: None,
        };
        let snapshot = StagingSnapshot::new(vec![message]);
        let horizon = DateHorizon::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
        )
        .unwrap();
        Dimensions::new(
            ChannelDimension::build(&snapshot, &book.channel_types, processed_at()),
            DateDimension::build(horizon, &book.holidays),
        )
    }

    fn detection(channel: &str, objects: &[&str], scores: &[f64], category: &str) -> CleanedDetection {
        CleanedDetection {
            detection_key: DetectionKey::derive("55", channel, "img/55.jpg"),
            message_id: "55".into(),
            channel_name: channel.into(),
            image_path: "img/55.jpg".into(),
            detected_objects: objects.iter().map(|o| o.to_string()).collect(),
            confidence_scores: scores.to_vec(),
            detection_count: objects.len() as u32,
            image_category: category.into(),
            processing_time: Some(0.3),
            model_version: "yolov8n".into(),
            processed_at: processed_at(),
        }
    }

    #[test]
    fn mixed_scores_are_medium_confidence() {
        let (avg, max) = confidence_stats(&[0.2, 0.9]);
        assert_eq!(avg, 0.55);
        assert_eq!(max, 0.9);
        assert_eq!(detection_quality(&[0.2, 0.9], avg), DetectionQuality::Medium);
    }

    #[test]
    fn empty_score_set_is_zero_and_no_detection() {
        assert_eq!(confidence_stats(&[]), (0.0, 0.0));
        assert_eq!(detection_quality(&[], 0.0), DetectionQuality::NoDetection);
    }

    #[test]
    fn tier_boundaries_close_on_the_lower_bound() {
        assert_eq!(detection_quality(&[0.3], 0.3), DetectionQuality::Medium);
        assert_eq!(detection_quality(&[0.7], 0.7), DetectionQuality::High);
        assert_eq!(detection_quality(&[0.2999], 0.2999), DetectionQuality::Low);
        assert_eq!(detection_quality(&[0.0], 0.0), DetectionQuality::Low);
    }

    #[test]
    fn person_and_bottle_is_person_with_product() {
        let dims = dims();
        let book = RuleBook::builtin().unwrap();
        let builder = DetectionFactBuilder::new(&dims, &book.content_strategies, JoinPolicy::Strict);
        let row = builder
            .fact_for(&detection("lobelia4cosmetics", &["person", "bottle"], &[0.2, 0.9], "promotional"))
            .expect("fact");
        assert!(row.has_person);
        assert!(row.has_container);
        assert_eq!(row.scene_composition, SceneComposition::PersonWithProduct);
        assert_eq!(row.avg_confidence, 0.55);
        assert_eq!(row.max_confidence, 0.9);
        assert_eq!(row.detection_quality, DetectionQuality::Medium);
        assert_eq!(row.content_strategy, ContentStrategy::PromotionalContent);
        assert_eq!(row.date_key, DateKey::from_date(processed_at().date_naive()));
    }

    #[test]
    fn scene_composition_covers_all_four_cells() {
        let dims = dims();
        let book = RuleBook::builtin().unwrap();
        let builder = DetectionFactBuilder::new(&dims, &book.content_strategies, JoinPolicy::Strict);
        let scene = |objects: &[&str]| {
            let scores = vec![0.8; objects.len()];
            builder
                .fact_for(&detection("lobelia4cosmetics", objects, &scores, "other"))
                .expect("fact")
                .scene_composition
        };
        assert_eq!(scene(&["person"]), SceneComposition::PersonOnly);
        assert_eq!(scene(&["cup", "bowl"]), SceneComposition::ProductOnly);
        assert_eq!(scene(&["car"]), SceneComposition::NoPersonOrProduct);
        assert_eq!(scene(&[]), SceneComposition::NoPersonOrProduct);
    }

    #[test]
    fn unknown_channel_is_quarantined_when_asked() {
        let dims = dims();
        let book = RuleBook::builtin().unwrap();
        let detections = vec![
            detection("lobelia4cosmetics", &["vase"], &[0.75], "product_display"),
            detection("ghost_channel", &["person"], &[0.9], "lifestyle"),
        ];

        let strict = DetectionFactBuilder::new(&dims, &book.content_strategies, JoinPolicy::Strict)
            .build(&detections);
        assert!(matches!(
            strict,
            Err(TransformError::Join(JoinError::UnknownChannel { .. }))
        ));

        let facts = DetectionFactBuilder::new(&dims, &book.content_strategies, JoinPolicy::Quarantine)
            .build(&detections)
            .expect("facts");
        assert_eq!(facts.rows.len(), 1);
        assert_eq!(facts.rows[0].detection_quality, DetectionQuality::High);
        assert_eq!(facts.rows[0].content_strategy, ContentStrategy::ProductShowcase);
        assert_eq!(facts.quarantined[0].record.channel_name, "ghost_channel");
    }
}
