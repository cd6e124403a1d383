//! Message fact builder: one fact row per cleaned message, joined to the channel and date
//! dimensions.

use medwh_core::{round_to, CleanedMessage, JoinError, LengthCategory, MessageFactRow};

use crate::staging::StagingSnapshot;
use crate::{apply_policy, Dimensions, FactBuild, JoinPolicy, TransformError};

pub const SHORT_MESSAGE_MAX: usize = 49;
pub const MEDIUM_MESSAGE_MAX: usize = 200;

pub fn engagement_score(views: i64, forwards: i64) -> f64 {
    round_to(0.7 * views as f64 + 0.3 * forwards as f64, 2)
}

pub fn length_category(message_length: usize) -> LengthCategory {
    match message_length {
        0..=SHORT_MESSAGE_MAX => LengthCategory::Short,
        n if n <= MEDIUM_MESSAGE_MAX => LengthCategory::Medium,
        _ => LengthCategory::Long,
    }
}

pub struct MessageFactBuilder<'a> {
    dims: &'a Dimensions,
    policy: JoinPolicy,
}

impl<'a> MessageFactBuilder<'a> {
    pub fn new(dims: &'a Dimensions, policy: JoinPolicy) -> Self {
        Self { dims, policy }
    }

    /// Join a single message. Unresolved keys are returned as the explicit not-found case.
    pub fn fact_for(&self, m: &CleanedMessage) -> Result<MessageFactRow, JoinError> {
        let channel_key = self
            .dims
            .channels
            .resolve(&m.channel_name)
            .ok_or_else(|| JoinError::UnknownChannel {
                record: m.record_ref(),
            })?;
        let date = m.message_date.date_naive();
        let date_key = self
            .dims
            .dates
            .resolve(date)
            .ok_or_else(|| JoinError::DateOutOfHorizon {
                record: m.record_ref(),
                date,
            })?;

        Ok(MessageFactRow {
            message_key: m.message_key,
            message_id: m.message_id.clone(),
            channel_key,
            date_key,
            message_date: m.message_date,
            message_text: m.message_text.clone(),
            message_length: m.message_length,
            view_count: m.view_count,
            forward_count: m.forward_count,
            has_image: m.has_image,
            image_path: m.image_path.clone(),
            product_category: m.product_category,
            engagement_score: engagement_score(m.view_count, m.forward_count),
            length_category: length_category(m.message_length),
        })
    }

    pub fn build(
        &self,
        snapshot: &StagingSnapshot,
    ) -> Result<FactBuild<MessageFactRow>, TransformError> {
        let expected = self.dims.channels.source_fingerprint();
        if expected != snapshot.fingerprint() {
            return Err(TransformError::TornSnapshot {
                expected: expected.to_string(),
                found: snapshot.fingerprint().to_string(),
            });
        }

        let mut rows = Vec::with_capacity(snapshot.len());
        let mut quarantined = Vec::new();
        for m in snapshot.messages() {
            if let Some(row) = apply_policy(self.policy, self.fact_for(m), &mut quarantined)? {
                rows.push(row);
            }
        }
        Ok(FactBuild { rows, quarantined })
    }
}
