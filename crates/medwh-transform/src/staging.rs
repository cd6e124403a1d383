//! Staging cleaner: raw scraped messages → canonical cleaned messages.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use medwh_core::{CleanedMessage, DataDefect, MessageKey, ProductCategory, RawMessage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::rules::RuleTable;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StagingStats {
    pub input_rows: usize,
    pub duplicates_replaced: usize,
    pub defects: usize,
    pub empty_excluded: usize,
    pub future_excluded: usize,
    pub emitted: usize,
}

/// Immutable set of cleaned messages shared by every downstream builder of one run.
///
/// The fingerprint covers every message key and the fields the dimension and fact builders
/// read, so two snapshots with equal fingerprints yield equal downstream tables.
#[derive(Debug, Clone)]
pub struct StagingSnapshot {
    messages: Arc<[CleanedMessage]>,
    fingerprint: String,
}

impl StagingSnapshot {
    pub fn new(messages: Vec<CleanedMessage>) -> Self {
        let mut hasher = Sha256::new();
        for m in &messages {
            hasher.update(m.message_key.as_uuid().as_bytes());
            hasher.update(m.channel_name.as_bytes());
            hasher.update(m.message_date.to_rfc3339().as_bytes());
            hasher.update(m.view_count.to_le_bytes());
            hasher.update(m.forward_count.to_le_bytes());
            hasher.update([u8::from(m.has_image)]);
            hasher.update(m.product_category.as_str().as_bytes());
            hasher.update((m.message_text.len() as u64).to_le_bytes());
            hasher.update(m.message_text.as_bytes());
        }
        Self {
            messages: messages.into(),
            fingerprint: hex::encode(hasher.finalize()),
        }
    }

    pub fn messages(&self) -> &[CleanedMessage] {
        &self.messages
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StagingOutput {
    pub snapshot: StagingSnapshot,
    pub defects: Vec<DataDefect>,
    pub stats: StagingStats,
}

pub struct StagingCleaner<'a> {
    product_categories: &'a RuleTable<ProductCategory>,
}

impl<'a> StagingCleaner<'a> {
    pub fn new(product_categories: &'a RuleTable<ProductCategory>) -> Self {
        Self { product_categories }
    }

    /// Clean a single record without filtering; the returned row may carry
    /// `is_empty`/`is_future_dated` flags.
    pub fn clean_one(
        &self,
        raw: &RawMessage,
        processed_at: DateTime<Utc>,
    ) -> Result<CleanedMessage, DataDefect> {
        let message_date = raw.message_date.ok_or_else(|| DataDefect::MissingTimestamp {
            record: raw.record_ref(),
        })?;
        let view_count = non_negative(raw, "view", raw.views)?;
        let forward_count = non_negative(raw, "forward", raw.forwards)?;

        let message_text = raw.message_text.as_deref().unwrap_or_default().trim().to_string();
        let image_path = raw
            .image_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        Ok(CleanedMessage {
            message_key: MessageKey::derive(&raw.message_id, &raw.channel_name),
            message_id: raw.message_id.clone(),
            channel_name: raw.channel_name.clone(),
            message_date,
            message_length: message_text.chars().count(),
            is_empty: message_text.is_empty(),
            is_future_dated: message_date > processed_at,
            product_category: self.product_categories.classify(&message_text),
            message_text,
            has_media: raw.has_media,
            has_image: image_path.is_some(),
            image_path,
            view_count,
            forward_count,
            scraped_at: raw.scraped_at,
        })
    }

    /// Clean a full raw snapshot. Duplicate `(message_id, channel_name)` pairs keep the most
    /// recently captured record (ties go to the higher [`capture_rank`]); defective, empty and
    /// future-dated rows are excluded.
    pub fn run(&self, raws: &[RawMessage], processed_at: DateTime<Utc>) -> StagingOutput {
        let mut stats = StagingStats {
            input_rows: raws.len(),
            ..Default::default()
        };

        let mut latest: BTreeMap<MessageKey, &RawMessage> = BTreeMap::new();
        for raw in raws {
            let key = MessageKey::derive(&raw.message_id, &raw.channel_name);
            match latest.get(&key) {
                Some(existing) if capture_rank(existing) >= capture_rank(raw) => {
                    stats.duplicates_replaced += 1;
                }
                Some(_) => {
                    stats.duplicates_replaced += 1;
                    latest.insert(key, raw);
                }
                None => {
                    latest.insert(key, raw);
                }
            }
        }

        let mut defects = Vec::new();
        let mut cleaned = Vec::with_capacity(latest.len());
        for raw in latest.into_values() {
            match self.clean_one(raw, processed_at) {
                Ok(row) if row.is_empty => {
                    debug!(message_id = %row.message_id, channel = %row.channel_name, "excluding empty message");
                    stats.empty_excluded += 1;
                }
                Ok(row) if row.is_future_dated => {
                    debug!(message_id = %row.message_id, channel = %row.channel_name, "excluding future-dated message");
                    stats.future_excluded += 1;
                }
                Ok(row) => cleaned.push(row),
                Err(defect) => {
                    warn!(
                        message_id = %defect.record().message_id,
                        channel = %defect.record().channel_name,
                        %defect,
                        "staging defect"
                    );
                    defects.push(defect);
                }
            }
        }

        cleaned.sort_by(|a, b| {
            (&a.channel_name, a.message_date, &a.message_id)
                .cmp(&(&b.channel_name, b.message_date, &b.message_id))
        });
        stats.defects = defects.len();
        stats.emitted = cleaned.len();

        StagingOutput {
            snapshot: StagingSnapshot::new(cleaned),
            defects,
            stats,
        }
    }
}

fn non_negative(raw: &RawMessage, field: &'static str, value: Option<i64>) -> Result<i64, DataDefect> {
    match value.unwrap_or(0) {
        v if v < 0 => Err(DataDefect::NegativeCounter {
            record: raw.record_ref(),
            field,
            value: v,
        }),
        v => Ok(v),
    }
}

/// Ordering between captures of the same message, independent of input order.
fn capture_rank(
    raw: &RawMessage,
) -> (
    Option<DateTime<Utc>>,
    Option<i64>,
    Option<i64>,
    Option<DateTime<Utc>>,
    Option<&str>,
    Option<&str>,
) {
    (
        raw.scraped_at,
        raw.views,
        raw.forwards,
        raw.message_date,
        raw.message_text.as_deref(),
        raw.image_path.as_deref(),
    )
}
