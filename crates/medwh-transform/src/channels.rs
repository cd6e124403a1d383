//! Channel dimension: per-channel statistics and classification, recomputed from a complete
//! staging snapshot on every run.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use medwh_core::{round_to, ActivityStatus, ChannelKey, ChannelRow, ChannelType, CleanedMessage};

use crate::rules::RuleTable;
use crate::staging::StagingSnapshot;

pub const ACTIVE_WINDOW_DAYS: i64 = 7;
pub const RECENT_WINDOW_DAYS: i64 = 30;

/// Activity from the elapsed time between the last post and processing time.
pub fn activity_status(last_post: DateTime<Utc>, processed_at: DateTime<Utc>) -> ActivityStatus {
    let elapsed = processed_at - last_post;
    if elapsed <= Duration::days(ACTIVE_WINDOW_DAYS) {
        ActivityStatus::Active
    } else if elapsed <= Duration::days(RECENT_WINDOW_DAYS) {
        ActivityStatus::RecentlyActive
    } else {
        ActivityStatus::Inactive
    }
}

/// Rows are sorted by channel name; `keys` holds the same channel keys in key order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDimension {
    rows: Vec<ChannelRow>,
    keys: Vec<ChannelKey>,
    source_fingerprint: String,
}

impl ChannelDimension {
    pub fn build(
        snapshot: &StagingSnapshot,
        channel_types: &RuleTable<ChannelType>,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let mut groups: BTreeMap<&str, Vec<&CleanedMessage>> = BTreeMap::new();
        for m in snapshot.messages() {
            groups.entry(m.channel_name.as_str()).or_default().push(m);
        }

        let rows: Vec<ChannelRow> = groups
            .into_iter()
            .filter_map(|(name, messages)| channel_row(name, &messages, channel_types, processed_at))
            .collect();
        let mut keys: Vec<ChannelKey> = rows.iter().map(|row| row.channel_key).collect();
        keys.sort_unstable();

        Self {
            rows,
            keys,
            source_fingerprint: snapshot.fingerprint().to_string(),
        }
    }

    pub fn rows(&self) -> &[ChannelRow] {
        &self.rows
    }

    /// Fingerprint of the staging snapshot these statistics were computed from.
    pub fn source_fingerprint(&self) -> &str {
        &self.source_fingerprint
    }

    pub fn resolve(&self, channel_name: &str) -> Option<ChannelKey> {
        self.rows
            .binary_search_by(|row| row.channel_name.as_str().cmp(channel_name))
            .ok()
            .map(|i| self.rows[i].channel_key)
    }

    pub fn contains_key(&self, key: ChannelKey) -> bool {
        self.keys.binary_search(&key).is_ok()
    }
}

fn channel_row(
    name: &str,
    messages: &[&CleanedMessage],
    channel_types: &RuleTable<ChannelType>,
    processed_at: DateTime<Utc>,
) -> Option<ChannelRow> {
    let first_post_date = messages.iter().map(|m| m.message_date).min()?;
    let last_post_date = messages.iter().map(|m| m.message_date).max()?;
    let total = messages.len() as u64;
    let total_images = messages.iter().filter(|m| m.has_image).count() as u64;
    let views: i64 = messages.iter().map(|m| m.view_count).sum();
    let forwards: i64 = messages.iter().map(|m| m.forward_count).sum();

    Some(ChannelRow {
        channel_key: ChannelKey::derive(name),
        channel_name: name.to_string(),
        channel_type: channel_types.classify(name),
        first_post_date,
        last_post_date,
        total_posts: total,
        avg_views: round_to(views as f64 / total as f64, 2),
        avg_forwards: round_to(forwards as f64 / total as f64, 2),
        total_images,
        image_percentage: round_to(100.0 * total_images as f64 / total as f64, 2),
        activity_status: activity_status(last_post_date, processed_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleBook;
    use chrono::TimeZone;
    use medwh_core::{MessageKey, ProductCategory};

    fn processed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap()
    }

    fn msg(id: usize, channel: &str, age: Duration, image: bool, views: i64) -> CleanedMessage {
        let message_id = id.to_string();
        CleanedMessage {
            message_key: MessageKey::derive(&message_id, channel),
            message_id,
            channel_name: channel.to_string(),
            message_date: processed_at() - age,
            message_text: "text".into(),
            message_length: 4,
            has_media: image,
            has_image: image,
            image_path: image.then(|| format!("{channel}/{id}.jpg")),
            view_count: views,
            forward_count: 1,
            product_category: ProductCategory::Other,
            is_empty: false,
            is_future_dated: false,
            scraped_at: None,
        }
    }

    #[test]
    fn ten_messages_three_images_is_thirty_percent() {
        let book = RuleBook::builtin().unwrap();
        let messages = (0..10)
            .map(|i| msg(i, "tikvahpharma", Duration::days(i as i64), i < 3, 100 + i as i64))
            .collect();
        let snapshot = StagingSnapshot::new(messages);
        let dim = ChannelDimension::build(&snapshot, &book.channel_types, processed_at());

        assert_eq!(dim.rows().len(), 1);
        let row = &dim.rows()[0];
        assert_eq!(row.total_posts, 10);
        assert_eq!(row.total_images, 3);
        assert_eq!(row.image_percentage, 30.0);
        assert_eq!(row.avg_views, 104.5);
        assert_eq!(row.avg_forwards, 1.0);
        assert_eq!(row.channel_type, ChannelType::Pharmaceutical);
        assert_eq!(row.first_post_date, processed_at() - Duration::days(9));
        assert_eq!(row.last_post_date, processed_at());
        assert_eq!(row.activity_status, ActivityStatus::Active);
        assert_eq!(dim.source_fingerprint(), snapshot.fingerprint());
    }

    #[test]
    fn one_row_per_channel_with_stable_keys() {
        let book = RuleBook::builtin().unwrap();
        let snapshot = StagingSnapshot::new(vec![
            msg(1, "chemed", Duration::days(1), false, 5),
            msg(2, "lobelia4cosmetics", Duration::days(40), true, 7),
            msg(3, "chemed", Duration::days(2), false, 9),
        ]);
        let dim = ChannelDimension::build(&snapshot, &book.channel_types, processed_at());
        let names: Vec<_> = dim.rows().iter().map(|r| r.channel_name.as_str()).collect();
        assert_eq!(names, vec!["chemed", "lobelia4cosmetics"]);
        assert_eq!(dim.resolve("chemed"), Some(ChannelKey::derive("chemed")));
        assert_eq!(dim.resolve("unknown"), None);
        assert_eq!(dim.resolve("lobelia4cosmetics"), Some(ChannelKey::derive("lobelia4cosmetics")));
        for row in dim.rows() {
            assert!(dim.contains_key(row.channel_key));
        }
        assert!(!dim.contains_key(ChannelKey::derive("unknown")));
        assert_eq!(dim.rows()[1].activity_status, ActivityStatus::Inactive);
        assert_eq!(dim.rows()[1].channel_type, ChannelType::Cosmetics);
        assert_eq!(dim.rows()[0].channel_type, ChannelType::Medical);
    }

    #[test]
    fn activity_windows_are_inclusive() {
        let now = processed_at();
        assert_eq!(activity_status(now - Duration::days(7), now), ActivityStatus::Active);
        assert_eq!(
            activity_status(now - Duration::days(7) - Duration::seconds(1), now),
            ActivityStatus::RecentlyActive
        );
        assert_eq!(activity_status(now - Duration::days(30), now), ActivityStatus::RecentlyActive);
        assert_eq!(activity_status(now - Duration::days(31), now), ActivityStatus::Inactive);
    }

    #[test]
    fn rebuild_replaces_statistics_wholesale() {
        let book = RuleBook::builtin().unwrap();
        let first = StagingSnapshot::new(vec![msg(1, "chemed", Duration::days(1), false, 10)]);
        let second = StagingSnapshot::new(vec![
            msg(1, "chemed", Duration::days(1), false, 10),
            msg(2, "chemed", Duration::hours(1), true, 30),
        ]);
        let a = ChannelDimension::build(&first, &book.channel_types, processed_at());
        let b = ChannelDimension::build(&second, &book.channel_types, processed_at());
        assert_eq!(a.rows()[0].channel_key, b.rows()[0].channel_key);
        assert_eq!(b.rows()[0].total_posts, 2);
        assert_eq!(b.rows()[0].avg_views, 20.0);
        assert_eq!(b.rows()[0].image_percentage, 50.0);
        assert_ne!(a.source_fingerprint(), b.source_fingerprint());
    }
}
