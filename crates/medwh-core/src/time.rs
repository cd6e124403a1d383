//! Lenient timestamp parsing for scraped and detector-produced records.
//!
//! Everything is normalized to UTC; naive timestamps are taken to already be UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Serde adapter: absent, null or unparseable timestamps all become `None`; the stage that
/// needs the value reports the record as a defect.
pub fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_with_offset_into_utc() {
        let ts = parse_timestamp("2025-01-15T12:30:00+03:00").expect("ts");
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 1, 15, 9, 30, 0).unwrap());
        assert!(parse_timestamp("2025-01-15T09:30:00Z").is_some());
    }

    #[test]
    fn parses_naive_forms_as_utc() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 15, 9, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2025-01-15 09:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-01-15T09:30:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2025-01-15"),
            Some(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2025-13-40"), None);
    }
}
