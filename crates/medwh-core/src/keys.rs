//! Deterministic surrogate keys.
//!
//! Entity keys are UUIDv5 values in a fixed namespace. The hashed name tags the entity kind
//! and length-prefixes every natural-key field, so `("ab", "c")` and `("a", "bc")` never share
//! a name.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6d65_6477_682d_4b45_5953_2d76_312d_0001);

fn derive_key(kind: &str, fields: &[&str]) -> Uuid {
    let mut name = String::from(kind);
    for field in fields {
        name.push('|');
        name.push_str(&field.len().to_string());
        name.push(':');
        name.push_str(field);
    }
    Uuid::new_v5(&KEY_NAMESPACE, name.as_bytes())
}

macro_rules! uuid_key {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_key!(MessageKey);
uuid_key!(ChannelKey);
uuid_key!(DetectionKey);

impl MessageKey {
    pub fn derive(message_id: &str, channel_name: &str) -> Self {
        Self(derive_key("message", &[message_id, channel_name]))
    }
}

impl ChannelKey {
    pub fn derive(channel_name: &str) -> Self {
        Self(derive_key("channel", &[channel_name]))
    }
}

impl DetectionKey {
    pub fn derive(message_id: &str, channel_name: &str, image_path: &str) -> Self {
        Self(derive_key("detection", &[message_id, channel_name, image_path]))
    }
}

/// `YYYYMMDD` integer key of a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DateKey(i32);

impl DateKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32)
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

/// Accepts message identifiers serialized either as JSON numbers or strings.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Int(i64),
        Str(String),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Int(n) => n.to_string(),
        Id::Str(s) => s.trim().to_string(),
    })
}
