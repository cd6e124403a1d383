//! Ordered classification rule tables.
//!
//! Each table is an explicit list of `(predicate, label)` pairs evaluated top to bottom with a
//! fallback label. Tables are YAML files under the rules directory; the copies shipped in the
//! repository's `rules/` directory are compiled in as defaults.

use std::path::{Path, PathBuf};

use medwh_core::{ChannelType, ContentStrategy, ProductCategory};
use serde::Deserialize;
use thiserror::Error;

const PRODUCT_CATEGORIES_YAML: &str = include_str!("../../../rules/product_categories.yaml");
const CHANNEL_TYPES_YAML: &str = include_str!("../../../rules/channel_types.yaml");
const CONTENT_STRATEGIES_YAML: &str = include_str!("../../../rules/content_strategies.yaml");
const HOLIDAYS_YAML: &str = include_str!("../../../rules/holidays.yaml");

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {name}: {source}")]
    Parse {
        name: String,
        source: serde_yaml::Error,
    },
    #[error("{name}: holiday {month}-{day} is not a calendar day")]
    InvalidHoliday { name: String, month: u32, day: u32 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "L: Deserialize<'de>"))]
struct RuleFile<L> {
    #[allow(dead_code)]
    version: u32,
    default: L,
    #[serde(default)]
    rules: Vec<Rule<L>>,
}

/// One `(predicate, label)` pair. The predicate holds when the lower-cased input equals any
/// `equals_any` entry or contains any `contains_any` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rule<L> {
    pub label: L,
    #[serde(default)]
    pub contains_any: Vec<String>,
    #[serde(default)]
    pub equals_any: Vec<String>,
}

impl<L> Rule<L> {
    fn matches(&self, haystack: &str) -> bool {
        self.equals_any.iter().any(|needle| haystack == needle)
            || self.contains_any.iter().any(|needle| haystack.contains(needle.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleTable<L> {
    rules: Vec<Rule<L>>,
    default: L,
}

impl<L: Copy> RuleTable<L> {
    pub fn new(rules: Vec<Rule<L>>, default: L) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| Rule {
                label: rule.label,
                contains_any: rule.contains_any.iter().map(|n| n.to_lowercase()).collect(),
                equals_any: rule.equals_any.iter().map(|n| n.to_lowercase()).collect(),
            })
            .collect();
        Self { rules, default }
    }

    /// First-match-wins classification of `input`, case-insensitive.
    pub fn classify(&self, input: &str) -> L {
        let haystack = input.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&haystack))
            .map(|rule| rule.label)
            .unwrap_or(self.default)
    }

    pub fn default_label(&self) -> L {
        self.default
    }

    pub fn rules(&self) -> &[Rule<L>] {
        &self.rules
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Holiday {
    pub month: u32,
    pub day: u32,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HolidayFile {
    #[allow(dead_code)]
    version: u32,
    default: String,
    #[serde(default)]
    holidays: Vec<Holiday>,
}

/// Fixed month/day holiday rules; the first listed holiday for a day wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolidayCalendar {
    holidays: Vec<Holiday>,
    default_label: String,
}

impl HolidayCalendar {
    pub fn new(holidays: Vec<Holiday>, default_label: impl Into<String>) -> Self {
        Self {
            holidays,
            default_label: default_label.into(),
        }
    }

    pub fn label_for(&self, month: u32, day: u32) -> &str {
        self.holidays
            .iter()
            .find(|h| h.month == month && h.day == day)
            .map(|h| h.label.as_str())
            .unwrap_or(&self.default_label)
    }
}

/// Every rule table the transformations consult.
#[derive(Debug, Clone)]
pub struct RuleBook {
    pub product_categories: RuleTable<ProductCategory>,
    pub channel_types: RuleTable<ChannelType>,
    pub content_strategies: RuleTable<ContentStrategy>,
    pub holidays: HolidayCalendar,
}

impl RuleBook {
    pub fn builtin() -> Result<Self, RuleError> {
        Ok(Self {
            product_categories: parse_table("product_categories.yaml", PRODUCT_CATEGORIES_YAML)?,
            channel_types: parse_table("channel_types.yaml", CHANNEL_TYPES_YAML)?,
            content_strategies: parse_table("content_strategies.yaml", CONTENT_STRATEGIES_YAML)?,
            holidays: parse_holidays("holidays.yaml", HOLIDAYS_YAML)?,
        })
    }

    /// Load rule files from `dir`, falling back to the built-in table for any file that
    /// does not exist.
    pub fn from_dir(dir: &Path) -> Result<Self, RuleError> {
        Ok(Self {
            product_categories: parse_table(
                "product_categories.yaml",
                &read_or_builtin(dir, "product_categories.yaml", PRODUCT_CATEGORIES_YAML)?,
            )?,
            channel_types: parse_table(
                "channel_types.yaml",
                &read_or_builtin(dir, "channel_types.yaml", CHANNEL_TYPES_YAML)?,
            )?,
            content_strategies: parse_table(
                "content_strategies.yaml",
                &read_or_builtin(dir, "content_strategies.yaml", CONTENT_STRATEGIES_YAML)?,
            )?,
            holidays: parse_holidays(
                "holidays.yaml",
                &read_or_builtin(dir, "holidays.yaml", HOLIDAYS_YAML)?,
            )?,
        })
    }
}

fn read_or_builtin(dir: &Path, name: &str, builtin: &str) -> Result<String, RuleError> {
    let path = dir.join(name);
    if !path.exists() {
        tracing::debug!(path = %path.display(), "rule file absent; using built-in table");
        return Ok(builtin.to_string());
    }
    std::fs::read_to_string(&path).map_err(|source| RuleError::Read { path, source })
}

fn parse_table<L>(name: &str, text: &str) -> Result<RuleTable<L>, RuleError>
where
    L: Copy + for<'de> Deserialize<'de>,
{
    let file: RuleFile<L> = serde_yaml::from_str(text).map_err(|source| RuleError::Parse {
        name: name.to_string(),
        source,
    })?;
    Ok(RuleTable::new(file.rules, file.default))
}

fn parse_holidays(name: &str, text: &str) -> Result<HolidayCalendar, RuleError> {
    let file: HolidayFile = serde_yaml::from_str(text).map_err(|source| RuleError::Parse {
        name: name.to_string(),
        source,
    })?;
    for h in &file.holidays {
        // Feb 29 is allowed; it only ever matches in leap years.
        if chrono::NaiveDate::from_ymd_opt(2024, h.month, h.day).is_none() {
            return Err(RuleError::InvalidHoliday {
                name: name.to_string(),
                month: h.month,
                day: h.day,
            });
        }
    }
    Ok(HolidayCalendar::new(file.holidays, file.default))
}
