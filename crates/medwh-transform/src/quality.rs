//! Warehouse quality gate.
//!
//! Each check counts violating messages over the full output of one run. A message that
//! offends in both the staging table and the fact table is counted once. The gate never alters
//! data; in strict mode a failing check is turned into an error before anything is
//! materialized.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use medwh_core::{CleanedMessage, DetectionFactRow, MessageFactRow, RecordRef};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::Dimensions;

pub const MAX_MESSAGE_LENGTH: usize = 10_000;
pub const FRESHNESS_WARNING_HOURS: f64 = 24.0;
const SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMode {
    #[default]
    Advisory,
    Strict,
}

impl std::str::FromStr for QualityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(Self::Advisory),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown quality mode {other:?} (expected advisory|strict)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Warning => "WARNING",
            Self::Fail => "FAIL",
        })
    }
}

/// Everything a check may look at for one run.
#[derive(Debug, Clone, Copy)]
pub struct QualityContext<'a> {
    pub processed_at: DateTime<Utc>,
    pub staging: &'a [CleanedMessage],
    pub message_facts: &'a [MessageFactRow],
    pub detection_facts: &'a [DetectionFactRow],
    pub dims: &'a Dimensions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub description: &'static str,
    /// Distinct offending messages.
    pub violations: usize,
    pub status: CheckStatus,
    /// First few offending records, for the run report.
    pub sample: Vec<RecordRef>,
}

pub trait QualityCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn offenders(&self, ctx: &QualityContext<'_>) -> Vec<RecordRef>;

    fn evaluate(&self, ctx: &QualityContext<'_>) -> CheckOutcome {
        let mut seen = BTreeSet::new();
        let offenders: Vec<RecordRef> = self
            .offenders(ctx)
            .into_iter()
            .filter(|r| seen.insert(r.clone()))
            .collect();
        CheckOutcome {
            name: self.name(),
            description: self.description(),
            violations: offenders.len(),
            status: if offenders.is_empty() {
                CheckStatus::Pass
            } else {
                CheckStatus::Fail
            },
            sample: offenders.into_iter().take(SAMPLE_LIMIT).collect(),
        }
    }
}

/// Identity of a fact row, taken from its staged message so both tables name it the same way.
fn fact_ref(ctx: &QualityContext<'_>, f: &MessageFactRow) -> RecordRef {
    ctx.staging
        .iter()
        .find(|m| m.message_key == f.message_key)
        .map(CleanedMessage::record_ref)
        .unwrap_or_else(|| RecordRef::new(f.message_id.clone(), channel_name_for(ctx.dims, f.channel_key)))
}

/// Channel name for a fact row's key, or the key itself when it does not resolve.
fn channel_name_for(dims: &Dimensions, key: medwh_core::ChannelKey) -> String {
    dims.channels
        .rows()
        .iter()
        .find(|row| row.channel_key == key)
        .map(|row| row.channel_name.clone())
        .unwrap_or_else(|| key.to_string())
}

pub struct NoFutureMessages;

impl QualityCheck for NoFutureMessages {
    fn name(&self) -> &'static str {
        "no_future_messages"
    }

    fn description(&self) -> &'static str {
        "message timestamp is not later than processing time"
    }

    fn offenders(&self, ctx: &QualityContext<'_>) -> Vec<RecordRef> {
        let staged = ctx
            .staging
            .iter()
            .filter(|m| m.is_future_dated || m.message_date > ctx.processed_at)
            .map(CleanedMessage::record_ref);
        let facts = ctx
            .message_facts
            .iter()
            .filter(|f| f.message_date > ctx.processed_at)
            .map(|f| fact_ref(ctx, f));
        staged.chain(facts).collect()
    }
}

pub struct MessageLengthLimit {
    pub max_chars: usize,
}

impl Default for MessageLengthLimit {
    fn default() -> Self {
        Self {
            max_chars: MAX_MESSAGE_LENGTH,
        }
    }
}

impl QualityCheck for MessageLengthLimit {
    fn name(&self) -> &'static str {
        "message_length_within_limit"
    }

    fn description(&self) -> &'static str {
        "message text is at most 10000 characters"
    }

    fn offenders(&self, ctx: &QualityContext<'_>) -> Vec<RecordRef> {
        let staged = ctx
            .staging
            .iter()
            .filter(|m| m.message_length > self.max_chars)
            .map(CleanedMessage::record_ref);
        let facts = ctx
            .message_facts
            .iter()
            .filter(|f| f.message_length > self.max_chars)
            .map(|f| fact_ref(ctx, f));
        staged.chain(facts).collect()
    }
}

pub struct NonNegativeCounters;

impl QualityCheck for NonNegativeCounters {
    fn name(&self) -> &'static str {
        "non_negative_counters"
    }

    fn description(&self) -> &'static str {
        "view and forward counts are not negative"
    }

    fn offenders(&self, ctx: &QualityContext<'_>) -> Vec<RecordRef> {
        let staged = ctx
            .staging
            .iter()
            .filter(|m| m.view_count < 0 || m.forward_count < 0)
            .map(CleanedMessage::record_ref);
        let facts = ctx
            .message_facts
            .iter()
            .filter(|f| f.view_count < 0 || f.forward_count < 0)
            .map(|f| fact_ref(ctx, f));
        staged.chain(facts).collect()
    }
}

/// Every fact row's channel key and date key exist in the dimensions.
pub struct ReferentialIntegrity;

impl QualityCheck for ReferentialIntegrity {
    fn name(&self) -> &'static str {
        "fact_keys_resolve"
    }

    fn description(&self) -> &'static str {
        "fact channel and date keys exist in the dimensions"
    }

    fn offenders(&self, ctx: &QualityContext<'_>) -> Vec<RecordRef> {
        let dims = ctx.dims;
        let messages = ctx
            .message_facts
            .iter()
            .filter(|f| !dims.channels.contains_key(f.channel_key) || !dims.dates.contains_key(f.date_key))
            .map(|f| fact_ref(ctx, f));
        let detections = ctx
            .detection_facts
            .iter()
            .filter(|f| !dims.channels.contains_key(f.channel_key) || !dims.dates.contains_key(f.date_key))
            .map(|f| RecordRef::new(f.message_id.clone(), channel_name_for(dims, f.channel_key)));
        messages.chain(detections).collect()
    }
}

/// Hours between the newest staged message and processing time. Informational only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreshnessReport {
    pub latest_message: Option<DateTime<Utc>>,
    pub hours_since_latest: Option<f64>,
    pub status: CheckStatus,
}

impl FreshnessReport {
    pub fn measure(staging: &[CleanedMessage], processed_at: DateTime<Utc>) -> Self {
        let latest_message = staging.iter().map(|m| m.message_date).max();
        let hours_since_latest = latest_message
            .map(|latest| (processed_at - latest).num_seconds() as f64 / 3600.0)
            .map(|h| medwh_core::round_to(h, 2));
        let status = match hours_since_latest {
            Some(h) if h < FRESHNESS_WARNING_HOURS => CheckStatus::Pass,
            _ => CheckStatus::Warning,
        };
        Self {
            latest_message,
            hours_since_latest,
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub mode: QualityMode,
    pub checks: Vec<CheckOutcome>,
    pub freshness: FreshnessReport,
}

impl QualityReport {
    pub fn failed(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }

    pub fn total_violations(&self) -> usize {
        self.checks.iter().map(|c| c.violations).sum()
    }

    pub fn passed(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Advisory mode always succeeds. Strict mode fails when any check has violations.
    pub fn enforce(&self) -> Result<(), QualityGateError> {
        if self.mode == QualityMode::Advisory || self.passed() {
            return Ok(());
        }
        Err(QualityGateError::Failed {
            failures: self
                .failed()
                .map(|c| format!("{} ({} messages)", c.name, c.violations))
                .collect(),
        })
    }
}

#[derive(Debug, Error)]
pub enum QualityGateError {
    #[error("quality gate failed in strict mode: {}", failures.join(", "))]
    Failed { failures: Vec<String> },
}

pub struct QualityGate {
    mode: QualityMode,
    checks: Vec<Box<dyn QualityCheck>>,
}

impl QualityGate {
    pub fn new(mode: QualityMode) -> Self {
        Self {
            mode,
            checks: vec![
                Box::new(NoFutureMessages),
                Box::new(MessageLengthLimit::default()),
                Box::new(NonNegativeCounters),
                Box::new(ReferentialIntegrity),
            ],
        }
    }

    pub fn with_check(mut self, check: Box<dyn QualityCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn mode(&self) -> QualityMode {
        self.mode
    }

    pub fn evaluate(&self, ctx: &QualityContext<'_>) -> QualityReport {
        let checks: Vec<CheckOutcome> = self.checks.iter().map(|c| c.evaluate(ctx)).collect();
        for outcome in &checks {
            if outcome.status == CheckStatus::Fail {
                warn!(check = outcome.name, violations = outcome.violations, "quality check failed");
            } else {
                info!(check = outcome.name, "quality check passed");
            }
        }
        let freshness = FreshnessReport::measure(ctx.staging, ctx.processed_at);
        if freshness.status == CheckStatus::Warning {
            warn!(hours = ?freshness.hours_since_latest, "staged data is stale");
        }
        QualityReport {
            mode: self.mode,
            checks,
            freshness,
        }
    }
}
