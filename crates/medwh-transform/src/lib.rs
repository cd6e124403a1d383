//! Transformation core: staging, dimension and fact builders plus the quality gate.
//!
//! Every stage is a synchronous, deterministic batch transform. Processing time is always an
//! explicit parameter.

use std::sync::Arc;

use chrono::NaiveDate;
use medwh_core::{JoinError, RecordRef};
use serde::Serialize;
use thiserror::Error;

pub mod channels;
pub mod dates;
pub mod detection_facts;
pub mod detections;
pub mod message_facts;
pub mod quality;
pub mod rules;
pub mod staging;

pub use channels::ChannelDimension;
pub use dates::{DateDimension, DateHorizon};
pub use detection_facts::DetectionFactBuilder;
pub use detections::{normalize, normalize_one, DetectionStats, NormalizedDetections};
pub use message_facts::MessageFactBuilder;
pub use quality::{
    CheckOutcome, CheckStatus, FreshnessReport, QualityCheck, QualityContext, QualityGate,
    QualityGateError, QualityMode, QualityReport,
};
pub use rules::{HolidayCalendar, Rule, RuleBook, RuleError, RuleTable};
pub use staging::{StagingCleaner, StagingOutput, StagingSnapshot, StagingStats};

pub const CRATE_NAME: &str = "medwh-transform";

/// Aggregate or join stage failure. Any of these aborts the run before materialization.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("date range start {start} is after end {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },
    #[error("unresolved dimension key: {0}")]
    Join(#[from] JoinError),
    #[error("channel dimension was built from staging snapshot {expected}, facts are joining snapshot {found}")]
    TornSnapshot { expected: String, found: String },
}

/// What a fact builder does with a row whose dimension key cannot be resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    #[default]
    Strict,
    Quarantine,
}

impl std::str::FromStr for JoinPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "quarantine" => Ok(Self::Quarantine),
            other => Err(format!("unknown join policy {other:?} (expected strict|quarantine)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantinedRow {
    pub record: RecordRef,
    pub reason: JoinError,
}

/// Output of a fact builder: emitted rows plus, under [`JoinPolicy::Quarantine`], the rows
/// held back because a key did not resolve.
#[derive(Debug, Clone)]
pub struct FactBuild<T> {
    pub rows: Vec<T>,
    pub quarantined: Vec<QuarantinedRow>,
}

/// Frozen dimension tables shared read-only by both fact builders for one run.
#[derive(Debug, Clone)]
pub struct Dimensions {
    pub channels: Arc<ChannelDimension>,
    pub dates: Arc<DateDimension>,
}

impl Dimensions {
    pub fn new(channels: ChannelDimension, dates: DateDimension) -> Self {
        Self {
            channels: Arc::new(channels),
            dates: Arc::new(dates),
        }
    }
}

/// Apply `policy` to a single join outcome. `Ok(None)` means the row was quarantined.
pub(crate) fn apply_policy<T>(
    policy: JoinPolicy,
    outcome: Result<T, JoinError>,
    quarantined: &mut Vec<QuarantinedRow>,
) -> Result<Option<T>, TransformError> {
    match (outcome, policy) {
        (Ok(row), _) => Ok(Some(row)),
        (Err(err), JoinPolicy::Strict) => Err(err.into()),
        (Err(err), JoinPolicy::Quarantine) => {
            tracing::warn!(
                message_id = %err.record().message_id,
                channel = %err.record().channel_name,
                reason = %err,
                "quarantining fact row"
            );
            quarantined.push(QuarantinedRow {
                record: err.record().clone(),
                reason: err,
            });
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_policy_parses_case_insensitively() {
        assert_eq!("Strict".parse::<JoinPolicy>(), Ok(JoinPolicy::Strict));
        assert_eq!(" quarantine ".parse::<JoinPolicy>(), Ok(JoinPolicy::Quarantine));
        assert!("lenient".parse::<JoinPolicy>().is_err());
        assert_eq!(JoinPolicy::default(), JoinPolicy::Strict);
    }

    #[test]
    fn quarantine_collects_instead_of_failing() {
        let err = JoinError::UnknownChannel {
            record: RecordRef::new("1", "ghost"),
        };
        let mut held = Vec::new();
        let out = apply_policy::<()>(JoinPolicy::Quarantine, Err(err.clone()), &mut held).unwrap();
        assert!(out.is_none());
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].record.channel_name, "ghost");

        let strict = apply_policy::<()>(JoinPolicy::Strict, Err(err), &mut held);
        assert!(matches!(strict, Err(TransformError::Join(JoinError::UnknownChannel { .. }))));
    }
}
