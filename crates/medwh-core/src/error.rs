use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::RecordRef;

/// Malformed or out-of-range input found while transforming a single record.
/// The record is excluded from its stage's output and reported, never coerced.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataDefect {
    #[error("{record}: missing or unparseable message timestamp")]
    MissingTimestamp { record: RecordRef },
    #[error("{record}: negative {field} counter ({value})")]
    NegativeCounter {
        record: RecordRef,
        field: &'static str,
        value: i64,
    },
    #[error("{record}: {field} counter {value} is not a whole number")]
    NonIntegralCounter {
        record: RecordRef,
        field: &'static str,
        value: f64,
    },
    #[error("{record}: {objects} detected objects but {scores} confidence scores")]
    ScoreLengthMismatch {
        record: RecordRef,
        objects: usize,
        scores: usize,
    },
    #[error("{record}: confidence score {score} outside [0, 1]")]
    ConfidenceOutOfRange { record: RecordRef, score: f64 },
    #[error("{record}: missing or unparseable processing timestamp")]
    MissingProcessedAt { record: RecordRef },
}

impl DataDefect {
    pub fn record(&self) -> &RecordRef {
        match self {
            Self::MissingTimestamp { record }
            | Self::NegativeCounter { record, .. }
            | Self::NonIntegralCounter { record, .. }
            | Self::ScoreLengthMismatch { record, .. }
            | Self::ConfidenceOutOfRange { record, .. }
            | Self::MissingProcessedAt { record } => record,
        }
    }
}

/// A fact row whose dimension key cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinError {
    #[error("{record}: channel not present in channel dimension")]
    UnknownChannel { record: RecordRef },
    #[error("{record}: date {date} outside date dimension horizon")]
    DateOutOfHorizon { record: RecordRef, date: NaiveDate },
}

impl JoinError {
    pub fn record(&self) -> &RecordRef {
        match self {
            Self::UnknownChannel { record } | Self::DateOutOfHorizon { record, .. } => record,
        }
    }
}
