//! Parquet encoding of the staging table, both dimensions and both facts.
//!
//! Every table carries a `loaded_at` column holding the run's processing time.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::builder::{Float64Builder, ListBuilder, StringBuilder};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int32Array, Int64Array, ListArray,
    RecordBatch, StringArray, TimestampMicrosecondArray, UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use medwh_core::{ChannelRow, CleanedMessage, DateRow, DetectionFactRow, MessageFactRow};
use parquet::arrow::ArrowWriter;

pub const STG_MESSAGES: &str = "stg_telegram_messages";
pub const DIM_CHANNELS: &str = "dim_channels";
pub const DIM_DATES: &str = "dim_dates";
pub const FCT_MESSAGES: &str = "fct_messages";
pub const FCT_IMAGE_DETECTIONS: &str = "fct_image_detections";

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// One encoded table, ready to be written into a snapshot.
#[derive(Debug, Clone)]
pub struct EncodedTable {
    pub table: &'static str,
    pub rows: usize,
    pub bytes: Vec<u8>,
}

impl EncodedTable {
    pub fn file_name(&self) -> String {
        format!("{}.parquet", self.table)
    }
}

fn encode(table: &'static str, batch: RecordBatch) -> Result<EncodedTable> {
    let rows = batch.num_rows();
    let mut bytes = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut bytes, batch.schema(), None)
        .with_context(|| format!("opening parquet writer for {table}"))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch for {table}"))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer for {table}"))?;
    Ok(EncodedTable { table, rows, bytes })
}

fn utc_micros() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn timestamps(values: impl Iterator<Item = Option<DateTime<Utc>>>) -> TimestampMicrosecondArray {
    TimestampMicrosecondArray::from(
        values
            .map(|ts| ts.map(|ts| ts.timestamp_micros()))
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC")
}

fn loaded_at_column(loaded_at: DateTime<Utc>, rows: usize) -> TimestampMicrosecondArray {
    timestamps(std::iter::repeat(Some(loaded_at)).take(rows))
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn string_lists<'a>(lists: impl Iterator<Item = &'a [String]>) -> ListArray {
    let mut builder = ListBuilder::new(StringBuilder::new());
    for list in lists {
        for value in list {
            builder.values().append_value(value);
        }
        builder.append(true);
    }
    builder.finish()
}

fn float_lists<'a>(lists: impl Iterator<Item = &'a [f64]>) -> ListArray {
    let mut builder = ListBuilder::new(Float64Builder::new());
    for list in lists {
        builder.values().append_slice(list);
        builder.append(true);
    }
    builder.finish()
}

pub fn staging_messages(messages: &[CleanedMessage], loaded_at: DateTime<Utc>) -> Result<EncodedTable> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("message_key", DataType::Utf8, false),
        ArrowField::new("message_id", DataType::Utf8, false),
        ArrowField::new("channel_name", DataType::Utf8, false),
        ArrowField::new("message_date", utc_micros(), false),
        ArrowField::new("message_text", DataType::Utf8, false),
        ArrowField::new("message_length", DataType::UInt64, false),
        ArrowField::new("has_media", DataType::Boolean, false),
        ArrowField::new("has_image", DataType::Boolean, false),
        ArrowField::new("image_path", DataType::Utf8, true),
        ArrowField::new("view_count", DataType::Int64, false),
        ArrowField::new("forward_count", DataType::Int64, false),
        ArrowField::new("product_category", DataType::Utf8, false),
        ArrowField::new("scraped_at", utc_micros(), true),
        ArrowField::new("loaded_at", utc_micros(), false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            messages.iter().map(|m| m.message_key.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            messages.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            messages.iter().map(|m| m.channel_name.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(timestamps(messages.iter().map(|m| Some(m.message_date)))),
        Arc::new(StringArray::from(
            messages.iter().map(|m| m.message_text.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            messages.iter().map(|m| m.message_length as u64).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(messages.iter().map(|m| m.has_media).collect::<Vec<_>>())),
        Arc::new(BooleanArray::from(messages.iter().map(|m| m.has_image).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            messages.iter().map(|m| m.image_path.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(messages.iter().map(|m| m.view_count).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(messages.iter().map(|m| m.forward_count).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            messages.iter().map(|m| m.product_category.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(timestamps(messages.iter().map(|m| m.scraped_at))),
        Arc::new(loaded_at_column(loaded_at, messages.len())),
    ];

    let batch = RecordBatch::try_new(schema, columns)
        .with_context(|| format!("building {STG_MESSAGES} record batch"))?;
    encode(STG_MESSAGES, batch)
}

pub fn dim_channels(rows: &[ChannelRow], loaded_at: DateTime<Utc>) -> Result<EncodedTable> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("channel_key", DataType::Utf8, false),
        ArrowField::new("channel_name", DataType::Utf8, false),
        ArrowField::new("channel_type", DataType::Utf8, false),
        ArrowField::new("first_post_date", utc_micros(), false),
        ArrowField::new("last_post_date", utc_micros(), false),
        ArrowField::new("total_posts", DataType::UInt64, false),
        ArrowField::new("avg_views", DataType::Float64, false),
        ArrowField::new("avg_forwards", DataType::Float64, false),
        ArrowField::new("total_images", DataType::UInt64, false),
        ArrowField::new("image_percentage", DataType::Float64, false),
        ArrowField::new("activity_status", DataType::Utf8, false),
        ArrowField::new("loaded_at", utc_micros(), false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.channel_key.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.channel_name.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.channel_type.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(timestamps(rows.iter().map(|r| Some(r.first_post_date)))),
        Arc::new(timestamps(rows.iter().map(|r| Some(r.last_post_date)))),
        Arc::new(UInt64Array::from(rows.iter().map(|r| r.total_posts).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.avg_views).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.avg_forwards).collect::<Vec<_>>())),
        Arc::new(UInt64Array::from(rows.iter().map(|r| r.total_images).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.image_percentage).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.activity_status.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(loaded_at_column(loaded_at, rows.len())),
    ];

    let batch = RecordBatch::try_new(schema, columns)
        .with_context(|| format!("building {DIM_CHANNELS} record batch"))?;
    encode(DIM_CHANNELS, batch)
}

pub fn dim_dates(rows: &[DateRow], loaded_at: DateTime<Utc>) -> Result<EncodedTable> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date_key", DataType::Int32, false),
        ArrowField::new("full_date", DataType::Date32, false),
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("quarter", DataType::UInt32, false),
        ArrowField::new("month", DataType::UInt32, false),
        ArrowField::new("month_name", DataType::Utf8, false),
        ArrowField::new("week_of_year", DataType::UInt32, false),
        ArrowField::new("day_of_month", DataType::UInt32, false),
        ArrowField::new("day_of_week", DataType::UInt32, false),
        ArrowField::new("day_name", DataType::Utf8, false),
        ArrowField::new("day_of_year", DataType::UInt32, false),
        ArrowField::new("is_weekend", DataType::Boolean, false),
        ArrowField::new("holiday_label", DataType::Utf8, false),
        ArrowField::new("loaded_at", utc_micros(), false),
    ]));

    let u32s = |f: fn(&DateRow) -> u32| -> ArrayRef {
        Arc::new(UInt32Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(rows.iter().map(|r| r.date_key.value()).collect::<Vec<_>>())),
        Arc::new(Date32Array::from(
            rows.iter().map(|r| days_since_epoch(r.full_date)).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(rows.iter().map(|r| r.year).collect::<Vec<_>>())),
        u32s(|r| r.quarter),
        u32s(|r| r.month),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.month_name.as_str()).collect::<Vec<_>>(),
        )),
        u32s(|r| r.week_of_year),
        u32s(|r| r.day_of_month),
        u32s(|r| r.day_of_week),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.day_name.as_str()).collect::<Vec<_>>(),
        )),
        u32s(|r| r.day_of_year),
        Arc::new(BooleanArray::from(rows.iter().map(|r| r.is_weekend).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.holiday_label.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(loaded_at_column(loaded_at, rows.len())),
    ];

    let batch = RecordBatch::try_new(schema, columns)
        .with_context(|| format!("building {DIM_DATES} record batch"))?;
    encode(DIM_DATES, batch)
}

pub fn fct_messages(rows: &[MessageFactRow], loaded_at: DateTime<Utc>) -> Result<EncodedTable> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("message_key", DataType::Utf8, false),
        ArrowField::new("message_id", DataType::Utf8, false),
        ArrowField::new("channel_key", DataType::Utf8, false),
        ArrowField::new("date_key", DataType::Int32, false),
        ArrowField::new("message_date", utc_micros(), false),
        ArrowField::new("message_text", DataType::Utf8, false),
        ArrowField::new("message_length", DataType::UInt64, false),
        ArrowField::new("view_count", DataType::Int64, false),
        ArrowField::new("forward_count", DataType::Int64, false),
        ArrowField::new("has_image", DataType::Boolean, false),
        ArrowField::new("image_path", DataType::Utf8, true),
        ArrowField::new("product_category", DataType::Utf8, false),
        ArrowField::new("engagement_score", DataType::Float64, false),
        ArrowField::new("message_length_category", DataType::Utf8, false),
        ArrowField::new("loaded_at", utc_micros(), false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.message_key.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.message_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.channel_key.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(rows.iter().map(|r| r.date_key.value()).collect::<Vec<_>>())),
        Arc::new(timestamps(rows.iter().map(|r| Some(r.message_date)))),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.message_text.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            rows.iter().map(|r| r.message_length as u64).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(rows.iter().map(|r| r.view_count).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(rows.iter().map(|r| r.forward_count).collect::<Vec<_>>())),
        Arc::new(BooleanArray::from(rows.iter().map(|r| r.has_image).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.image_path.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.product_category.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.engagement_score).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.length_category.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(loaded_at_column(loaded_at, rows.len())),
    ];

    let batch = RecordBatch::try_new(schema, columns)
        .with_context(|| format!("building {FCT_MESSAGES} record batch"))?;
    encode(FCT_MESSAGES, batch)
}

pub fn fct_image_detections(
    rows: &[DetectionFactRow],
    loaded_at: DateTime<Utc>,
) -> Result<EncodedTable> {
    let objects = string_lists(rows.iter().map(|r| r.detected_objects.as_slice()));
    let scores = float_lists(rows.iter().map(|r| r.confidence_scores.as_slice()));

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("detection_key", DataType::Utf8, false),
        ArrowField::new("message_id", DataType::Utf8, false),
        ArrowField::new("channel_key", DataType::Utf8, false),
        ArrowField::new("date_key", DataType::Int32, false),
        ArrowField::new("image_path", DataType::Utf8, false),
        ArrowField::new("detected_objects", objects.data_type().clone(), false),
        ArrowField::new("confidence_scores", scores.data_type().clone(), false),
        ArrowField::new("detection_count", DataType::UInt32, false),
        ArrowField::new("image_category", DataType::Utf8, false),
        ArrowField::new("avg_confidence", DataType::Float64, false),
        ArrowField::new("max_confidence", DataType::Float64, false),
        ArrowField::new("has_person", DataType::Boolean, false),
        ArrowField::new("has_container", DataType::Boolean, false),
        ArrowField::new("scene_composition", DataType::Utf8, false),
        ArrowField::new("detection_quality", DataType::Utf8, false),
        ArrowField::new("content_strategy", DataType::Utf8, false),
        ArrowField::new("processing_time", DataType::Float64, true),
        ArrowField::new("model_version", DataType::Utf8, false),
        ArrowField::new("processed_at", utc_micros(), false),
        ArrowField::new("loaded_at", utc_micros(), false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.detection_key.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.message_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.channel_key.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(rows.iter().map(|r| r.date_key.value()).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.image_path.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(objects),
        Arc::new(scores),
        Arc::new(UInt32Array::from(rows.iter().map(|r| r.detection_count).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.image_category.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.avg_confidence).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.max_confidence).collect::<Vec<_>>())),
        Arc::new(BooleanArray::from(rows.iter().map(|r| r.has_person).collect::<Vec<_>>())),
        Arc::new(BooleanArray::from(rows.iter().map(|r| r.has_container).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.scene_composition.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.detection_quality.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.content_strategy.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.processing_time).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.model_version.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(timestamps(rows.iter().map(|r| Some(r.processed_at)))),
        Arc::new(loaded_at_column(loaded_at, rows.len())),
    ];

    let batch = RecordBatch::try_new(schema, columns)
        .with_context(|| format!("building {FCT_IMAGE_DETECTIONS} record batch"))?;
    encode(FCT_IMAGE_DETECTIONS, batch)
}
