//! Optional Postgres materialization. All five tables are replaced inside one transaction,
//! so readers see either the previous run or this one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::pipeline::WarehouseBuild;

const SCHEMA_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS staging",
    "CREATE SCHEMA IF NOT EXISTS marts",
    r#"
    CREATE TABLE IF NOT EXISTS staging.stg_telegram_messages (
        message_key UUID PRIMARY KEY,
        message_id TEXT NOT NULL,
        channel_name TEXT NOT NULL,
        message_date TIMESTAMPTZ NOT NULL,
        message_text TEXT NOT NULL,
        message_length BIGINT NOT NULL,
        has_media BOOLEAN NOT NULL,
        has_image BOOLEAN NOT NULL,
        image_path TEXT,
        view_count BIGINT NOT NULL,
        forward_count BIGINT NOT NULL,
        product_category TEXT NOT NULL,
        scraped_at TIMESTAMPTZ,
        loaded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS marts.dim_channels (
        channel_key UUID PRIMARY KEY,
        channel_name TEXT NOT NULL UNIQUE,
        channel_type TEXT NOT NULL,
        first_post_date TIMESTAMPTZ NOT NULL,
        last_post_date TIMESTAMPTZ NOT NULL,
        total_posts BIGINT NOT NULL,
        avg_views DOUBLE PRECISION NOT NULL,
        avg_forwards DOUBLE PRECISION NOT NULL,
        total_images BIGINT NOT NULL,
        image_percentage DOUBLE PRECISION NOT NULL,
        activity_status TEXT NOT NULL,
        loaded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS marts.dim_dates (
        date_key INTEGER PRIMARY KEY,
        full_date DATE NOT NULL UNIQUE,
        year INTEGER NOT NULL,
        quarter INTEGER NOT NULL,
        month INTEGER NOT NULL,
        month_name TEXT NOT NULL,
        week_of_year INTEGER NOT NULL,
        day_of_month INTEGER NOT NULL,
        day_of_week INTEGER NOT NULL,
        day_name TEXT NOT NULL,
        day_of_year INTEGER NOT NULL,
        is_weekend BOOLEAN NOT NULL,
        holiday_label TEXT NOT NULL,
        loaded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS marts.fct_messages (
        message_key UUID PRIMARY KEY,
        message_id TEXT NOT NULL,
        channel_key UUID NOT NULL,
        date_key INTEGER NOT NULL,
        message_date TIMESTAMPTZ NOT NULL,
        message_text TEXT NOT NULL,
        message_length BIGINT NOT NULL,
        view_count BIGINT NOT NULL,
        forward_count BIGINT NOT NULL,
        has_image BOOLEAN NOT NULL,
        image_path TEXT,
        product_category TEXT NOT NULL,
        engagement_score DOUBLE PRECISION NOT NULL,
        message_length_category TEXT NOT NULL,
        loaded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS marts.fct_image_detections (
        detection_key UUID PRIMARY KEY,
        message_id TEXT NOT NULL,
        channel_key UUID NOT NULL,
        date_key INTEGER NOT NULL,
        image_path TEXT NOT NULL,
        detected_objects TEXT[] NOT NULL,
        confidence_scores DOUBLE PRECISION[] NOT NULL,
        detection_count INTEGER NOT NULL,
        image_category TEXT NOT NULL,
        avg_confidence DOUBLE PRECISION NOT NULL,
        max_confidence DOUBLE PRECISION NOT NULL,
        has_person BOOLEAN NOT NULL,
        has_container BOOLEAN NOT NULL,
        scene_composition TEXT NOT NULL,
        detection_quality TEXT NOT NULL,
        content_strategy TEXT NOT NULL,
        processing_time DOUBLE PRECISION,
        model_version TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL,
        loaded_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const REPLACED_TABLES: &[&str] = &[
    "marts.fct_image_detections",
    "marts.fct_messages",
    "marts.dim_channels",
    "marts.dim_dates",
    "staging.stg_telegram_messages",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostgresLoad {
    pub staging_rows: usize,
    pub channel_rows: usize,
    pub date_rows: usize,
    pub message_fact_rows: usize,
    pub detection_fact_rows: usize,
}

pub async fn materialize(
    database_url: &str,
    build: &WarehouseBuild,
    loaded_at: DateTime<Utc>,
) -> Result<PostgresLoad> {
    let pool = PgPool::connect(database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    let load = replace_tables(&pool, build, loaded_at).await;
    pool.close().await;
    load
}

async fn replace_tables(
    pool: &PgPool,
    build: &WarehouseBuild,
    loaded_at: DateTime<Utc>,
) -> Result<PostgresLoad> {
    let mut tx = pool.begin().await.context("opening transaction")?;

    for ddl in SCHEMA_DDL {
        sqlx::query(ddl)
            .execute(&mut *tx)
            .await
            .context("creating warehouse schema")?;
    }
    for table in REPLACED_TABLES {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clearing {table}"))?;
    }

    let load = PostgresLoad {
        staging_rows: insert_staging(&mut tx, build, loaded_at).await?,
        channel_rows: insert_channels(&mut tx, build, loaded_at).await?,
        date_rows: insert_dates(&mut tx, build, loaded_at).await?,
        message_fact_rows: insert_message_facts(&mut tx, build, loaded_at).await?,
        detection_fact_rows: insert_detection_facts(&mut tx, build, loaded_at).await?,
    };

    tx.commit().await.context("committing warehouse load")?;
    info!(
        channels = load.channel_rows,
        messages = load.message_fact_rows,
        detections = load.detection_fact_rows,
        "replaced postgres warehouse tables"
    );
    Ok(load)
}

async fn insert_staging(
    tx: &mut Transaction<'_, Postgres>,
    build: &WarehouseBuild,
    loaded_at: DateTime<Utc>,
) -> Result<usize> {
    let messages = build.staging.snapshot.messages();
    for m in messages {
        sqlx::query(
            r#"
            INSERT INTO staging.stg_telegram_messages
                (message_key, message_id, channel_name, message_date, message_text, message_length,
                 has_media, has_image, image_path, view_count, forward_count, product_category,
                 scraped_at, loaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(m.message_key.as_uuid())
        .bind(&m.message_id)
        .bind(&m.channel_name)
        .bind(m.message_date)
        .bind(&m.message_text)
        .bind(m.message_length as i64)
        .bind(m.has_media)
        .bind(m.has_image)
        .bind(m.image_path.as_deref())
        .bind(m.view_count)
        .bind(m.forward_count)
        .bind(m.product_category.as_str())
        .bind(m.scraped_at)
        .bind(loaded_at)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("inserting staged {}", m.record_ref()))?;
    }
    Ok(messages.len())
}

async fn insert_channels(
    tx: &mut Transaction<'_, Postgres>,
    build: &WarehouseBuild,
    loaded_at: DateTime<Utc>,
) -> Result<usize> {
    let rows = build.dims.channels.rows();
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO marts.dim_channels
                (channel_key, channel_name, channel_type, first_post_date, last_post_date,
                 total_posts, avg_views, avg_forwards, total_images, image_percentage,
                 activity_status, loaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(r.channel_key.as_uuid())
        .bind(&r.channel_name)
        .bind(r.channel_type.as_str())
        .bind(r.first_post_date)
        .bind(r.last_post_date)
        .bind(r.total_posts as i64)
        .bind(r.avg_views)
        .bind(r.avg_forwards)
        .bind(r.total_images as i64)
        .bind(r.image_percentage)
        .bind(r.activity_status.as_str())
        .bind(loaded_at)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("inserting channel {:?}", r.channel_name))?;
    }
    Ok(rows.len())
}

async fn insert_dates(
    tx: &mut Transaction<'_, Postgres>,
    build: &WarehouseBuild,
    loaded_at: DateTime<Utc>,
) -> Result<usize> {
    let rows = build.dims.dates.rows();
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO marts.dim_dates
                (date_key, full_date, year, quarter, month, month_name, week_of_year,
                 day_of_month, day_of_week, day_name, day_of_year, is_weekend, holiday_label,
                 loaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(r.date_key.value())
        .bind(r.full_date)
        .bind(r.year)
        .bind(r.quarter as i32)
        .bind(r.month as i32)
        .bind(&r.month_name)
        .bind(r.week_of_year as i32)
        .bind(r.day_of_month as i32)
        .bind(r.day_of_week as i32)
        .bind(&r.day_name)
        .bind(r.day_of_year as i32)
        .bind(r.is_weekend)
        .bind(&r.holiday_label)
        .bind(loaded_at)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("inserting date {}", r.date_key))?;
    }
    Ok(rows.len())
}

async fn insert_message_facts(
    tx: &mut Transaction<'_, Postgres>,
    build: &WarehouseBuild,
    loaded_at: DateTime<Utc>,
) -> Result<usize> {
    let rows = &build.message_facts.rows;
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO marts.fct_messages
                (message_key, message_id, channel_key, date_key, message_date, message_text,
                 message_length, view_count, forward_count, has_image, image_path,
                 product_category, engagement_score, message_length_category, loaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(r.message_key.as_uuid())
        .bind(&r.message_id)
        .bind(r.channel_key.as_uuid())
        .bind(r.date_key.value())
        .bind(r.message_date)
        .bind(&r.message_text)
        .bind(r.message_length as i64)
        .bind(r.view_count)
        .bind(r.forward_count)
        .bind(r.has_image)
        .bind(r.image_path.as_deref())
        .bind(r.product_category.as_str())
        .bind(r.engagement_score)
        .bind(r.length_category.as_str())
        .bind(loaded_at)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("inserting message fact {}", r.message_key))?;
    }
    Ok(rows.len())
}

async fn insert_detection_facts(
    tx: &mut Transaction<'_, Postgres>,
    build: &WarehouseBuild,
    loaded_at: DateTime<Utc>,
) -> Result<usize> {
    let rows = &build.detection_facts.rows;
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO marts.fct_image_detections
                (detection_key, message_id, channel_key, date_key, image_path, detected_objects,
                 confidence_scores, detection_count, image_category, avg_confidence,
                 max_confidence, has_person, has_container, scene_composition,
                 detection_quality, content_strategy, processing_time, model_version,
                 processed_at, loaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20)
            "#,
        )
        .bind(r.detection_key.as_uuid())
        .bind(&r.message_id)
        .bind(r.channel_key.as_uuid())
        .bind(r.date_key.value())
        .bind(&r.image_path)
        .bind(&r.detected_objects)
        .bind(&r.confidence_scores)
        .bind(r.detection_count as i32)
        .bind(&r.image_category)
        .bind(r.avg_confidence)
        .bind(r.max_confidence)
        .bind(r.has_person)
        .bind(r.has_container)
        .bind(r.scene_composition.as_str())
        .bind(r.detection_quality.as_str())
        .bind(r.content_strategy.as_str())
        .bind(r.processing_time)
        .bind(&r.model_version)
        .bind(r.processed_at)
        .bind(loaded_at)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("inserting detection fact {}", r.detection_key))?;
    }
    Ok(rows.len())
}
