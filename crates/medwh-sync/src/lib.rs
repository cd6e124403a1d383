//! Warehouse run orchestration: configuration, stage ordering, quality gate enforcement and
//! materialization into immutable snapshots (and optionally Postgres).

pub mod config;
pub mod export;
pub mod pipeline;
pub mod postgres;
pub mod report;

pub use config::PipelineConfig;
pub use pipeline::{
    build_warehouse, CategoryEngagement, RunSummary, SnapshotManifest, TableStats, WarehouseBuild,
    WarehousePipeline,
};
pub use report::report_runs_markdown;

pub const CRATE_NAME: &str = "medwh-sync";

pub async fn run_once_from_env(processed_at: chrono::DateTime<chrono::Utc>) -> anyhow::Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    WarehousePipeline::new(config)?.run_once(processed_at).await
}
