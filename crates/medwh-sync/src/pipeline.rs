use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use medwh_core::{
    round_to, ChannelKey, DataDefect, DetectionFactRow, MessageFactRow, RawDetection, RawMessage,
};
use medwh_sources::{
    DetectionSource, JsonDetectionSource, JsonLakeMessageSource, LoadStats, MessageSource,
};
use medwh_storage::{SnapshotStore, StoredFile};
use medwh_transform::{
    normalize, ChannelDimension, DateDimension, DateHorizon, DetectionFactBuilder, DetectionStats,
    Dimensions, FactBuild, JoinPolicy, MessageFactBuilder, NormalizedDetections, QualityContext,
    QualityGate, QualityMode, QualityReport, QuarantinedRow, RuleBook, StagingCleaner,
    StagingOutput, StagingStats, TransformError,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::export::{self, EncodedTable};
use crate::postgres::{self, PostgresLoad};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const RUN_BRIEF_FILE: &str = "run_brief.md";
pub const POSTGRES_LOAD_FILE: &str = "postgres_load.json";

/// Every table of one run, computed from a single staging snapshot.
#[derive(Debug, Clone)]
pub struct WarehouseBuild {
    pub staging: StagingOutput,
    pub detections: NormalizedDetections,
    pub dims: Dimensions,
    pub message_facts: FactBuild<MessageFactRow>,
    pub detection_facts: FactBuild<DetectionFactRow>,
    pub quality: QualityReport,
}

impl WarehouseBuild {
    pub fn table_stats(&self) -> TableStats {
        let mut rows = BTreeMap::new();
        rows.insert(export::STG_MESSAGES.to_string(), self.staging.snapshot.len());
        rows.insert(export::DIM_CHANNELS.to_string(), self.dims.channels.rows().len());
        rows.insert(export::DIM_DATES.to_string(), self.dims.dates.rows().len());
        rows.insert(export::FCT_MESSAGES.to_string(), self.message_facts.rows.len());
        rows.insert(
            export::FCT_IMAGE_DETECTIONS.to_string(),
            self.detection_facts.rows.len(),
        );
        TableStats {
            rows,
            distinct_channels: self.dims.channels.rows().len(),
            distinct_message_dates: self
                .message_facts
                .rows
                .iter()
                .map(|r| r.date_key)
                .collect::<BTreeSet<_>>()
                .len(),
            messages_with_media: self
                .staging
                .snapshot
                .messages()
                .iter()
                .filter(|m| m.has_media)
                .count(),
        }
    }

    /// Average views of the messages behind each image category, highest first. Detections
    /// whose message is not in the message facts are left out.
    pub fn engagement_by_category(&self) -> Vec<CategoryEngagement> {
        let views: BTreeMap<(ChannelKey, &str), i64> = self
            .message_facts
            .rows
            .iter()
            .map(|m| ((m.channel_key, m.message_id.as_str()), m.view_count))
            .collect();
        let mut totals: BTreeMap<&str, (usize, i64)> = BTreeMap::new();
        for d in &self.detection_facts.rows {
            if let Some(&v) = views.get(&(d.channel_key, d.message_id.as_str())) {
                let entry = totals.entry(d.image_category.as_str()).or_default();
                entry.0 += 1;
                entry.1 += v;
            }
        }
        let mut out: Vec<CategoryEngagement> = totals
            .into_iter()
            .map(|(category, (images, total_views))| CategoryEngagement {
                image_category: category.to_string(),
                images,
                avg_views: round_to(total_views as f64 / images as f64, 2),
            })
            .collect();
        out.sort_by(|a, b| {
            b.avg_views
                .total_cmp(&a.avg_views)
                .then_with(|| a.image_category.cmp(&b.image_category))
        });
        out
    }

    pub fn defects(&self) -> impl Iterator<Item = &DataDefect> {
        self.staging.defects.iter().chain(self.detections.defects.iter())
    }

    pub fn quarantined(&self) -> impl Iterator<Item = &QuarantinedRow> {
        self.message_facts
            .quarantined
            .iter()
            .chain(self.detection_facts.quarantined.iter())
    }
}

/// Run every transform stage over one batch of raw inputs.
///
/// Staging and the date dimension have no upstream dependency, the channel dimension is built
/// from the staging snapshot, and the two fact builders then run concurrently against the same
/// frozen dimensions. A join failure under [`JoinPolicy::Strict`] aborts the whole build.
pub fn build_warehouse(
    rules: &RuleBook,
    horizon: DateHorizon,
    policy: JoinPolicy,
    gate: &QualityGate,
    messages: &[RawMessage],
    detections: &[RawDetection],
    processed_at: DateTime<Utc>,
) -> Result<WarehouseBuild, TransformError> {
    let staging = info_span!("staging").in_scope(|| {
        StagingCleaner::new(&rules.product_categories).run(messages, processed_at)
    });
    let normalized = info_span!("detections").in_scope(|| normalize(detections));

    let dims = info_span!("dimensions").in_scope(|| {
        let dates = DateDimension::build(horizon, &rules.holidays);
        let channels =
            ChannelDimension::build(&staging.snapshot, &rules.channel_types, processed_at);
        info!(
            dates = dates.rows().len(),
            channels = channels.rows().len(),
            "built dimensions"
        );
        Dimensions::new(channels, dates)
    });

    let (message_facts, detection_facts) = std::thread::scope(|scope| {
        let dims = &dims;
        let snapshot = &staging.snapshot;
        let cleaned = normalized.detections.as_slice();

        let message_span = info_span!("message_facts");
        let message_task = scope.spawn(move || {
            message_span.in_scope(|| MessageFactBuilder::new(dims, policy).build(snapshot))
        });
        let detection_span = info_span!("detection_facts");
        let detection_task = scope.spawn(move || {
            detection_span.in_scope(|| {
                DetectionFactBuilder::new(dims, &rules.content_strategies, policy).build(cleaned)
            })
        });

        (
            message_task
                .join()
                .unwrap_or_else(|payload| std::panic::resume_unwind(payload)),
            detection_task
                .join()
                .unwrap_or_else(|payload| std::panic::resume_unwind(payload)),
        )
    });
    let message_facts = message_facts?;
    let detection_facts = detection_facts?;

    let quality = info_span!("quality_gate").in_scope(|| {
        gate.evaluate(&QualityContext {
            processed_at,
            staging: staging.snapshot.messages(),
            message_facts: &message_facts.rows,
            detection_facts: &detection_facts.rows,
            dims: &dims,
        })
    });

    Ok(WarehouseBuild {
        staging,
        detections: normalized,
        dims,
        message_facts,
        detection_facts,
        quality,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub rows: BTreeMap<String, usize>,
    pub distinct_channels: usize,
    pub distinct_message_dates: usize,
    pub messages_with_media: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryEngagement {
    pub image_category: String,
    pub images: usize,
    pub avg_views: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceLoads {
    pub messages: LoadStats,
    pub detections: LoadStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub quality_mode: QualityMode,
    pub join_policy: JoinPolicy,
    pub sources: SourceLoads,
    pub staging: StagingStats,
    pub detections: DetectionStats,
    pub defects: Vec<DataDefect>,
    pub quarantined: Vec<QuarantinedRow>,
    pub quality: QualityReport,
    pub tables: TableStats,
    pub engagement_by_category: Vec<CategoryEngagement>,
    pub postgres_enabled: bool,
    /// Filled in after the publish; recorded on disk as a separate snapshot file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresLoad>,
    pub snapshot_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub processed_at: DateTime<Utc>,
    pub files: Vec<StoredFile>,
}

pub struct WarehousePipeline {
    config: PipelineConfig,
    rules: RuleBook,
    gate: QualityGate,
    store: SnapshotStore,
    messages: Box<dyn MessageSource>,
    detections: Box<dyn DetectionSource>,
}

impl WarehousePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let rules = RuleBook::from_dir(&config.rules_dir)
            .with_context(|| format!("loading rule tables from {}", config.rules_dir.display()))?;
        Ok(Self {
            rules,
            gate: QualityGate::new(config.quality_mode),
            store: SnapshotStore::new(config.warehouse_dir.clone()),
            messages: Box::new(JsonLakeMessageSource::new(config.raw_messages_dir.clone())),
            detections: Box::new(JsonDetectionSource::new(config.detections_path.clone())),
            config,
        })
    }

    pub fn with_sources(
        mut self,
        messages: Box<dyn MessageSource>,
        detections: Box<dyn DetectionSource>,
    ) -> Self {
        self.messages = messages;
        self.detections = detections;
        self
    }

    pub fn with_rules(mut self, rules: RuleBook) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Load, transform, gate and materialize one run. `CURRENT` moves to the new snapshot only
    /// after every file has been written. The optional Postgres load follows the publish, so
    /// Postgres never holds a run the snapshot store has not published.
    pub async fn run_once(&self, processed_at: DateTime<Utc>) -> Result<RunSummary> {
        let run_id = new_run_id(processed_at);
        let span = info_span!("warehouse_run", run_id = %run_id);
        self.run_inner(run_id, processed_at).instrument(span).await
    }

    async fn run_inner(&self, run_id: String, processed_at: DateTime<Utc>) -> Result<RunSummary> {
        let started_at = Utc::now();
        info!(%processed_at, "starting warehouse run");

        let messages = self
            .messages
            .load_messages()
            .await
            .with_context(|| format!("loading messages from {}", self.messages.source_id()))?;
        let detections = self
            .detections
            .load_detections()
            .await
            .with_context(|| format!("loading detections from {}", self.detections.source_id()))?;

        let build = build_warehouse(
            &self.rules,
            self.config.horizon,
            self.config.join_policy,
            &self.gate,
            &messages.records,
            &detections.records,
            processed_at,
        )
        .context("building warehouse tables")?;

        build
            .quality
            .enforce()
            .context("quality gate rejected the run; nothing was materialized")?;

        let files = self.write_snapshot(&run_id, &build, processed_at).await?;
        let manifest = SnapshotManifest {
            schema_version: 1,
            run_id: run_id.clone(),
            processed_at,
            files,
        };
        self.store_json(&run_id, MANIFEST_FILE, &manifest).await?;

        let snapshot_dir = self.store.snapshot_dir(&run_id)?;
        let mut summary = RunSummary {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            processed_at,
            quality_mode: self.gate.mode(),
            join_policy: self.config.join_policy,
            sources: SourceLoads {
                messages: messages.stats,
                detections: detections.stats,
            },
            staging: build.staging.stats.clone(),
            detections: build.detections.stats.clone(),
            defects: messages
                .defects
                .iter()
                .chain(build.defects())
                .cloned()
                .collect(),
            quarantined: build.quarantined().cloned().collect(),
            quality: build.quality.clone(),
            tables: build.table_stats(),
            engagement_by_category: build.engagement_by_category(),
            postgres_enabled: self.config.database_url.is_some(),
            postgres: None,
            snapshot_dir: snapshot_dir.display().to_string(),
        };
        self.store_json(&run_id, RUN_SUMMARY_FILE, &summary).await?;
        self.store
            .store_bytes(&run_id, RUN_BRIEF_FILE, render_brief(&summary).as_bytes())
            .await
            .with_context(|| format!("writing {RUN_BRIEF_FILE}"))?;

        self.store
            .publish(&run_id)
            .await
            .with_context(|| format!("publishing snapshot {run_id}"))?;

        if let Some(url) = &self.config.database_url {
            let load = postgres::materialize(url, &build, processed_at)
                .instrument(info_span!("postgres"))
                .await
                .with_context(|| {
                    format!("materializing published snapshot {run_id} into postgres")
                })?;
            self.store_json(&run_id, POSTGRES_LOAD_FILE, &load).await?;
            summary.postgres = Some(load);
        }

        if !summary.quality.passed() {
            warn!(
                violations = summary.quality.total_violations(),
                "run published with advisory quality violations"
            );
        }
        info!(
            messages = build.message_facts.rows.len(),
            detections = build.detection_facts.rows.len(),
            defects = summary.defects.len(),
            quarantined = summary.quarantined.len(),
            "warehouse run complete"
        );
        Ok(summary)
    }

    async fn write_snapshot(
        &self,
        run_id: &str,
        build: &WarehouseBuild,
        loaded_at: DateTime<Utc>,
    ) -> Result<Vec<StoredFile>> {
        let tables: Vec<EncodedTable> = vec![
            export::staging_messages(build.staging.snapshot.messages(), loaded_at)?,
            export::dim_channels(build.dims.channels.rows(), loaded_at)?,
            export::dim_dates(build.dims.dates.rows(), loaded_at)?,
            export::fct_messages(&build.message_facts.rows, loaded_at)?,
            export::fct_image_detections(&build.detection_facts.rows, loaded_at)?,
        ];

        let mut files = Vec::with_capacity(tables.len());
        for table in &tables {
            let name = table.file_name();
            let stored = self
                .store
                .store_bytes(run_id, &name, &table.bytes)
                .await
                .with_context(|| format!("writing {name}"))?;
            info!(table = table.table, rows = table.rows, bytes = stored.bytes, "materialized table");
            files.push(stored);
        }
        Ok(files)
    }

    async fn store_json<T: Serialize>(&self, run_id: &str, name: &str, value: &T) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(value).with_context(|| format!("serializing {name}"))?;
        self.store
            .store_bytes(run_id, name, &bytes)
            .await
            .with_context(|| format!("writing {name}"))?;
        Ok(())
    }
}

/// `20250120T120000Z-1a2b3c4d`: sortable by processing time, unique per invocation.
fn new_run_id(processed_at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", processed_at.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Warehouse Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Processed at: {}", summary.processed_at.to_rfc3339()),
        format!("- Quality mode: {:?}", summary.quality_mode),
        format!("- Join policy: {:?}", summary.join_policy),
        format!(
            "- Staged messages: {} of {} raw ({} defects, {} empty, {} future-dated)",
            summary.staging.emitted,
            summary.staging.input_rows,
            summary.staging.defects,
            summary.staging.empty_excluded,
            summary.staging.future_excluded,
        ),
        format!(
            "- Detections: {} of {} raw ({} defects)",
            summary.detections.emitted, summary.detections.input_rows, summary.detections.defects,
        ),
        format!("- Quarantined fact rows: {}", summary.quarantined.len()),
        String::new(),
        "## Tables".to_string(),
    ];
    lines.extend(
        summary
            .tables
            .rows
            .iter()
            .map(|(table, rows)| format!("- {table}: {rows}")),
    );
    lines.push(format!(
        "- distinct channels: {}, distinct message dates: {}, messages with media: {}",
        summary.tables.distinct_channels,
        summary.tables.distinct_message_dates,
        summary.tables.messages_with_media,
    ));
    lines.push(String::new());
    lines.push("## Engagement by Image Category".to_string());
    if summary.engagement_by_category.is_empty() {
        lines.push("- no detected images joined to messages".to_string());
    }
    lines.extend(summary.engagement_by_category.iter().map(|c| {
        format!(
            "- {}: {:.0} average views over {} images",
            c.image_category, c.avg_views, c.images
        )
    }));
    lines.push(String::new());
    lines.push("## Quality".to_string());
    lines.extend(summary.quality.checks.iter().map(|check| {
        format!(
            "- {} [{}]: {} violating messages",
            check.name, check.status, check.violations
        )
    }));
    lines.push(format!(
        "- data_freshness [{}]: {}",
        summary.quality.freshness.status,
        summary
            .quality
            .freshness
            .hours_since_latest
            .map(|h| format!("{h:.1}h since latest message"))
            .unwrap_or_else(|| "no staged messages".to_string()),
    ));
    lines.push(String::new());
    lines.join("\n")
}
