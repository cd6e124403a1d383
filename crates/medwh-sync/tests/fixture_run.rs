use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use medwh_sync::pipeline::RUN_SUMMARY_FILE;
use medwh_sync::{report_runs_markdown, PipelineConfig, WarehousePipeline};
use medwh_transform::{DateHorizon, JoinPolicy, QualityMode};

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn processed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap()
}

fn config(warehouse: &Path, detections: PathBuf, policy: JoinPolicy) -> PipelineConfig {
    PipelineConfig {
        raw_messages_dir: fixtures_root().join("telegram_messages"),
        detections_path: detections,
        warehouse_dir: warehouse.to_path_buf(),
        rules_dir: Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules"),
        horizon: DateHorizon::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
        )
        .unwrap(),
        quality_mode: QualityMode::Strict,
        join_policy: policy,
        database_url: None,
    }
}

#[tokio::test]
async fn fixture_lake_builds_a_consistent_warehouse() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = WarehousePipeline::new(config(
        dir.path(),
        fixtures_root().join("detections.json"),
        JoinPolicy::Strict,
    ))
    .expect("pipeline");

    let summary = pipeline.run_once(processed_at()).await.expect("run");

    assert_eq!(summary.sources.messages.files, 3);
    assert_eq!(summary.sources.messages.rejected, 1);
    assert_eq!(summary.staging.duplicates_replaced, 1);
    assert_eq!(summary.staging.empty_excluded, 1);
    assert_eq!(summary.staging.future_excluded, 1);
    assert_eq!(summary.staging.defects, 1);
    assert_eq!(summary.staging.emitted, 12);

    assert_eq!(summary.detections.input_rows, 5);
    assert_eq!(summary.detections.defects, 1);
    assert_eq!(summary.detections.placeholders_cleared, 1);
    assert_eq!(summary.defects.len(), 2);
    assert!(summary.quarantined.is_empty());

    assert_eq!(summary.tables.rows["fct_messages"], 12);
    assert_eq!(summary.tables.rows["dim_channels"], 3);
    assert_eq!(summary.tables.rows["fct_image_detections"], 4);
    assert_eq!(summary.tables.rows["dim_dates"], 731);
    assert_eq!(summary.tables.distinct_message_dates, 2);
    assert_eq!(summary.tables.messages_with_media, 4);
    assert!(summary.quality.passed());

    let stored: serde_json::Value = serde_json::from_slice(
        &pipeline
            .store()
            .read_bytes(&summary.run_id, RUN_SUMMARY_FILE)
            .await
            .expect("summary file"),
    )
    .expect("summary json");
    assert_eq!(stored["quality"]["freshness"]["status"], "PASS");

    let engagement = &summary.engagement_by_category;
    let views = |category: &str| {
        engagement
            .iter()
            .find(|c| c.image_category == category)
            .map(|c| c.avg_views)
    };
    assert_eq!(views("promotional"), Some(100.0));
    assert_eq!(views("product_display"), Some(400.0));
    assert_eq!(stored["join_policy"], "strict");
}

#[tokio::test]
async fn channel_and_detection_scenarios_hold_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = WarehousePipeline::new(config(
        dir.path(),
        fixtures_root().join("detections.json"),
        JoinPolicy::Strict,
    ))
    .expect("pipeline");
    let summary = pipeline.run_once(processed_at()).await.expect("run");
    assert_eq!(pipeline.store().current().await.expect("current"), Some(summary.run_id.clone()));

    let rules = medwh_transform::RuleBook::from_dir(&pipeline.config().rules_dir).expect("rules");
    let messages = medwh_sources::MessageSource::load_messages(
        &medwh_sources::JsonLakeMessageSource::new(fixtures_root().join("telegram_messages")),
    )
    .await
    .expect("messages");
    let detections = medwh_sources::DetectionSource::load_detections(
        &medwh_sources::JsonDetectionSource::new(fixtures_root().join("detections.json")),
    )
    .await
    .expect("detections");
    let build = medwh_sync::build_warehouse(
        &rules,
        pipeline.config().horizon,
        JoinPolicy::Strict,
        &medwh_transform::QualityGate::new(QualityMode::Strict),
        &messages.records,
        &detections.records,
        processed_at(),
    )
    .expect("build");

    let tikvah = build
        .dims
        .channels
        .rows()
        .iter()
        .find(|c| c.channel_name == "tikvahpharma")
        .expect("tikvahpharma");
    assert_eq!(tikvah.total_posts, 10);
    assert_eq!(tikvah.image_percentage, 30.0);
    assert_eq!(tikvah.avg_views, 550.0);
    assert_eq!(tikvah.channel_type.as_str(), "Pharmaceutical");
    assert_eq!(tikvah.activity_status.as_str(), "Active");

    let chemed = build
        .message_facts
        .rows
        .iter()
        .find(|m| m.message_id == "301")
        .expect("message 301");
    assert_eq!(chemed.message_text, "Blood pressure monitor available");
    assert_eq!(chemed.view_count, 0);

    let ids: Vec<&str> = build.message_facts.rows.iter().map(|m| m.message_id.as_str()).collect();
    assert!(!ids.contains(&"202"), "empty message must not reach facts");
    assert!(!ids.contains(&"203"), "future message must not reach facts");

    let d101 = build
        .detection_facts
        .rows
        .iter()
        .find(|d| d.message_id == "101")
        .expect("detection 101");
    assert_eq!(d101.avg_confidence, 0.55);
    assert_eq!(d101.max_confidence, 0.9);
    assert_eq!(d101.detection_quality.as_str(), "Medium Confidence");
    assert_eq!(d101.scene_composition.as_str(), "Person with Product");

    let placeholder = build
        .detection_facts
        .rows
        .iter()
        .find(|d| d.message_id == "107")
        .expect("detection 107");
    assert_eq!((placeholder.avg_confidence, placeholder.max_confidence), (0.0, 0.0));
    assert_eq!(placeholder.detection_quality.as_str(), "No Detection");
}

#[tokio::test]
async fn unknown_detection_channel_fails_strict_and_quarantines_on_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut detections: Vec<serde_json::Value> = serde_json::from_str(
        &std::fs::read_to_string(fixtures_root().join("detections.json")).expect("fixture"),
    )
    .expect("json");
    detections.push(serde_json::json!({
        "message_id": 999,
        "channel_name": "ghost_pharmacy",
        "image_path": "data/raw/images/ghost_pharmacy/999.jpg",
        "detected_objects": ["bottle"],
        "confidence_scores": [0.88],
        "processed_at": "2025-01-20T06:05:00Z"
    }));
    let detections_path = dir.path().join("detections.json");
    std::fs::write(&detections_path, serde_json::to_vec(&detections).expect("encode")).expect("write");

    let warehouse = dir.path().join("warehouse");
    let strict = WarehousePipeline::new(config(&warehouse, detections_path.clone(), JoinPolicy::Strict))
        .expect("pipeline");
    let err = strict.run_once(processed_at()).await.unwrap_err();
    assert!(format!("{err:#}").contains("ghost_pharmacy"));
    assert_eq!(strict.store().current().await.expect("current"), None);

    let lenient = WarehousePipeline::new(config(&warehouse, detections_path, JoinPolicy::Quarantine))
        .expect("pipeline");
    let summary = lenient.run_once(processed_at()).await.expect("run");
    assert_eq!(summary.quarantined.len(), 1);
    assert_eq!(summary.quarantined[0].record.channel_name, "ghost_pharmacy");
    assert_eq!(summary.tables.rows["fct_image_detections"], 4);

    let report = report_runs_markdown(&warehouse, 3).await.expect("report");
    assert!(report.contains(&format!("## Run `{}` (CURRENT)", summary.run_id)));
    assert!(report.contains("quarantined: 1"));
}
