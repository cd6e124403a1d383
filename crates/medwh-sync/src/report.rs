use std::path::Path;

use anyhow::{Context, Result};
use medwh_storage::SnapshotStore;
use serde_json::Value as JsonValue;

use crate::pipeline::{MANIFEST_FILE, RUN_BRIEF_FILE, RUN_SUMMARY_FILE};

/// Markdown overview of the latest `runs` snapshots, newest first. Snapshots without a run
/// summary (interrupted runs) are listed as incomplete.
pub async fn report_runs_markdown(warehouse_dir: &Path, runs: usize) -> Result<String> {
    let store = SnapshotStore::new(warehouse_dir);
    let current = store.current().await.context("reading CURRENT pointer")?;
    let mut run_ids = store.list_runs().await.context("listing snapshots")?;
    run_ids.reverse();

    let mut lines = vec!["# Warehouse Runs".to_string(), String::new()];
    if run_ids.is_empty() {
        lines.push(format!("No snapshots under `{}`.", warehouse_dir.display()));
        lines.push(String::new());
    }

    for run_id in run_ids.into_iter().take(runs.max(1)) {
        let marker = if current.as_deref() == Some(run_id.as_str()) {
            " (CURRENT)"
        } else {
            ""
        };
        lines.push(format!("## Run `{run_id}`{marker}"));

        let dir = store.snapshot_dir(&run_id)?;
        let summary_path = dir.join(RUN_SUMMARY_FILE);
        let summary: JsonValue = match tokio::fs::read(&summary_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", summary_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                lines.push("- incomplete: no run summary".to_string());
                lines.push(String::new());
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", summary_path.display()))
            }
        };

        let processed_at = summary
            .get("processed_at")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown");
        lines.push(format!("- processed at: {processed_at}"));
        if let Some(rows) = summary.pointer("/tables/rows").and_then(JsonValue::as_object) {
            for (table, count) in rows {
                lines.push(format!("- {table}: {count} rows"));
            }
        }
        let count = |pointer: &str| summary.pointer(pointer).and_then(JsonValue::as_u64).unwrap_or(0);
        lines.push(format!(
            "- defects: {}, quarantined: {}",
            summary
                .get("defects")
                .and_then(JsonValue::as_array)
                .map_or(0, Vec::len),
            summary
                .get("quarantined")
                .and_then(JsonValue::as_array)
                .map_or(0, Vec::len),
        ));
        lines.push(format!(
            "- excluded: {} empty, {} future-dated",
            count("/staging/empty_excluded"),
            count("/staging/future_excluded"),
        ));
        if let Some(categories) = summary
            .get("engagement_by_category")
            .and_then(JsonValue::as_array)
            .filter(|c| !c.is_empty())
        {
            let parts: Vec<String> = categories
                .iter()
                .map(|c| {
                    format!(
                        "{} {:.0}",
                        c.get("image_category").and_then(JsonValue::as_str).unwrap_or("?"),
                        c.get("avg_views").and_then(JsonValue::as_f64).unwrap_or(0.0),
                    )
                })
                .collect();
            lines.push(format!("- avg views by image category: {}", parts.join(", ")));
        }
        let failing = summary
            .pointer("/quality/checks")
            .and_then(JsonValue::as_array)
            .map(|checks| {
                checks
                    .iter()
                    .filter(|c| c.get("status").and_then(JsonValue::as_str) == Some("FAIL"))
                    .filter_map(|c| c.get("name").and_then(JsonValue::as_str))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if failing.is_empty() {
            lines.push("- quality: all checks passed".to_string());
        } else {
            lines.push(format!("- quality violations: {}", failing.join(", ")));
        }
        if dir.join(MANIFEST_FILE).exists() {
            lines.push(format!("- manifest: `{}`", dir.join(MANIFEST_FILE).display()));
        }
        if dir.join(RUN_BRIEF_FILE).exists() {
            lines.push(format!("- brief: `{}`", dir.join(RUN_BRIEF_FILE).display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_marks_current_and_incomplete_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let summary = serde_json::json!({
            "processed_at": "2025-01-20T12:00:00Z",
            "tables": { "rows": { "fct_messages": 3 } },
            "defects": [],
            "quarantined": [],
            "staging": { "empty_excluded": 1, "future_excluded": 0 },
            "engagement_by_category": [
                { "image_category": "product_display", "images": 1, "avg_views": 400.0 },
                { "image_category": "promotional", "images": 2, "avg_views": 150.25 }
            ],
            "quality": { "checks": [{ "name": "no_future_messages", "status": "PASS" }] }
        });
        store
            .store_bytes("20250120T120000Z-aaaa0000", RUN_SUMMARY_FILE, summary.to_string().as_bytes())
            .await
            .expect("summary");
        store.publish("20250120T120000Z-aaaa0000").await.expect("publish");
        store
            .store_bytes("20250121T120000Z-bbbb0000", MANIFEST_FILE, b"{}")
            .await
            .expect("partial");

        let report = report_runs_markdown(dir.path(), 5).await.expect("report");
        assert!(report.contains("## Run `20250120T120000Z-aaaa0000` (CURRENT)"));
        assert!(report.contains("- fct_messages: 3 rows"));
        assert!(report.contains("- excluded: 1 empty, 0 future-dated"));
        assert!(report.contains("- avg views by image category: product_display 400, promotional 150"));
        assert!(report.contains("- incomplete: no run summary"));
        let newest = report.find("20250121").expect("newest listed");
        let older = report.find("20250120T").expect("older listed");
        assert!(newest < older);

        let only_latest = report_runs_markdown(dir.path(), 1).await.expect("report");
        assert!(!only_latest.contains("aaaa0000"));
    }
}
