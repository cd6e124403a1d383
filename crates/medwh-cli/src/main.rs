use std::io::Write;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use medwh_sync::{report_runs_markdown, PipelineConfig, WarehousePipeline};
use medwh_transform::{DateDimension, DateHorizon, JoinPolicy, QualityMode, RuleBook};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "medwh-cli")]
#[command(about = "Channel message and image detection warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every stage once and publish a new warehouse snapshot.
    Run {
        /// Fail the run when any quality check has violations.
        #[arg(long)]
        strict: bool,
        /// Exclude fact rows with unresolved dimension keys instead of failing.
        #[arg(long)]
        quarantine: bool,
        /// Processing time (RFC 3339). Defaults to now.
        #[arg(long, value_parser = parse_processed_at)]
        processed_at: Option<DateTime<Utc>>,
    },
    /// Print the date dimension as JSON lines.
    Dates {
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Markdown overview of the latest runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn parse_processed_at(raw: &str) -> Result<DateTime<Utc>, String> {
    medwh_core::time::parse_timestamp(raw)
        .ok_or_else(|| format!("{raw:?} is not an RFC 3339 or YYYY-MM-DD HH:MM:SS timestamp"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,sqlx=warn"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run {
        strict: false,
        quarantine: false,
        processed_at: None,
    }) {
        Commands::Run {
            strict,
            quarantine,
            processed_at,
        } => {
            if strict {
                config.quality_mode = QualityMode::Strict;
            }
            if quarantine {
                config.join_policy = JoinPolicy::Quarantine;
            }
            let processed_at = processed_at.unwrap_or_else(Utc::now);
            let summary = WarehousePipeline::new(config)?.run_once(processed_at).await?;
            println!(
                "run complete: run_id={} messages={} channels={} detections={} defects={} quarantined={} violations={} snapshot={}",
                summary.run_id,
                summary.tables.rows.get("fct_messages").copied().unwrap_or(0),
                summary.tables.distinct_channels,
                summary.tables.rows.get("fct_image_detections").copied().unwrap_or(0),
                summary.defects.len(),
                summary.quarantined.len(),
                summary.quality.total_violations(),
                summary.snapshot_dir,
            );
        }
        Commands::Dates { start, end } => {
            let horizon = DateHorizon::new(
                start.unwrap_or(config.horizon.start),
                end.unwrap_or(config.horizon.end),
            )?;
            let rules = RuleBook::from_dir(&config.rules_dir)
                .with_context(|| format!("loading rule tables from {}", config.rules_dir.display()))?;
            let dates = DateDimension::build(horizon, &rules.holidays);
            info!(rows = dates.rows().len(), "generated date dimension");

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for row in dates.rows() {
                serde_json::to_writer(&mut out, row).context("encoding date row")?;
                writeln!(out).context("writing date row")?;
            }
        }
        Commands::Report { runs } => {
            if runs == 0 {
                return Err(anyhow!("--runs must be at least 1"));
            }
            print!("{}", report_runs_markdown(&config.warehouse_dir, runs).await?);
        }
    }

    Ok(())
}
