//! esal_report - summarize stored detections as ESAL load and maintenance advice

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use esal_pipeline::{
    now_s, AnalysisRecord, DetectionRecord, DetectionStore, EsalConfig, MaintenanceStatus,
    MaintenanceTask, ScoreEngine, SqliteDetectionStore, StreamInfo,
};

#[path = "../ui.rs"]
mod ui;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file supplying the scoring tables (TOML or JSON).
    #[arg(long, env = "ESAL_CONFIG")]
    config: Option<PathBuf>,
    /// Path to the detection database (defaults to the configured db_path).
    #[arg(long)]
    db_path: Option<String>,
    /// Only report this stream.
    #[arg(long)]
    stream: Option<String>,
    /// Only count detections from the last N hours.
    #[arg(long)]
    since_hours: Option<u64>,
    /// Store the analysis for each reported stream and schedule maintenance
    /// when it is urgent.
    #[arg(long)]
    record_analysis: bool,
    /// Print the maintenance schedule.
    #[arg(long)]
    maintenance: bool,
    /// Mark a scheduled maintenance task as completed.
    #[arg(long, value_name = "TASK_ID")]
    complete_task: Option<u64>,
    /// Export the matching detections to this CSV file.
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Maximum rows exported to CSV.
    #[arg(long, default_value_t = 100_000)]
    csv_limit: usize,
    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Debug, Serialize)]
struct StreamReport {
    stream_id: String,
    name: String,
    location: Option<String>,
    stream_type: String,
    counts: BTreeMap<String, u64>,
    total_esal: f64,
    breakdown: Vec<String>,
    recommendation: String,
    maintenance_stage: Option<String>,
    damage_level: u8,
    urgency: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let (cfg, engine) = {
        let _stage = ui.stage("Load configuration");
        let cfg = EsalConfig::load_with(args.config.as_deref())?;
        let engine = cfg.scoring.build_engine()?;
        (cfg, engine)
    };
    let db_path = args.db_path.clone().unwrap_or_else(|| cfg.db_path.clone());

    let mut store = {
        let _stage = ui.stage("Open detection store");
        SqliteDetectionStore::open(&db_path)?
    };

    let now = now_s()?;
    let since = args
        .since_hours
        .map(|hours| now.saturating_sub(hours.saturating_mul(60 * 60)));

    let streams = select_streams(&mut store, args.stream.as_deref())?;
    if streams.is_empty() {
        return Err(anyhow!("no streams registered in {}", db_path));
    }

    let reports = {
        let _stage = ui.stage("Score detections");
        let mut reports = Vec::with_capacity(streams.len());
        for info in &streams {
            let counts = store.class_counts(&info.id, since)?;
            reports.push(build_report(info, counts, &engine));
        }
        reports
    };

    if args.record_analysis {
        let _stage = ui.stage("Record analyses");
        for report in &reports {
            let analysis = analysis_for(report, &engine, since, now);
            store.record_analysis(&analysis)?;
            if let Some(task) =
                MaintenanceTask::for_analysis(&analysis, engine.urgency(analysis.total_esal))
            {
                let id = store.schedule_maintenance(&task)?;
                log::info!(
                    "stream {}: scheduled {} (task {})",
                    task.stream_id,
                    task.maintenance_type,
                    id
                );
            }
        }
    }

    if let Some(task_id) = args.complete_task {
        store.set_maintenance_status(task_id, MaintenanceStatus::Completed)?;
        eprintln!("maintenance task {} marked completed", task_id);
    }

    if let Some(path) = &args.csv {
        let records = store.records(args.stream.as_deref(), since, args.csv_limit)?;
        let stage = ui.rows("Export CSV", records.len() as u64);
        write_csv(path, &records, |n| stage.inc(n))?;
        drop(stage);
        eprintln!("{} detections written to {}", records.len(), path.display());
    }

    let schedule = if args.maintenance {
        store.maintenance_tasks(args.stream.as_deref())?
    } else {
        Vec::new()
    };

    if args.json {
        if args.maintenance {
            let out = serde_json::json!({ "streams": reports, "maintenance": schedule });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
    } else {
        for report in &reports {
            print_report(report);
        }
        if args.maintenance {
            print_schedule(&schedule);
        }
    }
    Ok(())
}

fn select_streams(store: &mut SqliteDetectionStore, only: Option<&str>) -> Result<Vec<StreamInfo>> {
    let registered = store.streams()?;
    let Some(only) = only else {
        return Ok(registered);
    };
    let info = registered
        .into_iter()
        .find(|info| info.id == only)
        .unwrap_or_else(|| StreamInfo {
            id: only.to_string(),
            name: only.to_string(),
            location: None,
            source: String::new(),
        });
    Ok(vec![info])
}

fn build_report(info: &StreamInfo, counts: BTreeMap<String, u64>, engine: &ScoreEngine) -> StreamReport {
    let summary = engine.total_score(&counts);
    let stage = engine.maintenance_stage(summary.total).map(|stage| {
        format!(
            "{} ({}% of design, year {}): {}",
            stage.stage, stage.design_pct, stage.timing_years, stage.note
        )
    });
    StreamReport {
        stream_id: info.id.clone(),
        name: info.name.clone(),
        location: info.location.clone(),
        stream_type: info.stream_type().to_string(),
        breakdown: engine.detailed_breakdown(&counts),
        recommendation: engine.recommendation_for(summary.total).to_string(),
        maintenance_stage: stage,
        damage_level: engine.damage_level(summary.total),
        urgency: engine.urgency(summary.total).to_string(),
        total_esal: summary.total,
        counts,
    }
}

fn analysis_for(report: &StreamReport, engine: &ScoreEngine, since: Option<u64>, now: u64) -> AnalysisRecord {
    let urgency = engine.urgency(report.total_esal);
    AnalysisRecord {
        stream_id: report.stream_id.clone(),
        period_start: since.unwrap_or(0),
        period_end: now,
        counts: report.counts.clone(),
        total_esal: report.total_esal,
        damage_level: report.damage_level,
        urgency: urgency.to_string(),
        recommendation: report.recommendation.clone(),
        estimated_maintenance_at: now + u64::from(urgency.lead_days()) * SECONDS_PER_DAY,
    }
}

fn print_report(report: &StreamReport) {
    match &report.location {
        Some(location) => println!(
            "stream {} ({}, {} @ {})",
            report.stream_id, report.stream_type, report.name, location
        ),
        None => println!(
            "stream {} ({}, {})",
            report.stream_id, report.stream_type, report.name
        ),
    }
    if report.breakdown.is_empty() {
        println!("  no detections");
    }
    for line in &report.breakdown {
        println!("  {}", line);
    }
    println!("  total ESAL: {:.1}", report.total_esal);
    println!("  recommendation: {}", report.recommendation);
    match &report.maintenance_stage {
        Some(stage) => println!("  maintenance stage: {}", stage),
        None => println!("  maintenance stage: none reached"),
    }
    println!(
        "  damage level: {}/5, urgency: {}",
        report.damage_level, report.urgency
    );
}

fn print_schedule(tasks: &[MaintenanceTask]) {
    if tasks.is_empty() {
        println!("maintenance: nothing scheduled");
        return;
    }
    println!("maintenance:");
    for task in tasks {
        println!(
            "  #{} {} {} priority {} cost {:.0} due {} [{}]",
            task.id.unwrap_or_default(),
            task.stream_id,
            task.maintenance_type,
            task.priority,
            task.estimated_cost,
            task.scheduled_at,
            task.status.as_str()
        );
    }
}

const CSV_COLUMNS: [&str; 11] = [
    "stream_id",
    "track_id",
    "frame_number",
    "class_name",
    "class_id",
    "confidence",
    "bbox_x",
    "bbox_y",
    "bbox_width",
    "bbox_height",
    "captured_at",
];

fn write_csv<F: Fn(u64)>(path: &Path, records: &[DetectionRecord], progress: F) -> Result<()> {
    // Header written up front so an empty export still names its columns.
    let mut out = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    out.write_record(CSV_COLUMNS)?;
    for record in records {
        out.serialize(record)
            .with_context(|| format!("failed to write {}", path.display()))?;
        progress(1);
    }
    out.flush()?;
    Ok(())
}
