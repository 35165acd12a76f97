//! esald - vehicle counting daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by ESAL_CONFIG plus ESAL_* overrides)
//! 2. Opens the SQLite detection store, restoring saved regions, behind a
//!    background writer
//! 3. Starts one pipeline per configured stream under a supervisor; a stream
//!    that cannot be set up is reported and skipped
//! 4. Logs counts, ESAL totals and recommendations periodically
//! 5. Enforces retention with periodic pruning
//! 6. Stops every stream, flushes pending writes and saves changed regions
//!    on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use esal_pipeline::events::RecvTimeoutError;
use esal_pipeline::{
    builtin_registry, event_channel, source_for, DetectionStore, EsalConfig, PipelineEvent,
    PipelineParts, PipelineState, Region, RegionRecord, SqliteDetectionStore, StoreWriter,
    StreamInfo, StreamPipeline, StreamSpec, StreamStatus, Supervisor,
};

const EVENT_QUEUE: usize = 64;
const PRUNE_EVERY: Duration = Duration::from_secs(60 * 60);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Name regions are saved under.
const REGION_NAME: &str = "default";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (TOML or JSON).
    #[arg(long, env = "ESAL_CONFIG")]
    config: Option<PathBuf>,
    /// Seconds between count reports.
    #[arg(long, default_value_t = 10)]
    report_every: u64,
    /// Stop after this many seconds (runs until Ctrl-C when unset).
    #[arg(long)]
    run_for: Option<u64>,
}

/// Latest figures reported by one stream.
struct StreamSnapshot {
    frames: u64,
    counts: BTreeMap<String, u64>,
    total: f64,
    recommendation: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.report_every == 0 {
        return Err(anyhow!("report-every must be >= 1"));
    }
    let cfg = EsalConfig::load_with(args.config.as_deref())?;
    log::info!(
        "esald {} starting: {} streams, detector {}, db {}",
        env!("CARGO_PKG_VERSION"),
        cfg.streams.len(),
        cfg.detector.backend,
        cfg.db_path
    );

    let mut store = SqliteDetectionStore::open(&cfg.db_path)?;
    let restored = restore_regions(&mut store, &cfg)?;
    let writer = StoreWriter::spawn(store, cfg.writer)?;
    let registry = builtin_registry(&cfg.detector)?;
    let engine = Arc::new(cfg.scoring.build_engine()?);
    let (events_tx, mut events_rx) = event_channel(EVENT_QUEUE);

    let mut supervisor = Supervisor::new(engine.clone());
    for stream in &cfg.streams {
        writer.handle().register_stream(StreamInfo {
            id: stream.id.clone(),
            name: stream.name.clone(),
            location: stream.location.clone(),
            source: stream.source.clone(),
        })?;
        let spec = StreamSpec {
            id: stream.id.clone(),
            source: stream.source.clone(),
        };
        let region = restored.get(&stream.id).copied().flatten();
        supervisor.add_with(&spec, &events_tx, || {
            let parts = PipelineParts {
                source: source_for(&stream.source)?,
                detector: registry.create_default()?,
                sink: Box::new(writer.handle()),
            };
            let pipeline = StreamPipeline::new(
                spec.clone(),
                parts,
                engine.clone(),
                cfg.pipeline_config_for(stream),
                events_tx.clone(),
            );
            pipeline.set_region(region);
            Ok(pipeline)
        })?;
    }
    drop(events_tx);

    let report = supervisor.start_all();
    if report.started.is_empty() {
        supervisor.stop_all()?;
        drop(supervisor);
        writer.shutdown()?;
        let reasons = report
            .failed
            .iter()
            .map(|(id, err)| format!("{}: {:#}", id, err))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(anyhow!("no stream could be started ({})", reasons));
    }
    if !report.all_started() {
        log::warn!(
            "{} of {} streams failed to start",
            report.failed.len(),
            report.failed.len() + report.started.len()
        );
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let report_every = Duration::from_secs(args.report_every);
    let deadline = args.run_for.map(|secs| Instant::now() + Duration::from_secs(secs));
    let prune_handle = writer.handle();
    let mut snapshots: BTreeMap<String, StreamSnapshot> = BTreeMap::new();
    let mut last_report = Instant::now();
    let mut last_prune: Option<Instant> = None;

    log::info!("esald running (Ctrl-C to stop)");
    loop {
        if shutdown_rx.try_recv().is_ok() {
            log::info!("shutdown signal received, stopping streams...");
            break;
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            log::info!("run time elapsed, stopping streams...");
            break;
        }

        match events_rx.recv_timeout(POLL_INTERVAL) {
            Ok(PipelineEvent::Frame(update)) => {
                snapshots.insert(
                    update.stream_id.clone(),
                    StreamSnapshot {
                        frames: update.sequence,
                        counts: update.counts,
                        total: update.score.total,
                        recommendation: update.recommendation,
                    },
                );
            }
            Ok(PipelineEvent::Status { stream_id, status }) => match status {
                StreamStatus::SourceUnavailable(reason) => {
                    log::error!("stream {}: source unavailable: {}", stream_id, reason)
                }
                StreamStatus::EndOfStream => log::info!("stream {}: playback finished", stream_id),
                StreamStatus::Stopped { frames } => {
                    log::info!("stream {}: worker exited after {} frames", stream_id, frames)
                }
                StreamStatus::Started | StreamStatus::Progress { .. } => {}
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_report.elapsed() >= report_every {
            log_snapshots(&snapshots);
            let combined = supervisor.combined_counts();
            if !combined.is_empty() {
                let summary = engine.total_score(&combined);
                log::info!(
                    "all streams: ESAL {:.1}, {}",
                    summary.total,
                    engine.recommendation_for(summary.total)
                );
            }
            last_report = Instant::now();
        }

        if last_prune.map_or(true, |at| at.elapsed() >= PRUNE_EVERY) {
            if let Err(err) = prune_handle.prune_older_than(cfg.retention) {
                log::warn!("retention pruning not scheduled: {}", err);
            }
            last_prune = Some(Instant::now());
        }

        let states = supervisor.states();
        if states.values().all(|state| *state != PipelineState::Running) {
            log::info!("no stream is running, exiting");
            break;
        }
    }

    log_snapshots(&snapshots);
    let final_regions: BTreeMap<String, Option<Region>> = supervisor
        .stream_ids()
        .into_iter()
        .filter_map(|id| {
            let region = supervisor.pipeline(&id)?.region_handle().get();
            Some((id, region))
        })
        .collect();
    supervisor.stop_all()?;
    drop(supervisor);
    let mut store = writer.shutdown()?;
    save_changed_regions(&mut store, &cfg, &restored, &final_regions);
    let stats = prune_handle.stats();
    log::info!(
        "store writer finished: {} records written, {} failed writes, {} batches dropped",
        stats.written,
        stats.failed_writes,
        stats.dropped_batches
    );
    Ok(())
}

/// Regions to start each stream with. A region in the configuration wins and
/// is saved; otherwise the last saved one is restored.
fn restore_regions(
    store: &mut SqliteDetectionStore,
    cfg: &EsalConfig,
) -> Result<BTreeMap<String, Option<Region>>> {
    let mut out = BTreeMap::new();
    for stream in &cfg.streams {
        let frame = cfg.pipeline_config_for(stream).input_size;
        let region = match stream.region {
            Some(region) => {
                store.save_region(&RegionRecord::from_region(&stream.id, REGION_NAME, region, frame))?;
                Some(region)
            }
            None => {
                let saved = store
                    .active_regions(&stream.id)?
                    .into_iter()
                    .find(|r| r.name == REGION_NAME)
                    .and_then(|r| r.to_region(frame));
                if let Some(region) = saved {
                    log::info!("stream {}: restored region {:?}", stream.id, region);
                }
                saved
            }
        };
        out.insert(stream.id.clone(), region);
    }
    Ok(out)
}

fn save_changed_regions(
    store: &mut SqliteDetectionStore,
    cfg: &EsalConfig,
    restored: &BTreeMap<String, Option<Region>>,
    current: &BTreeMap<String, Option<Region>>,
) {
    for stream in &cfg.streams {
        let Some(Some(region)) = current.get(&stream.id) else {
            continue;
        };
        if restored.get(&stream.id).copied().flatten() == Some(*region) {
            continue;
        }
        let frame = cfg.pipeline_config_for(stream).input_size;
        let record = RegionRecord::from_region(&stream.id, REGION_NAME, *region, frame);
        if let Err(err) = store.save_region(&record) {
            log::warn!("stream {}: region not saved: {:#}", stream.id, err);
        }
    }
}

fn log_snapshots(snapshots: &BTreeMap<String, StreamSnapshot>) {
    for (stream_id, snapshot) in snapshots {
        let counts = snapshot
            .counts
            .iter()
            .map(|(class_name, count)| format!("{}={}", class_name, count))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!(
            "stream {}: frame {}, counts [{}], ESAL {:.1}, {}",
            stream_id,
            snapshot.frames,
            counts,
            snapshot.total,
            snapshot.recommendation
        );
    }
}
