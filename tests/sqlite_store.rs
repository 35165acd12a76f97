use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;

use esal_pipeline::persist::{StoreWriter, StoreWriterConfig};
use esal_pipeline::roi::Region;
use esal_pipeline::score::Urgency;
use esal_pipeline::storage::{
    AnalysisRecord, DetectionRecord, DetectionStore, MaintenanceStatus, MaintenanceTask,
    RegionRecord, SqliteDetectionStore, StreamInfo,
};
use esal_pipeline::{now_s, shared_memory_uri, BatchSink};

fn record(stream: &str, track_id: u64, class: &str, captured_at: u64) -> DetectionRecord {
    DetectionRecord {
        stream_id: stream.to_string(),
        track_id,
        frame_number: track_id * 3,
        class_name: class.to_string(),
        class_id: if class == "truck" { Some(7) } else { None },
        confidence: 0.75,
        bbox_x: 0.25,
        bbox_y: 0.5,
        bbox_width: 0.125,
        bbox_height: 0.0625,
        captured_at,
    }
}

fn stream(id: &str, source: &str) -> StreamInfo {
    StreamInfo {
        id: id.to_string(),
        name: format!("{} camera", id),
        location: Some("Route 9".to_string()),
        source: source.to_string(),
    }
}

#[test]
fn registers_and_updates_streams() -> Result<()> {
    let mut store = SqliteDetectionStore::open(&shared_memory_uri())?;
    store.register_stream(&stream("north", "stub://north"))?;
    store.register_stream(&stream("south", "rtsp://cam/2"))?;
    let mut renamed = stream("north", "/data/north.mp4");
    renamed.name = "North gate".to_string();
    store.register_stream(&renamed)?;

    let streams = store.streams()?;
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0].id, "north");
    assert_eq!(streams[0].name, "North gate");
    assert_eq!(streams[0].source, "/data/north.mp4");
    assert_eq!(streams[1].stream_type(), "rtsp");
    Ok(())
}

#[test]
fn batches_round_trip_and_count_by_class() -> Result<()> {
    let mut store = SqliteDetectionStore::open(&shared_memory_uri())?;
    let now = now_s()?;
    store.write_batch(
        "north",
        &[
            record("north", 1, "car", now - 7_200),
            record("north", 2, "car", now),
            record("north", 3, "truck", now),
        ],
    )?;
    store.write_batch("south", &[record("south", 1, "bus", now)])?;
    store.write_batch("north", &[])?;

    let all = store.class_counts("north", None)?;
    assert_eq!(all.get("car"), Some(&2));
    assert_eq!(all.get("truck"), Some(&1));
    let recent = store.class_counts("north", Some(now - 3_600))?;
    assert_eq!(recent.get("car"), Some(&1));
    assert_eq!(store.detection_count("north")?, 3);

    let north = store.records(Some("north"), None, 10)?;
    assert_eq!(north.len(), 3);
    assert_eq!(north[0], record("north", 1, "car", now - 7_200));
    assert_eq!(north[2].class_id, Some(7));
    assert_eq!(store.records(None, None, 10)?.len(), 4);
    assert_eq!(store.records(None, None, 2)?.len(), 2);
    Ok(())
}

#[test]
fn analyses_are_listed_newest_first() -> Result<()> {
    let mut store = SqliteDetectionStore::open(&shared_memory_uri())?;
    let mut counts = BTreeMap::new();
    counts.insert("car".to_string(), 3u64);
    counts.insert("truck".to_string(), 1u64);
    let first = AnalysisRecord {
        stream_id: "north".to_string(),
        period_start: 100,
        period_end: 200,
        counts: counts.clone(),
        total_esal: 25163.0,
        damage_level: 1,
        urgency: "low".to_string(),
        recommendation: "routine monitoring".to_string(),
        estimated_maintenance_at: 200 + 180 * 86_400,
    };
    let second = AnalysisRecord {
        period_start: 200,
        period_end: 300,
        total_esal: 900_000.0,
        damage_level: 5,
        urgency: "high".to_string(),
        recommendation: "intermediate repair".to_string(),
        ..first.clone()
    };
    store.record_analysis(&first)?;
    store.record_analysis(&second)?;

    let listed = store.analyses("north", 10)?;
    assert_eq!(listed, vec![second, first]);
    assert!(store.analyses("south", 10)?.is_empty());
    Ok(())
}

#[test]
fn prune_removes_rows_past_retention() -> Result<()> {
    let mut store = SqliteDetectionStore::open(&shared_memory_uri())?;
    let now = now_s()?;
    store.write_batch(
        "north",
        &[
            record("north", 1, "car", now - 10 * 86_400),
            record("north", 2, "car", now - 60),
        ],
    )?;
    let removed = store.prune_older_than(Duration::from_secs(86_400))?;
    assert_eq!(removed, 1);
    let left = store.records(Some("north"), None, 10)?;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].track_id, 2);
    Ok(())
}

#[test]
fn file_database_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("esal.db");
    let path = path.to_string_lossy().to_string();
    let now = now_s()?;
    {
        let mut store = SqliteDetectionStore::open(&path)?;
        store.register_stream(&stream("north", "stub://north"))?;
        store.write_batch("north", &[record("north", 1, "bus", now)])?;
    }
    let mut store = SqliteDetectionStore::open(&path)?;
    assert_eq!(store.streams()?.len(), 1);
    assert_eq!(store.class_counts("north", None)?.get("bus"), Some(&1));
    Ok(())
}

#[test]
fn writer_thread_persists_into_sqlite() -> Result<()> {
    let store = SqliteDetectionStore::open(&shared_memory_uri())?;
    let writer = StoreWriter::spawn(store, StoreWriterConfig::default())?;
    let now = now_s()?;
    let mut handle = writer.handle();
    handle.register_stream(stream("north", "stub://north"))?;
    handle.submit("north", &[record("north", 1, "car", now), record("north", 2, "truck", now)])?;
    handle.prune_older_than(Duration::from_secs(3_600))?;
    let mut store = writer.shutdown()?;

    assert_eq!(store.streams()?.len(), 1);
    assert_eq!(store.detection_count("north")?, 2);
    assert_eq!(handle.stats().written, 2);
    Ok(())
}

#[test]
fn windowed_records_skip_rows_before_since() -> Result<()> {
    let mut store = SqliteDetectionStore::open(&shared_memory_uri())?;
    let now = now_s()?;
    store.write_batch(
        "north",
        &[
            record("north", 1, "car", now - 10 * 3_600),
            record("north", 2, "car", now - 9 * 3_600),
            record("north", 3, "truck", now),
            record("north", 4, "truck", now),
        ],
    )?;

    let recent = store.records(Some("north"), Some(now - 3_600), 2)?;
    let ids: Vec<u64> = recent.iter().map(|r| r.track_id).collect();
    assert_eq!(ids, vec![3, 4]);
    assert_eq!(store.records(None, Some(now - 3_600), 1)?.len(), 1);
    assert!(store.records(Some("north"), Some(now + 60), 10)?.is_empty());
    Ok(())
}

#[test]
fn latest_region_per_name_stays_active() -> Result<()> {
    let mut store = SqliteDetectionStore::open(&shared_memory_uri())?;
    let first = Region::new(0, 0, 320, 320).unwrap();
    let second = Region::new(64, 128, 320, 160).unwrap();
    store.save_region(&RegionRecord::from_region("north", "lane", first, (640, 640)))?;
    store.save_region(&RegionRecord::from_region("north", "lane", second, (640, 640)))?;
    let mut other = RegionRecord::from_region("north", "exit", first, (640, 640));
    other.kind = Some("exit".to_string());
    store.save_region(&other)?;

    let active = store.active_regions("north")?;
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].name, "exit");
    assert_eq!(active[0].kind.as_deref(), Some("exit"));
    assert_eq!(active[1].name, "lane");
    assert_eq!(active[1].to_region((640, 640)), Some(second));
    assert!(store.active_regions("south")?.is_empty());
    Ok(())
}

#[test]
fn maintenance_is_scheduled_completed_and_pruned() -> Result<()> {
    let mut store = SqliteDetectionStore::open(&shared_memory_uri())?;
    let now = now_s()?;
    let analysis = |total: f64, stream: &str| AnalysisRecord {
        stream_id: stream.to_string(),
        period_start: now - 86_400,
        period_end: now,
        counts: BTreeMap::new(),
        total_esal: total,
        damage_level: 5,
        urgency: String::new(),
        recommendation: String::new(),
        estimated_maintenance_at: now,
    };
    let critical = MaintenanceTask::for_analysis(&analysis(1_200_000.0, "north"), Urgency::Critical)
        .expect("critical analyses schedule work");
    let high = MaintenanceTask::for_analysis(&analysis(900_000.0, "south"), Urgency::High)
        .expect("high analyses schedule work");
    let first = store.schedule_maintenance(&critical)?;
    let second = store.schedule_maintenance(&high)?;
    assert_ne!(first, second);

    let tasks = store.maintenance_tasks(None)?;
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].stream_id, "north");
    assert_eq!(tasks[0].maintenance_type, "reconstruction");
    assert_eq!(tasks[0].priority, 4);
    assert_eq!(tasks[0].scheduled_at, now + 7 * 86_400);
    assert_eq!(tasks[1].estimated_cost, 2_000_000.0);
    assert_eq!(store.maintenance_tasks(Some("south"))?.len(), 1);

    store.set_maintenance_status(first, MaintenanceStatus::Completed)?;
    let done = store.maintenance_tasks(Some("north"))?;
    assert_eq!(done[0].status, MaintenanceStatus::Completed);
    assert!(done[0].completed_at.is_some());
    assert!(store
        .set_maintenance_status(9_999, MaintenanceStatus::Cancelled)
        .is_err());

    // Completed just now, so a day of retention keeps it.
    store.prune_older_than(Duration::from_secs(86_400))?;
    assert_eq!(store.maintenance_tasks(None)?.len(), 2);
    Ok(())
}
