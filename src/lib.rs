//! Vehicle counting and pavement load estimation.
//!
//! Video streams are read frame by frame, vehicles are detected and tracked
//! so each one is counted once, confirmed vehicles are persisted to SQLite and
//! the running counts are converted to an ESAL (equivalent single axle load)
//! score with a maintenance recommendation.
//!
//! # Module Structure
//!
//! - `ingest`: Frame sources (synthetic `stub://` scenes, ffmpeg decoding)
//! - `detect`: Detector backends and their registry
//! - `tracker`: Counting each physical vehicle once
//! - `score`: ESAL tables, thresholds and maintenance analysis
//! - `persist` / `storage`: Batched, retried writes to a detection store
//! - `pipeline` / `supervisor`: Per-stream workers and their owner
//! - `events`: Frame and status delivery from workers to the caller
//! - `roi`: Region of interest and display coordinate mapping

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod persist;
pub mod pipeline;
pub mod roi;
pub mod score;
pub mod storage;
pub mod supervisor;
pub mod tracker;

pub use config::{DetectorSettings, EsalConfig, ScoringSettings, StreamSettings};
pub use detect::{builtin_registry, BackendRegistry, BoundingBox, Detection, DetectorBackend};
pub use error::PipelineError;
pub use events::{event_channel, EventReceiver, EventSender};
pub use frame::{Frame, Rgb};
pub use ingest::{source_for, FrameSource, ReadOutcome, SyntheticSource};
pub use persist::{BatchSink, BufferConfig, FailurePolicy, StoreWriter, StoreWriterHandle};
pub use pipeline::{
    FrameUpdate, PipelineConfig, PipelineEvent, PipelineParts, PipelineState, StreamPipeline,
    StreamSpec, StreamStatus,
};
pub use roi::{DisplayTransform, Region, SharedRegion, WidgetRect};
pub use score::{ScoreEngine, ScoreSummary, ScoreTable, Threshold, Urgency};
pub use storage::{
    AnalysisRecord, DetectionRecord, DetectionStore, InMemoryDetectionStore, MaintenanceStatus,
    MaintenanceTask, RegionRecord, SqliteDetectionStore, StreamInfo,
};
pub use supervisor::{StartReport, Supervisor};
pub use tracker::{Tracker, TrackerConfig};

/// URI for a private, shared-cache in-memory SQLite database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:esal_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Wall-clock seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
