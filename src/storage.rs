use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::now_s;
use crate::roi::Region;
use crate::score::Urgency;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Camera/stream metadata kept alongside its detections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    pub source: String,
}

impl StreamInfo {
    /// `file`, `rtsp`, `http` or `stub`, derived from the source locator.
    pub fn stream_type(&self) -> &'static str {
        let source = self.source.to_ascii_lowercase();
        if source.starts_with("stub://") {
            "stub"
        } else if source.starts_with("rtsp://") {
            "rtsp"
        } else if source.starts_with("http://") || source.starts_with("https://") {
            "http"
        } else {
            "file"
        }
    }
}

/// Durable record of one newly confirmed object.
///
/// The box is normalized to `[0, 1]` against the source-space frame and is
/// stored center-first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub stream_id: String,
    pub track_id: u64,
    pub frame_number: u64,
    pub class_name: String,
    pub class_id: Option<u32>,
    pub confidence: f32,
    pub bbox_x: f32,
    pub bbox_y: f32,
    pub bbox_width: f32,
    pub bbox_height: f32,
    /// Seconds since the Unix epoch.
    pub captured_at: u64,
}

/// Stored result of scoring a window of detections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub stream_id: String,
    pub period_start: u64,
    pub period_end: u64,
    pub counts: BTreeMap<String, u64>,
    pub total_esal: f64,
    pub damage_level: u8,
    pub urgency: String,
    pub recommendation: String,
    pub estimated_maintenance_at: u64,
}

/// A region of interest saved for a stream, in coordinates normalized to
/// `[0, 1]` against the frame it was drawn on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub stream_id: String,
    pub name: String,
    /// Free-form role such as `lane` or `intersection`.
    pub kind: Option<String>,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RegionRecord {
    pub fn from_region(stream_id: &str, name: &str, region: Region, frame: (u32, u32)) -> Self {
        let (w, h) = (frame.0.max(1) as f32, frame.1.max(1) as f32);
        Self {
            stream_id: stream_id.to_string(),
            name: name.to_string(),
            kind: None,
            x1: (region.x as f32 / w).clamp(0.0, 1.0),
            y1: (region.y as f32 / h).clamp(0.0, 1.0),
            x2: (region.right() as f32 / w).clamp(0.0, 1.0),
            y2: (region.bottom() as f32 / h).clamp(0.0, 1.0),
        }
    }

    /// Pixel region in a `frame`-sized grid. `None` when it would be empty.
    pub fn to_region(&self, frame: (u32, u32)) -> Option<Region> {
        let (w, h) = (frame.0 as f32, frame.1 as f32);
        let x1 = (self.x1.min(self.x2).clamp(0.0, 1.0) * w).round() as u32;
        let y1 = (self.y1.min(self.y2).clamp(0.0, 1.0) * h).round() as u32;
        let x2 = (self.x1.max(self.x2).clamp(0.0, 1.0) * w).round() as u32;
        let y2 = (self.y1.max(self.y2).clamp(0.0, 1.0) * h).round() as u32;
        Region::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl MaintenanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceStatus::Scheduled => "scheduled",
            MaintenanceStatus::InProgress => "in_progress",
            MaintenanceStatus::Completed => "completed",
            MaintenanceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "scheduled" => Ok(MaintenanceStatus::Scheduled),
            "in_progress" => Ok(MaintenanceStatus::InProgress),
            "completed" => Ok(MaintenanceStatus::Completed),
            "cancelled" => Ok(MaintenanceStatus::Cancelled),
            other => Err(anyhow!("unknown maintenance status '{}'", other)),
        }
    }
}

/// Maintenance work put on the schedule by an analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    /// Assigned by the store.
    pub id: Option<u64>,
    pub stream_id: String,
    pub maintenance_type: String,
    /// 1 (low) to 4 (critical).
    pub priority: u8,
    pub estimated_cost: f64,
    pub scheduled_at: u64,
    pub triggering_esal: f64,
    pub status: MaintenanceStatus,
    pub completed_at: Option<u64>,
    pub notes: String,
}

impl MaintenanceTask {
    /// Work an analysis calls for. `None` unless the urgency is high or critical.
    pub fn for_analysis(analysis: &AnalysisRecord, urgency: Urgency) -> Option<Self> {
        if !urgency.needs_scheduling() {
            return None;
        }
        Some(Self {
            id: None,
            stream_id: analysis.stream_id.clone(),
            maintenance_type: urgency.maintenance_type().to_string(),
            priority: urgency.priority(),
            estimated_cost: urgency.estimated_cost(),
            scheduled_at: analysis.period_end + u64::from(urgency.lead_days()) * SECONDS_PER_DAY,
            triggering_esal: analysis.total_esal,
            status: MaintenanceStatus::Scheduled,
            completed_at: None,
            notes: format!("scheduled from ESAL analysis ({} urgency)", urgency),
        })
    }
}

/// Storage collaborator. Implementations own their connection and are used
/// from a single thread at a time.
pub trait DetectionStore: Send {
    fn register_stream(&mut self, info: &StreamInfo) -> Result<()>;

    fn streams(&mut self) -> Result<Vec<StreamInfo>>;

    /// Insert a batch atomically: all records land or none do.
    fn write_batch(&mut self, stream_id: &str, records: &[DetectionRecord]) -> Result<()>;

    /// Per-class counts for a stream, optionally limited to `captured_at >= since`.
    fn class_counts(&mut self, stream_id: &str, since: Option<u64>) -> Result<BTreeMap<String, u64>>;

    /// Oldest first, limited to `captured_at >= since` when given. `None`
    /// reads every stream.
    fn records(
        &mut self,
        stream_id: Option<&str>,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<DetectionRecord>>;

    fn record_analysis(&mut self, analysis: &AnalysisRecord) -> Result<()>;

    /// Newest first.
    fn analyses(&mut self, stream_id: &str, limit: usize) -> Result<Vec<AnalysisRecord>>;

    /// Save a region for a stream and make it the active one under its name.
    fn save_region(&mut self, region: &RegionRecord) -> Result<()>;

    /// Active regions for a stream, newest first.
    fn active_regions(&mut self, stream_id: &str) -> Result<Vec<RegionRecord>>;

    /// Returns the assigned task id.
    fn schedule_maintenance(&mut self, task: &MaintenanceTask) -> Result<u64>;

    /// Tasks ordered by scheduled date, optionally for one stream.
    fn maintenance_tasks(&mut self, stream_id: Option<&str>) -> Result<Vec<MaintenanceTask>>;

    /// Move a task to `status`; completing it records the completion time.
    fn set_maintenance_status(&mut self, task_id: u64, status: MaintenanceStatus) -> Result<()>;

    /// Delete detections and analyses older than `retention`, and completed
    /// maintenance finished before then. Returns rows removed.
    fn prune_older_than(&mut self, retention: Duration) -> Result<usize>;
}

impl<S: DetectionStore + ?Sized> DetectionStore for Box<S> {
    fn register_stream(&mut self, info: &StreamInfo) -> Result<()> {
        (**self).register_stream(info)
    }

    fn streams(&mut self) -> Result<Vec<StreamInfo>> {
        (**self).streams()
    }

    fn write_batch(&mut self, stream_id: &str, records: &[DetectionRecord]) -> Result<()> {
        (**self).write_batch(stream_id, records)
    }

    fn class_counts(&mut self, stream_id: &str, since: Option<u64>) -> Result<BTreeMap<String, u64>> {
        (**self).class_counts(stream_id, since)
    }

    fn records(
        &mut self,
        stream_id: Option<&str>,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<DetectionRecord>> {
        (**self).records(stream_id, since, limit)
    }

    fn record_analysis(&mut self, analysis: &AnalysisRecord) -> Result<()> {
        (**self).record_analysis(analysis)
    }

    fn analyses(&mut self, stream_id: &str, limit: usize) -> Result<Vec<AnalysisRecord>> {
        (**self).analyses(stream_id, limit)
    }

    fn save_region(&mut self, region: &RegionRecord) -> Result<()> {
        (**self).save_region(region)
    }

    fn active_regions(&mut self, stream_id: &str) -> Result<Vec<RegionRecord>> {
        (**self).active_regions(stream_id)
    }

    fn schedule_maintenance(&mut self, task: &MaintenanceTask) -> Result<u64> {
        (**self).schedule_maintenance(task)
    }

    fn maintenance_tasks(&mut self, stream_id: Option<&str>) -> Result<Vec<MaintenanceTask>> {
        (**self).maintenance_tasks(stream_id)
    }

    fn set_maintenance_status(&mut self, task_id: u64, status: MaintenanceStatus) -> Result<()> {
        (**self).set_maintenance_status(task_id, status)
    }

    fn prune_older_than(&mut self, retention: Duration) -> Result<usize> {
        (**self).prune_older_than(retention)
    }
}

fn retention_cutoff(retention: Duration) -> Result<i64> {
    let now = now_s()? as i64;
    Ok(now - retention.as_secs() as i64)
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", what))
}

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS camera_streams (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              location TEXT,
              stream_url TEXT NOT NULL,
              stream_type TEXT NOT NULL,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vehicle_detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              track_id INTEGER NOT NULL,
              frame_number INTEGER NOT NULL,
              vehicle_type TEXT NOT NULL,
              vehicle_class INTEGER,
              confidence REAL NOT NULL,
              bbox_x REAL NOT NULL,
              bbox_y REAL NOT NULL,
              bbox_width REAL NOT NULL,
              bbox_height REAL NOT NULL,
              timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS esal_analysis (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              period_start INTEGER NOT NULL,
              period_end INTEGER NOT NULL,
              counts_json TEXT NOT NULL,
              total_esal REAL NOT NULL,
              pavement_damage_level INTEGER NOT NULL,
              maintenance_urgency TEXT NOT NULL,
              recommendation TEXT NOT NULL,
              estimated_maintenance_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS roi_regions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              roi_name TEXT NOT NULL,
              roi_type TEXT,
              x1 REAL NOT NULL,
              y1 REAL NOT NULL,
              x2 REAL NOT NULL,
              y2 REAL NOT NULL,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS maintenance_schedule (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              maintenance_type TEXT NOT NULL,
              priority_level INTEGER NOT NULL,
              estimated_cost REAL NOT NULL,
              scheduled_date INTEGER NOT NULL,
              completion_date INTEGER,
              status TEXT NOT NULL DEFAULT 'scheduled',
              triggering_esal_value REAL NOT NULL,
              notes TEXT NOT NULL DEFAULT '',
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_camera_time
              ON vehicle_detections(camera_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_analysis_camera
              ON esal_analysis(camera_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_regions_camera
              ON roi_regions(camera_id, is_active);
            "#,
        )?;
        Ok(())
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn register_stream(&mut self, info: &StreamInfo) -> Result<()> {
        let now = to_i64(now_s()?, "timestamp")?;
        self.conn.execute(
            r#"
            INSERT INTO camera_streams(id, name, location, stream_url, stream_type, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(id) DO UPDATE SET
              name = excluded.name,
              location = excluded.location,
              stream_url = excluded.stream_url,
              stream_type = excluded.stream_type,
              updated_at = excluded.updated_at
            "#,
            params![
                info.id,
                info.name,
                info.location,
                info.source,
                info.stream_type(),
                now
            ],
        )?;
        Ok(())
    }

    fn streams(&mut self) -> Result<Vec<StreamInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, location, stream_url FROM camera_streams ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(StreamInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                location: row.get(2)?,
                source: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn write_batch(&mut self, stream_id: &str, records: &[DetectionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO vehicle_detections(
                  camera_id, track_id, frame_number, vehicle_type, vehicle_class, confidence,
                  bbox_x, bbox_y, bbox_width, bbox_height, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;
            for record in records {
                stmt.execute(params![
                    stream_id,
                    to_i64(record.track_id, "track id")?,
                    to_i64(record.frame_number, "frame number")?,
                    record.class_name,
                    record.class_id,
                    record.confidence as f64,
                    record.bbox_x as f64,
                    record.bbox_y as f64,
                    record.bbox_width as f64,
                    record.bbox_height as f64,
                    to_i64(record.captured_at, "capture time")?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn class_counts(&mut self, stream_id: &str, since: Option<u64>) -> Result<BTreeMap<String, u64>> {
        let since = to_i64(since.unwrap_or(0), "since")?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT vehicle_type, COUNT(*) FROM vehicle_detections
            WHERE camera_id = ?1 AND timestamp >= ?2
            GROUP BY vehicle_type
            "#,
        )?;
        let rows = stmt.query_map(params![stream_id, since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (class_name, count) = row?;
            out.insert(class_name, count.max(0) as u64);
        }
        Ok(out)
    }

    fn records(
        &mut self,
        stream_id: Option<&str>,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<DetectionRecord>> {
        let since = to_i64(since.unwrap_or(0), "since")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT camera_id, track_id, frame_number, vehicle_type, vehicle_class, confidence,
                   bbox_x, bbox_y, bbox_width, bbox_height, timestamp
            FROM vehicle_detections
            WHERE (?1 IS NULL OR camera_id = ?1) AND timestamp >= ?2
            ORDER BY id ASC LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![stream_id, since, limit], |row| {
            Ok(DetectionRecord {
                stream_id: row.get(0)?,
                track_id: row.get::<_, i64>(1)?.max(0) as u64,
                frame_number: row.get::<_, i64>(2)?.max(0) as u64,
                class_name: row.get(3)?,
                class_id: row.get(4)?,
                confidence: row.get::<_, f64>(5)? as f32,
                bbox_x: row.get::<_, f64>(6)? as f32,
                bbox_y: row.get::<_, f64>(7)? as f32,
                bbox_width: row.get::<_, f64>(8)? as f32,
                bbox_height: row.get::<_, f64>(9)? as f32,
                captured_at: row.get::<_, i64>(10)?.max(0) as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn record_analysis(&mut self, analysis: &AnalysisRecord) -> Result<()> {
        let counts_json = serde_json::to_string(&analysis.counts)?;
        self.conn.execute(
            r#"
            INSERT INTO esal_analysis(
              camera_id, created_at, period_start, period_end, counts_json, total_esal,
              pavement_damage_level, maintenance_urgency, recommendation, estimated_maintenance_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                analysis.stream_id,
                to_i64(now_s()?, "timestamp")?,
                to_i64(analysis.period_start, "period start")?,
                to_i64(analysis.period_end, "period end")?,
                counts_json,
                analysis.total_esal,
                analysis.damage_level as i64,
                analysis.urgency,
                analysis.recommendation,
                to_i64(analysis.estimated_maintenance_at, "maintenance date")?,
            ],
        )?;
        Ok(())
    }

    fn analyses(&mut self, stream_id: &str, limit: usize) -> Result<Vec<AnalysisRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT camera_id, period_start, period_end, counts_json, total_esal,
                   pavement_damage_level, maintenance_urgency, recommendation,
                   estimated_maintenance_at
            FROM esal_analysis WHERE camera_id = ?1
            ORDER BY id DESC LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![stream_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (stream_id, start, end, counts_json, total, level, urgency, recommendation, due) =
                row?;
            let counts = serde_json::from_str(&counts_json)
                .with_context(|| format!("corrupt counts in analysis for {}", stream_id))?;
            out.push(AnalysisRecord {
                stream_id,
                period_start: start.max(0) as u64,
                period_end: end.max(0) as u64,
                counts,
                total_esal: total,
                damage_level: level.clamp(0, u8::MAX as i64) as u8,
                urgency,
                recommendation,
                estimated_maintenance_at: due.max(0) as u64,
            });
        }
        Ok(out)
    }

    fn prune_older_than(&mut self, retention: Duration) -> Result<usize> {
        let cutoff = retention_cutoff(retention)?;
        let detections = self.conn.execute(
            "DELETE FROM vehicle_detections WHERE timestamp < ?1",
            params![cutoff],
        )?;
        let analyses = self.conn.execute(
            "DELETE FROM esal_analysis WHERE created_at < ?1",
            params![cutoff],
        )?;
        let finished = self.conn.execute(
            "DELETE FROM maintenance_schedule WHERE status = 'completed' AND completion_date < ?1",
            params![cutoff],
        )?;
        Ok(detections + analyses + finished)
    }

    fn save_region(&mut self, region: &RegionRecord) -> Result<()> {
        let now = to_i64(now_s()?, "timestamp")?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE roi_regions SET is_active = 0 WHERE camera_id = ?1 AND roi_name = ?2",
            params![region.stream_id, region.name],
        )?;
        tx.execute(
            r#"
            INSERT INTO roi_regions(camera_id, roi_name, roi_type, x1, y1, x2, y2, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                region.stream_id,
                region.name,
                region.kind,
                region.x1 as f64,
                region.y1 as f64,
                region.x2 as f64,
                region.y2 as f64,
                now
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn active_regions(&mut self, stream_id: &str) -> Result<Vec<RegionRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT camera_id, roi_name, roi_type, x1, y1, x2, y2 FROM roi_regions
            WHERE camera_id = ?1 AND is_active = 1
            ORDER BY id DESC
            "#,
        )?;
        let rows = stmt.query_map(params![stream_id], |row| {
            Ok(RegionRecord {
                stream_id: row.get(0)?,
                name: row.get(1)?,
                kind: row.get(2)?,
                x1: row.get::<_, f64>(3)? as f32,
                y1: row.get::<_, f64>(4)? as f32,
                x2: row.get::<_, f64>(5)? as f32,
                y2: row.get::<_, f64>(6)? as f32,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn schedule_maintenance(&mut self, task: &MaintenanceTask) -> Result<u64> {
        let completed_at = task
            .completed_at
            .map(|at| to_i64(at, "completion date"))
            .transpose()?;
        self.conn.execute(
            r#"
            INSERT INTO maintenance_schedule(
              camera_id, maintenance_type, priority_level, estimated_cost, scheduled_date,
              completion_date, status, triggering_esal_value, notes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                task.stream_id,
                task.maintenance_type,
                task.priority as i64,
                task.estimated_cost,
                to_i64(task.scheduled_at, "scheduled date")?,
                completed_at,
                task.status.as_str(),
                task.triggering_esal,
                task.notes,
                to_i64(now_s()?, "timestamp")?,
            ],
        )?;
        Ok(self.conn.last_insert_rowid().max(0) as u64)
    }

    fn maintenance_tasks(&mut self, stream_id: Option<&str>) -> Result<Vec<MaintenanceTask>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, camera_id, maintenance_type, priority_level, estimated_cost,
                   scheduled_date, triggering_esal_value, status, completion_date, notes
            FROM maintenance_schedule
            WHERE ?1 IS NULL OR camera_id = ?1
            ORDER BY scheduled_date ASC, id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![stream_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<i64>>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, stream_id, kind, priority, cost, scheduled, esal, status, done, notes) = row?;
            out.push(MaintenanceTask {
                id: Some(id.max(0) as u64),
                stream_id,
                maintenance_type: kind,
                priority: priority.clamp(0, u8::MAX as i64) as u8,
                estimated_cost: cost,
                scheduled_at: scheduled.max(0) as u64,
                triggering_esal: esal,
                status: MaintenanceStatus::parse(&status)?,
                completed_at: done.map(|at| at.max(0) as u64),
                notes,
            });
        }
        Ok(out)
    }

    fn set_maintenance_status(&mut self, task_id: u64, status: MaintenanceStatus) -> Result<()> {
        let completed_at = match status {
            MaintenanceStatus::Completed => Some(to_i64(now_s()?, "timestamp")?),
            _ => None,
        };
        let changed = self.conn.execute(
            "UPDATE maintenance_schedule SET status = ?1, completion_date = ?2 WHERE id = ?3",
            params![status.as_str(), completed_at, to_i64(task_id, "task id")?],
        )?;
        if changed == 0 {
            return Err(anyhow!("no maintenance task with id {}", task_id));
        }
        Ok(())
    }
}

impl SqliteDetectionStore {
    /// Number of detections stored for a stream.
    pub fn detection_count(&self, stream_id: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM vehicle_detections WHERE camera_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Clone, Debug)]
struct StoredAnalysis {
    created_at: u64,
    analysis: AnalysisRecord,
}

/// Store kept entirely in memory. Used by tests and by replays that don't need
/// durable output.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    streams: BTreeMap<String, StreamInfo>,
    detections: Vec<DetectionRecord>,
    analyses: Vec<StoredAnalysis>,
    regions: Vec<(RegionRecord, bool)>,
    tasks: Vec<MaintenanceTask>,
    /// Remaining batches to reject, for exercising failure paths.
    fail_next_writes: usize,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `write_batch` calls fail.
    pub fn fail_next_writes(&mut self, n: usize) {
        self.fail_next_writes = n;
    }

    pub fn detections(&self) -> &[DetectionRecord] {
        &self.detections
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn register_stream(&mut self, info: &StreamInfo) -> Result<()> {
        self.streams.insert(info.id.clone(), info.clone());
        Ok(())
    }

    fn streams(&mut self) -> Result<Vec<StreamInfo>> {
        Ok(self.streams.values().cloned().collect())
    }

    fn write_batch(&mut self, stream_id: &str, records: &[DetectionRecord]) -> Result<()> {
        if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            return Err(anyhow!("in-memory store rejected batch for {}", stream_id));
        }
        self.detections.extend(records.iter().cloned().map(|mut r| {
            r.stream_id = stream_id.to_string();
            r
        }));
        Ok(())
    }

    fn class_counts(&mut self, stream_id: &str, since: Option<u64>) -> Result<BTreeMap<String, u64>> {
        let since = since.unwrap_or(0);
        let mut out = BTreeMap::new();
        for record in self
            .detections
            .iter()
            .filter(|r| r.stream_id == stream_id && r.captured_at >= since)
        {
            *out.entry(record.class_name.clone()).or_insert(0) += 1;
        }
        Ok(out)
    }

    fn records(
        &mut self,
        stream_id: Option<&str>,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<DetectionRecord>> {
        let since = since.unwrap_or(0);
        Ok(self
            .detections
            .iter()
            .filter(|r| stream_id.map_or(true, |id| r.stream_id == id) && r.captured_at >= since)
            .take(limit)
            .cloned()
            .collect())
    }

    fn record_analysis(&mut self, analysis: &AnalysisRecord) -> Result<()> {
        self.analyses.push(StoredAnalysis {
            created_at: now_s()?,
            analysis: analysis.clone(),
        });
        Ok(())
    }

    fn analyses(&mut self, stream_id: &str, limit: usize) -> Result<Vec<AnalysisRecord>> {
        Ok(self
            .analyses
            .iter()
            .rev()
            .filter(|a| a.analysis.stream_id == stream_id)
            .take(limit)
            .map(|a| a.analysis.clone())
            .collect())
    }

    fn prune_older_than(&mut self, retention: Duration) -> Result<usize> {
        let cutoff = retention_cutoff(retention)?;
        let before = self.detections.len() + self.analyses.len();
        self.detections.retain(|r| r.captured_at as i64 >= cutoff);
        self.analyses.retain(|a| a.created_at as i64 >= cutoff);
        let tasks_before = self.tasks.len();
        self.tasks.retain(|t| {
            t.status != MaintenanceStatus::Completed
                || t.completed_at.map_or(true, |at| at as i64 >= cutoff)
        });
        Ok(before - self.detections.len() - self.analyses.len() + tasks_before - self.tasks.len())
    }

    fn save_region(&mut self, region: &RegionRecord) -> Result<()> {
        for (saved, active) in self.regions.iter_mut() {
            if saved.stream_id == region.stream_id && saved.name == region.name {
                *active = false;
            }
        }
        self.regions.push((region.clone(), true));
        Ok(())
    }

    fn active_regions(&mut self, stream_id: &str) -> Result<Vec<RegionRecord>> {
        Ok(self
            .regions
            .iter()
            .rev()
            .filter(|(r, active)| *active && r.stream_id == stream_id)
            .map(|(r, _)| r.clone())
            .collect())
    }

    fn schedule_maintenance(&mut self, task: &MaintenanceTask) -> Result<u64> {
        let id = self.tasks.len() as u64 + 1;
        let mut task = task.clone();
        task.id = Some(id);
        self.tasks.push(task);
        Ok(id)
    }

    fn maintenance_tasks(&mut self, stream_id: Option<&str>) -> Result<Vec<MaintenanceTask>> {
        let mut out: Vec<MaintenanceTask> = self
            .tasks
            .iter()
            .filter(|t| stream_id.map_or(true, |id| t.stream_id == id))
            .cloned()
            .collect();
        out.sort_by_key(|t| (t.scheduled_at, t.id));
        Ok(out)
    }

    fn set_maintenance_status(&mut self, task_id: u64, status: MaintenanceStatus) -> Result<()> {
        let completed_at = match status {
            MaintenanceStatus::Completed => Some(now_s()?),
            _ => None,
        };
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == Some(task_id))
            .ok_or_else(|| anyhow!("no maintenance task with id {}", task_id))?;
        task.status = status;
        task.completed_at = completed_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stream: &str, track_id: u64, class: &str, captured_at: u64) -> DetectionRecord {
        DetectionRecord {
            stream_id: stream.to_string(),
            track_id,
            frame_number: track_id * 10,
            class_name: class.to_string(),
            class_id: Some(2),
            confidence: 0.8,
            bbox_x: 0.5,
            bbox_y: 0.5,
            bbox_width: 0.1,
            bbox_height: 0.1,
            captured_at,
        }
    }

    #[test]
    fn in_memory_counts_by_class_and_window() -> Result<()> {
        let mut store = InMemoryDetectionStore::new();
        store.write_batch(
            "north",
            &[
                record("north", 1, "car", 100),
                record("north", 2, "car", 200),
                record("north", 3, "truck", 300),
            ],
        )?;
        store.write_batch("south", &[record("south", 1, "bus", 100)])?;

        let all = store.class_counts("north", None)?;
        assert_eq!(all.get("car"), Some(&2));
        assert_eq!(all.get("truck"), Some(&1));
        let recent = store.class_counts("north", Some(250))?;
        assert_eq!(recent.len(), 1);
        assert_eq!(store.records(None, None, 10)?.len(), 4);
        assert_eq!(store.records(Some("south"), None, 10)?.len(), 1);
        assert_eq!(store.records(Some("north"), Some(250), 1)?[0].track_id, 3);
        Ok(())
    }

    #[test]
    fn in_memory_failure_injection() -> Result<()> {
        let mut store = InMemoryDetectionStore::new();
        store.fail_next_writes(1);
        assert!(store.write_batch("a", &[record("a", 1, "car", 1)]).is_err());
        store.write_batch("a", &[record("a", 1, "car", 1)])?;
        assert_eq!(store.detections().len(), 1);
        Ok(())
    }

    #[test]
    fn in_memory_prune_drops_old_rows() -> Result<()> {
        let mut store = InMemoryDetectionStore::new();
        let now = now_s()?;
        store.write_batch(
            "a",
            &[record("a", 1, "car", now - 10_000), record("a", 2, "car", now)],
        )?;
        assert_eq!(store.prune_older_than(Duration::from_secs(3_600))?, 1);
        assert_eq!(store.detections().len(), 1);
        Ok(())
    }

    #[test]
    fn region_records_round_trip_through_normalized_form() {
        let region = Region::new(64, 128, 320, 160).unwrap();
        let saved = RegionRecord::from_region("cam", "lane", region, (640, 640));
        assert_eq!((saved.x1, saved.y1, saved.x2, saved.y2), (0.1, 0.2, 0.6, 0.45));
        assert_eq!(saved.to_region((640, 640)), Some(region));
        assert_eq!(
            saved.to_region((1280, 720)),
            Region::new(128, 144, 640, 180)
        );
        let empty = RegionRecord { x2: 0.1, ..saved };
        assert_eq!(empty.to_region((640, 640)), None);
    }

    #[test]
    fn only_high_urgency_analyses_schedule_work() {
        let analysis = AnalysisRecord {
            stream_id: "cam".into(),
            period_start: 0,
            period_end: 1_000,
            counts: BTreeMap::new(),
            total_esal: 900_000.0,
            damage_level: 5,
            urgency: "high".into(),
            recommendation: "intermediate repair".into(),
            estimated_maintenance_at: 1_000 + 30 * SECONDS_PER_DAY,
        };
        let task = MaintenanceTask::for_analysis(&analysis, Urgency::High).unwrap();
        assert_eq!(task.maintenance_type, "rehabilitation");
        assert_eq!(task.priority, 3);
        assert_eq!(task.scheduled_at, analysis.estimated_maintenance_at);
        assert_eq!(task.status, MaintenanceStatus::Scheduled);
        assert!(MaintenanceTask::for_analysis(&analysis, Urgency::Medium).is_none());
    }

    #[test]
    fn in_memory_prunes_only_completed_maintenance() -> Result<()> {
        let mut store = InMemoryDetectionStore::new();
        let task = |status| MaintenanceTask {
            id: None,
            stream_id: "cam".into(),
            maintenance_type: "rehabilitation".into(),
            priority: 3,
            estimated_cost: 2_000_000.0,
            scheduled_at: 10,
            triggering_esal: 900_000.0,
            status,
            completed_at: Some(10),
            notes: String::new(),
        };
        store.schedule_maintenance(&task(MaintenanceStatus::Completed))?;
        store.schedule_maintenance(&task(MaintenanceStatus::Scheduled))?;
        assert_eq!(store.prune_older_than(Duration::from_secs(3_600))?, 1);
        let left = store.maintenance_tasks(Some("cam"))?;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, MaintenanceStatus::Scheduled);
        Ok(())
    }

    #[test]
    fn stream_type_from_locator() {
        let info = |source: &str| StreamInfo {
            id: "a".into(),
            name: "a".into(),
            location: None,
            source: source.into(),
        };
        assert_eq!(info("stub://x").stream_type(), "stub");
        assert_eq!(info("RTSP://cam/1").stream_type(), "rtsp");
        assert_eq!(info("https://cctv/live.m3u8").stream_type(), "http");
        assert_eq!(info("/data/clip.mp4").stream_type(), "file");
    }
}
