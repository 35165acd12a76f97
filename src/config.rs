use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::persist::{BufferConfig, FailurePolicy, StoreWriterConfig};
use crate::pipeline::PipelineConfig;
use crate::roi::Region;
use crate::score::{
    default_schedule, default_thresholds, MaintenanceStage, ScoreEngine, ScoreTable, Threshold,
    DEFAULT_IDLE_LABEL, DEFAULT_ROUTINE_LABEL,
};
use crate::tracker::TrackerConfig;

const DEFAULT_DB_PATH: &str = "esal.db";
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_STREAM_ID: &str = "camera_1";
const DEFAULT_STREAM_SOURCE: &str = "stub://camera_1";
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 30;

const KNOWN_DETECTORS: &[&str] = &["stub", "tract"];

#[derive(Debug, Deserialize, Default)]
struct EsalConfigFile {
    db_path: Option<String>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
    persistence: Option<PersistenceConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    scoring: Option<ScoringConfigFile>,
    streams: Option<Vec<StreamConfigFile>>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence: Option<f32>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    ttl_ms: Option<u64>,
    match_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PersistenceConfigFile {
    flush_size: Option<usize>,
    flush_secs: Option<u64>,
    on_failure: Option<FailurePolicy>,
    max_buffered: Option<usize>,
    writer_queue: Option<usize>,
    max_pending_batches: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    loop_interval_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    status_every: Option<u64>,
    loop_playback: Option<bool>,
    require_region: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ScoringConfigFile {
    table: Option<IndexMap<String, f64>>,
    thresholds: Option<Vec<Threshold>>,
    routine_label: Option<String>,
    idle_label: Option<String>,
    schedule: Option<Vec<MaintenanceStage>>,
}

#[derive(Debug, Deserialize)]
struct StreamConfigFile {
    id: String,
    source: String,
    name: Option<String>,
    location: Option<String>,
    loop_playback: Option<bool>,
    region: Option<Region>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EsalConfig {
    pub db_path: String,
    pub detector: DetectorSettings,
    pub pipeline: PipelineConfig,
    pub writer: StoreWriterConfig,
    pub scoring: ScoringSettings,
    pub streams: Vec<StreamSettings>,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence: f32,
    pub input_size: u32,
    /// Empty means the backend's own labels (COCO for YOLO exports).
    pub class_names: Vec<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            model_path: None,
            confidence: DEFAULT_CONFIDENCE,
            input_size: 640,
            class_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoringSettings {
    pub table: ScoreTable,
    pub thresholds: Vec<Threshold>,
    pub routine_label: String,
    pub idle_label: String,
    pub schedule: Vec<MaintenanceStage>,
}

impl ScoringSettings {
    pub fn build_engine(&self) -> Result<ScoreEngine> {
        Ok(
            ScoreEngine::new(self.table.clone(), self.thresholds.clone())?
                .with_labels(self.routine_label.clone(), self.idle_label.clone())
                .with_schedule(self.schedule.clone()),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub id: String,
    pub source: String,
    pub name: String,
    pub location: Option<String>,
    pub loop_playback: Option<bool>,
    pub region: Option<Region>,
}

impl EsalConfig {
    /// Load from `ESAL_CONFIG` (if set), then apply `ESAL_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ESAL_CONFIG").ok().map(PathBuf::from);
        Self::load_with(config_path.as_deref())
    }

    /// Load from an explicit file (if any), then apply `ESAL_*` overrides.
    pub fn load_with(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EsalConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let detector_file = file.detector.unwrap_or_default();
        let detector_defaults = DetectorSettings::default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(detector_defaults.backend),
            model_path: detector_file.model_path,
            confidence: detector_file
                .confidence
                .unwrap_or(detector_defaults.confidence),
            input_size: detector_file
                .input_size
                .unwrap_or(detector_defaults.input_size),
            class_names: detector_file.class_names.unwrap_or_default(),
        };

        let defaults = PipelineConfig::default();
        let tracker_file = file.tracker.unwrap_or_default();
        let tracker = TrackerConfig {
            ttl: tracker_file
                .ttl_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.tracker.ttl),
            match_threshold: tracker_file
                .match_threshold
                .unwrap_or(defaults.tracker.match_threshold),
        };

        let persistence = file.persistence.unwrap_or_default();
        let buffer_defaults = BufferConfig::default();
        let buffer = BufferConfig {
            size_threshold: persistence
                .flush_size
                .unwrap_or(buffer_defaults.size_threshold),
            time_threshold: persistence
                .flush_secs
                .map(Duration::from_secs)
                .unwrap_or(buffer_defaults.time_threshold),
            on_failure: persistence.on_failure.unwrap_or(buffer_defaults.on_failure),
            max_buffered: persistence
                .max_buffered
                .unwrap_or(buffer_defaults.max_buffered),
        };
        let writer_defaults = StoreWriterConfig::default();
        let writer = StoreWriterConfig {
            channel_capacity: persistence
                .writer_queue
                .unwrap_or(writer_defaults.channel_capacity),
            max_pending_batches: persistence
                .max_pending_batches
                .unwrap_or(writer_defaults.max_pending_batches),
            retry_interval: writer_defaults.retry_interval,
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineConfig {
            input_size: (
                pipeline_file.width.unwrap_or(defaults.input_size.0),
                pipeline_file.height.unwrap_or(defaults.input_size.1),
            ),
            detector_size_hint: detector.input_size,
            confidence_threshold: detector.confidence,
            loop_playback: pipeline_file.loop_playback.unwrap_or(defaults.loop_playback),
            loop_interval: pipeline_file
                .loop_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.loop_interval),
            stop_timeout: pipeline_file
                .stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_timeout),
            status_every: pipeline_file.status_every.unwrap_or(defaults.status_every),
            require_region: pipeline_file
                .require_region
                .unwrap_or(defaults.require_region),
            draw_overlays: defaults.draw_overlays,
            tracker,
            buffer,
        };

        let scoring_file = file.scoring.unwrap_or_default();
        let table = match scoring_file.table {
            Some(map) => ScoreTable::new(map)?,
            None => ScoreTable::default(),
        };
        let scoring = ScoringSettings {
            table,
            thresholds: scoring_file.thresholds.unwrap_or_else(default_thresholds),
            routine_label: scoring_file
                .routine_label
                .unwrap_or_else(|| DEFAULT_ROUTINE_LABEL.to_string()),
            idle_label: scoring_file
                .idle_label
                .unwrap_or_else(|| DEFAULT_IDLE_LABEL.to_string()),
            schedule: scoring_file.schedule.unwrap_or_else(default_schedule),
        };

        let streams = match file.streams {
            Some(streams) => streams
                .into_iter()
                .map(|s| StreamSettings {
                    name: s.name.unwrap_or_else(|| s.id.clone()),
                    id: s.id,
                    source: s.source,
                    location: s.location,
                    loop_playback: s.loop_playback,
                    region: s.region,
                })
                .collect(),
            None => vec![StreamSettings::new(DEFAULT_STREAM_ID, DEFAULT_STREAM_SOURCE)],
        };

        let retention = Duration::from_secs(
            file.retention
                .and_then(|retention| retention.seconds)
                .unwrap_or(DEFAULT_RETENTION_SECS),
        );

        Ok(Self {
            db_path,
            detector,
            pipeline,
            writer,
            scoring,
            streams,
            retention,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("ESAL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(backend) = std::env::var("ESAL_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_lowercase();
            }
        }
        if let Ok(path) = std::env::var("ESAL_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(confidence) = std::env::var("ESAL_CONFIDENCE") {
            let value: f32 = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("ESAL_CONFIDENCE must be a number between 0 and 1"))?;
            self.detector.confidence = value;
            self.pipeline.confidence_threshold = value;
        }
        if let Ok(ttl) = std::env::var("ESAL_TRACK_TTL_MS") {
            let ms: u64 = ttl
                .trim()
                .parse()
                .map_err(|_| anyhow!("ESAL_TRACK_TTL_MS must be an integer number of milliseconds"))?;
            self.pipeline.tracker.ttl = Duration::from_millis(ms);
        }
        if let Ok(threshold) = std::env::var("ESAL_MATCH_THRESHOLD") {
            self.pipeline.tracker.match_threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("ESAL_MATCH_THRESHOLD must be a number of pixels"))?;
        }
        if let Ok(size) = std::env::var("ESAL_FLUSH_SIZE") {
            self.pipeline.buffer.size_threshold = size
                .trim()
                .parse()
                .map_err(|_| anyhow!("ESAL_FLUSH_SIZE must be an integer record count"))?;
        }
        if let Ok(secs) = std::env::var("ESAL_FLUSH_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| anyhow!("ESAL_FLUSH_SECS must be an integer number of seconds"))?;
            self.pipeline.buffer.time_threshold = Duration::from_secs(secs);
        }
        if let Ok(streams) = std::env::var("ESAL_STREAMS") {
            let parsed = parse_streams(&streams)?;
            if !parsed.is_empty() {
                self.streams = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if !KNOWN_DETECTORS.contains(&self.detector.backend.as_str()) {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected one of: {})",
                self.detector.backend,
                KNOWN_DETECTORS.join(", ")
            ));
        }
        if self.detector.backend == "tract" && self.detector.model_path.is_none() {
            return Err(anyhow!("detector backend 'tract' requires a model_path"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(anyhow!("detector confidence must be between 0 and 1"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be greater than zero"));
        }
        let (width, height) = self.pipeline.input_size;
        if width == 0 || height == 0 {
            return Err(anyhow!("pipeline width and height must be greater than zero"));
        }
        if self.pipeline.tracker.ttl.is_zero() {
            return Err(anyhow!("tracker ttl must be greater than zero"));
        }
        if !(self.pipeline.tracker.match_threshold > 0.0) {
            return Err(anyhow!("tracker match_threshold must be greater than zero"));
        }
        if self.pipeline.buffer.size_threshold == 0 {
            return Err(anyhow!("persistence flush_size must be greater than zero"));
        }
        if self.retention.as_secs() == 0 {
            return Err(anyhow!("retention must be greater than zero"));
        }
        if self.streams.is_empty() {
            return Err(anyhow!("at least one stream must be configured"));
        }
        let mut seen = BTreeSet::new();
        for stream in &self.streams {
            if stream.id.trim().is_empty() || stream.source.trim().is_empty() {
                return Err(anyhow!("streams need a non-empty id and source"));
            }
            if !seen.insert(stream.id.as_str()) {
                return Err(anyhow!("duplicate stream id '{}'", stream.id));
            }
            if let Some(region) = stream.region {
                if region.width == 0 || region.height == 0 {
                    return Err(anyhow!("stream '{}' has an empty region", stream.id));
                }
            }
        }
        for threshold in &self.scoring.thresholds {
            if threshold.label.trim().is_empty() {
                return Err(anyhow!("threshold {} has an empty label", threshold.value));
            }
        }
        self.scoring.build_engine()?;
        Ok(())
    }

    /// Pipeline settings for one stream, with its own overrides applied.
    pub fn pipeline_config_for(&self, stream: &StreamSettings) -> PipelineConfig {
        let mut cfg = self.pipeline.clone();
        if let Some(loop_playback) = stream.loop_playback {
            cfg.loop_playback = loop_playback;
        }
        cfg
    }
}

impl StreamSettings {
    pub fn new(id: &str, source: &str) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            name: id.to_string(),
            location: None,
            loop_playback: None,
            region: None,
        }
    }
}

fn read_config_file(path: &Path) -> Result<EsalConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// `id=source` pairs, comma separated.
fn parse_streams(value: &str) -> Result<Vec<StreamSettings>> {
    split_csv(value)
        .into_iter()
        .map(|entry| {
            let (id, source) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("ESAL_STREAMS entry '{}' must look like id=source", entry))?;
            Ok(StreamSettings::new(id.trim(), source.trim()))
        })
        .collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_list_parses_pairs() -> Result<()> {
        let streams = parse_streams("north=stub://north, south = rtsp://cam/2")?;
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[1].id, "south");
        assert_eq!(streams[1].source, "rtsp://cam/2");
        assert!(parse_streams("north").is_err());
        Ok(())
    }

    #[test]
    fn defaults_validate() -> Result<()> {
        let mut cfg = EsalConfig::from_file(EsalConfigFile::default())?;
        cfg.validate()?;
        assert_eq!(cfg.streams[0].source, DEFAULT_STREAM_SOURCE);
        assert_eq!(cfg.pipeline.buffer.size_threshold, 20);
        assert_eq!(cfg.scoring.build_engine()?.score_for("truck"), 25160.0);
        Ok(())
    }
}
