//! Per-stream worker.
//!
//! A `StreamPipeline` owns its collaborators (frame source, detector, batch
//! sink) and moves them onto a worker thread while running. Each iteration
//! reads a frame, normalizes it, runs the detector on the region of interest,
//! folds detections into the tracker, buffers newly confirmed objects for
//! persistence and reports an annotated frame with counts and score.
//!
//! Stopping is cooperative: the worker checks a flag at the top of every
//! iteration, drains the buffer, releases the source and hands its parts back
//! through the thread's join handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::detect::{Detection, DetectorBackend};
use crate::error::PipelineError;
use crate::events::EventSender;
use crate::frame::{Frame, Rgb};
use crate::ingest::{FrameSource, ReadOutcome};
use crate::persist::{BatchSink, BufferConfig, PersistenceBuffer};
use crate::roi::{Region, SharedRegion};
use crate::score::{ScoreEngine, ScoreSummary};
use crate::storage::DetectionRecord;
use crate::tracker::{ConfirmedTrack, Tracker, TrackerConfig};

pub const DEFAULT_INPUT_SIZE: (u32, u32) = (640, 640);
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_STATUS_EVERY: u64 = 30;

/// Log the first failure, then every this many.
const LOG_EVERY: u64 = 50;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Every frame is resized to this before anything else; it defines source space.
    pub input_size: (u32, u32),
    pub detector_size_hint: u32,
    pub confidence_threshold: f32,
    /// Rewind on end of stream instead of stopping.
    pub loop_playback: bool,
    pub loop_interval: Duration,
    pub stop_timeout: Duration,
    /// Emit a progress status every this many frames. 0 disables it.
    pub status_every: u64,
    /// Only detect and count while a region is set.
    pub require_region: bool,
    pub draw_overlays: bool,
    pub tracker: TrackerConfig,
    pub buffer: BufferConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            detector_size_hint: 640,
            confidence_threshold: 0.25,
            loop_playback: true,
            loop_interval: DEFAULT_LOOP_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            status_every: DEFAULT_STATUS_EVERY,
            require_region: false,
            draw_overlays: true,
            tracker: TrackerConfig::default(),
            buffer: BufferConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Stream identity: an id for records and a locator for the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub id: String,
    pub source: String,
}

/// Collaborators a pipeline drives.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn DetectorBackend>,
    pub sink: Box<dyn BatchSink + Send>,
}

/// One processed frame.
#[derive(Clone, Debug)]
pub struct FrameUpdate {
    pub stream_id: String,
    pub sequence: u64,
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub counts: BTreeMap<String, u64>,
    pub score: ScoreSummary,
    pub recommendation: String,
    /// False when the detector failed on this frame.
    pub annotated: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamStatus {
    Started,
    Progress { frames: u64, total_count: u64 },
    EndOfStream,
    SourceUnavailable(String),
    Stopped { frames: u64 },
}

#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Frame(FrameUpdate),
    Status {
        stream_id: String,
        status: StreamStatus,
    },
}

struct WorkerParts {
    parts: PipelineParts,
    tracker: Tracker,
}

#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<PipelineState>>,
    counts: Arc<Mutex<BTreeMap<String, u64>>>,
    shutdown: Arc<AtomicBool>,
    reset_requested: Arc<AtomicBool>,
}

fn lock_or_recover<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn state(&self) -> PipelineState {
        *lock_or_recover(&self.state)
    }

    fn set_state(&self, state: PipelineState) {
        *lock_or_recover(&self.state) = state;
    }
}

pub struct StreamPipeline {
    spec: StreamSpec,
    config: PipelineConfig,
    engine: Arc<ScoreEngine>,
    region: SharedRegion,
    events: EventSender,
    shared: Shared,
    epoch: Instant,
    idle_parts: Option<WorkerParts>,
    join: Option<JoinHandle<WorkerParts>>,
    exit_rx: Option<Receiver<()>>,
}

impl StreamPipeline {
    pub fn new(
        spec: StreamSpec,
        parts: PipelineParts,
        engine: Arc<ScoreEngine>,
        config: PipelineConfig,
        events: EventSender,
    ) -> Self {
        let tracker = Tracker::new(config.tracker);
        Self {
            spec,
            config,
            engine,
            region: SharedRegion::default(),
            events,
            shared: Shared {
                state: Arc::new(Mutex::new(PipelineState::Idle)),
                counts: Arc::new(Mutex::new(BTreeMap::new())),
                shutdown: Arc::new(AtomicBool::new(false)),
                reset_requested: Arc::new(AtomicBool::new(false)),
            },
            epoch: Instant::now(),
            idle_parts: Some(WorkerParts { parts, tracker }),
            join: None,
            exit_rx: None,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.spec.id
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Per-class counts as of the last processed frame.
    pub fn counts(&self) -> BTreeMap<String, u64> {
        lock_or_recover(&self.shared.counts).clone()
    }

    /// Handle for a UI caller to update the region while running.
    pub fn region_handle(&self) -> SharedRegion {
        self.region.clone()
    }

    pub fn set_region(&self, region: Option<Region>) {
        self.region.set(region);
    }

    /// Clear counts and live tracks. Applied at the next iteration when running.
    pub fn reset_counts(&mut self) {
        match self.idle_parts.as_mut() {
            Some(idle) => idle.tracker.reset(),
            None => self.shared.reset_requested.store(true, Ordering::SeqCst),
        }
        lock_or_recover(&self.shared.counts).clear();
    }

    /// Swap scoring tables. A running worker keeps its engine; the new one
    /// applies from the next `start`.
    pub fn replace_score_engine(&mut self, engine: Arc<ScoreEngine>) {
        self.engine = engine;
    }


    /// Open the source and spawn the worker. No-op while running.
    pub fn start(&mut self) -> Result<()> {
        if self.state() == PipelineState::Running {
            return Ok(());
        }
        self.reclaim_worker(None)?;
        let wall_anchor = WallClock::anchor(self.epoch)?;

        let mut worker = self
            .idle_parts
            .take()
            .ok_or_else(|| anyhow!("pipeline {} lost its collaborators", self.spec.id))?;

        if let Err(err) = worker.parts.source.open(&self.spec.source) {
            worker.parts.source.release();
            self.idle_parts = Some(worker);
            let reason = format!("{:#}", err);
            log::error!("stream {}: source {} unavailable: {}", self.spec.id, self.spec.source, reason);
            self.events
                .status(&self.spec.id, StreamStatus::SourceUnavailable(reason.clone()));
            return Err(PipelineError::SourceUnavailable {
                source: self.spec.source.clone(),
                reason,
            }
            .into());
        }

        if let Err(err) = worker.parts.detector.warm_up() {
            log::warn!("stream {}: detector warm-up failed: {}", self.spec.id, err);
        }

        self.shared.shutdown.store(false, Ordering::SeqCst);
        self.shared.set_state(PipelineState::Running);

        let (exit_tx, exit_rx) = mpsc::channel();
        let ctx = WorkerContext {
            stream_id: self.spec.id.clone(),
            config: self.config.clone(),
            engine: self.engine.clone(),
            region: self.region.clone(),
            events: self.events.clone(),
            shared: self.shared.clone(),
            epoch: self.epoch,
            wall_clock: wall_anchor,
            exit_tx,
        };
        let spawned = std::thread::Builder::new()
            .name(format!("pipeline-{}", self.spec.id))
            .spawn(move || run_worker(ctx, worker));
        match spawned {
            Ok(join) => {
                self.join = Some(join);
                self.exit_rx = Some(exit_rx);
                log::info!("stream {}: started on {}", self.spec.id, self.spec.source);
                Ok(())
            }
            Err(err) => {
                // The closure, and the parts inside it, are gone with the failed spawn.
                self.shared.set_state(PipelineState::Stopped);
                Err(anyhow!("failed to spawn worker for {}: {}", self.spec.id, err))
            }
        }
    }

    /// Request a stop and wait up to `stop_timeout` for the worker to exit.
    pub fn stop(&mut self) -> Result<()> {
        if self.join.is_none() {
            return Ok(());
        }
        if self.state() == PipelineState::Running {
            self.shared.set_state(PipelineState::Stopping);
        }
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let timeout = self.config.stop_timeout;
        self.reclaim_worker(Some(timeout))
    }

    /// Join a finished (or finishing) worker and take its parts back.
    ///
    /// With a timeout, gives up once it elapses and leaves the worker to be
    /// joined later.
    fn reclaim_worker(&mut self, timeout: Option<Duration>) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        if let (Some(timeout), Some(exit_rx)) = (timeout, self.exit_rx.as_ref()) {
            match exit_rx.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "stream {}: worker did not stop within {:?}, will join later",
                        self.spec.id,
                        timeout
                    );
                    self.join = Some(join);
                    return Ok(());
                }
            }
        }
        self.exit_rx = None;
        let parts = join
            .join()
            .map_err(|_| anyhow!("pipeline worker for {} panicked", self.spec.id))?;
        self.idle_parts = Some(parts);
        self.shared.set_state(PipelineState::Stopped);
        Ok(())
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        if self.join.is_some() {
            if let Err(err) = self.stop() {
                log::warn!("stream {}: stop on drop failed: {}", self.spec.id, err);
            }
        }
    }
}

struct WorkerContext {
    stream_id: String,
    config: PipelineConfig,
    engine: Arc<ScoreEngine>,
    region: SharedRegion,
    events: EventSender,
    shared: Shared,
    epoch: Instant,
    wall_clock: WallClock,
    exit_tx: Sender<()>,
}

impl WorkerContext {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn emit_status(&self, status: StreamStatus) {
        self.events.status(&self.stream_id, status);
    }
}

/// Counts occurrences and says when one is worth logging.
struct RateLimit {
    count: u64,
}

impl RateLimit {
    fn new() -> Self {
        Self { count: 0 }
    }

    fn hit(&mut self) -> Option<u64> {
        self.count += 1;
        if self.count == 1 || self.count % LOG_EVERY == 0 {
            Some(self.count)
        } else {
            None
        }
    }
}

/// Wall-clock seconds pinned to the pipeline's monotonic clock at start, so
/// capture times never depend on a later system clock reading.
#[derive(Clone, Copy, Debug)]
struct WallClock {
    unix_secs: u64,
    at: Duration,
}

impl WallClock {
    fn anchor(epoch: Instant) -> Result<Self> {
        let unix_secs = crate::now_s()
            .map_err(|err| anyhow!("system clock unusable for capture times: {}", err))?;
        Ok(Self {
            unix_secs,
            at: epoch.elapsed(),
        })
    }

    fn at(&self, now: Duration) -> u64 {
        self.unix_secs + now.saturating_sub(self.at).as_secs()
    }
}

fn run_worker(ctx: WorkerContext, mut worker: WorkerParts) -> WorkerParts {
    let (width, height) = ctx.config.input_size;
    let mut buffer = PersistenceBuffer::new(ctx.stream_id.clone(), ctx.config.buffer, ctx.now());
    let mut sequence: u64 = 0;
    let mut read_failures = RateLimit::new();
    let mut inference_failures = RateLimit::new();
    let mut dropped_frames = RateLimit::new();

    ctx.emit_status(StreamStatus::Started);

    loop {
        if ctx.shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if ctx.shared.reset_requested.swap(false, Ordering::SeqCst) {
            worker.tracker.reset();
            log::info!("stream {}: counts reset", ctx.stream_id);
        }

        let raw = match worker.parts.source.read() {
            Ok(ReadOutcome::Frame(frame)) => frame,
            Ok(ReadOutcome::EndOfStream) => {
                if !ctx.config.loop_playback {
                    log::info!("stream {}: end of stream", ctx.stream_id);
                    ctx.emit_status(StreamStatus::EndOfStream);
                    break;
                }
                if let Err(err) = worker.parts.source.rewind() {
                    if let Some(n) = read_failures.hit() {
                        log::warn!("stream {}: rewind failed ({}x): {}", ctx.stream_id, n, err);
                    }
                    std::thread::sleep(ctx.config.loop_interval);
                }
                continue;
            }
            Err(err) => {
                let err = PipelineError::TransientRead(format!("{:#}", err));
                if let Some(n) = read_failures.hit() {
                    log::warn!("stream {}: {} ({}x)", ctx.stream_id, err, n);
                }
                std::thread::sleep(ctx.config.loop_interval);
                continue;
            }
        };

        let mut frame = match raw.resized(width, height) {
            Ok(frame) => frame,
            Err(err) => {
                if let Some(n) = read_failures.hit() {
                    log::warn!("stream {}: unusable frame ({}x): {}", ctx.stream_id, n, err);
                }
                continue;
            }
        };
        sequence += 1;

        let region = ctx.region.get().and_then(|r| r.clamp_to(width, height));
        let inference = if ctx.config.require_region && region.is_none() {
            Ok(Vec::new())
        } else {
            detect(worker.parts.detector.as_mut(), &frame, region, &ctx.config)
        };
        let now = ctx.now();
        let (detections, annotated) = match inference {
            Ok(detections) => (detections, true),
            Err(err) => {
                let err = PipelineError::Inference(format!("{:#}", err));
                if let Some(n) = inference_failures.hit() {
                    log::warn!("stream {}: {} ({}x)", ctx.stream_id, err, n);
                }
                (Vec::new(), false)
            }
        };

        if annotated {
            let update = worker.tracker.update(&detections, now);
            let captured_at = ctx.wall_clock.at(now);
            buffer.enqueue(update.newly_confirmed.iter().map(|confirmed| {
                to_record(&ctx.stream_id, sequence, confirmed, (width, height), captured_at)
            }));
        }
        buffer.maybe_flush(now, worker.parts.sink.as_mut());

        let counts = worker.tracker.counts().clone();
        *lock_or_recover(&ctx.shared.counts) = counts.clone();
        let score = ctx.engine.total_score(&counts);
        let recommendation = ctx.engine.recommendation_for(score.total).to_string();

        if ctx.config.draw_overlays {
            draw_overlays(&mut frame, &detections, region);
        }

        let update = FrameUpdate {
            stream_id: ctx.stream_id.clone(),
            sequence,
            frame,
            detections,
            counts,
            score,
            recommendation,
            annotated,
        };
        if !ctx.events.send(PipelineEvent::Frame(update)) {
            if let Some(n) = dropped_frames.hit() {
                log::debug!("stream {}: caller behind, dropped {} frames", ctx.stream_id, n);
            }
        }

        if ctx.config.status_every > 0 && sequence % ctx.config.status_every == 0 {
            let total_count = worker.tracker.total_count();
            log::info!(
                "stream {}: {} frames processed, {} vehicles counted",
                ctx.stream_id,
                sequence,
                total_count
            );
            ctx.emit_status(StreamStatus::Progress {
                frames: sequence,
                total_count,
            });
        }

        std::thread::sleep(ctx.config.loop_interval);
    }

    if let Err(err) = buffer.drain(ctx.now(), worker.parts.sink.as_mut()) {
        let err = PipelineError::Persistence(format!("{:#}", err));
        log::error!(
            "stream {}: final flush failed, {} records unsaved: {}",
            ctx.stream_id,
            buffer.len(),
            err
        );
    }
    worker.parts.source.release();
    ctx.shared.set_state(PipelineState::Stopped);
    log::info!("stream {}: stopped after {} frames", ctx.stream_id, sequence);
    ctx.emit_status(StreamStatus::Stopped { frames: sequence });
    let _ = ctx.exit_tx.send(());
    worker
}

/// Run the detector on the region (or the whole frame) and return boxes in
/// source space.
fn detect(
    detector: &mut dyn DetectorBackend,
    frame: &Frame,
    region: Option<Region>,
    config: &PipelineConfig,
) -> Result<Vec<Detection>> {
    match region {
        Some(region) => {
            let crop = frame.crop(region)?;
            let detections =
                detector.infer(&crop, config.detector_size_hint, config.confidence_threshold)?;
            Ok(detections
                .into_iter()
                .map(|d| d.offset_by(region.x as f32, region.y as f32))
                .collect())
        }
        None => detector.infer(frame, config.detector_size_hint, config.confidence_threshold),
    }
}

fn to_record(
    stream_id: &str,
    sequence: u64,
    confirmed: &ConfirmedTrack,
    (width, height): (u32, u32),
    captured_at: u64,
) -> DetectionRecord {
    let det = &confirmed.detection;
    let (w, h) = (width as f32, height as f32);
    DetectionRecord {
        stream_id: stream_id.to_string(),
        track_id: confirmed.track_id,
        frame_number: sequence,
        class_name: det.class_name.trim().to_lowercase(),
        class_id: det.class_id,
        confidence: det.confidence,
        bbox_x: (det.bbox.cx / w).clamp(0.0, 1.0),
        bbox_y: (det.bbox.cy / h).clamp(0.0, 1.0),
        bbox_width: (det.bbox.w / w).clamp(0.0, 1.0),
        bbox_height: (det.bbox.h / h).clamp(0.0, 1.0),
        captured_at,
    }
}

fn draw_overlays(frame: &mut Frame, detections: &[Detection], region: Option<Region>) {
    for det in detections.iter().filter(|d| d.is_well_formed()) {
        frame.draw_centered_box(
            det.bbox.cx,
            det.bbox.cy,
            det.bbox.w,
            det.bbox.h,
            Rgb::for_class(&det.class_name),
        );
    }
    if let Some(region) = region {
        frame.draw_region(region, Rgb::GREEN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn rate_limit_logs_first_then_every_nth() {
        let mut limit = RateLimit::new();
        let logged: Vec<u64> = (0..120).filter_map(|_| limit.hit()).collect();
        assert_eq!(logged, vec![1, 50, 100]);
    }

    #[test]
    fn records_are_normalized_to_source_space() {
        let confirmed = ConfirmedTrack {
            track_id: 7,
            detection: Detection::new(
                BoundingBox {
                    cx: 320.0,
                    cy: 160.0,
                    w: 64.0,
                    h: 32.0,
                },
                "Truck",
                0.6,
            )
            .with_class_id(7),
        };
        let record = to_record("cam", 12, &confirmed, (640, 640), 1_700_000_000);
        assert_eq!(record.class_name, "truck");
        assert_eq!(record.frame_number, 12);
        assert_eq!(record.bbox_x, 0.5);
        assert_eq!(record.bbox_y, 0.25);
        assert_eq!(record.bbox_width, 0.1);
        assert_eq!(record.bbox_height, 0.05);
        assert_eq!(record.captured_at, 1_700_000_000);
    }

    #[test]
    fn wall_clock_follows_the_monotonic_clock() {
        let clock = WallClock {
            unix_secs: 1_000,
            at: Duration::from_secs(5),
        };
        assert_eq!(clock.at(Duration::from_secs(5)), 1_000);
        assert_eq!(clock.at(Duration::from_millis(7_900)), 1_002);
        assert_eq!(clock.at(Duration::from_secs(1)), 1_000);
    }

    #[test]
    fn region_detections_are_shifted_back() -> Result<()> {
        use crate::detect::ScriptedBackend;
        let local = Detection::new(
            BoundingBox {
                cx: 5.0,
                cy: 5.0,
                w: 4.0,
                h: 4.0,
            },
            "car",
            0.9,
        );
        let mut detector = ScriptedBackend::new(vec![vec![local]]);
        let frame = Frame::filled(64, 64, Rgb(0, 0, 0));
        let region = Region::new(10, 20, 30, 30);
        let dets = detect(&mut detector, &frame, region, &PipelineConfig::default())?;
        assert_eq!(dets[0].centroid(), (15.0, 25.0));
        Ok(())
    }
}
