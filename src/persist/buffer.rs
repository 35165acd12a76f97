use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::BatchSink;
use crate::storage::DetectionRecord;

pub const DEFAULT_FLUSH_SIZE: usize = 20;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_BUFFERED: usize = 10_000;

/// What happens to a batch the sink refused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep the records queued and retry at the next flush opportunity.
    #[default]
    Retain,
    /// Discard the batch after logging it.
    Drop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    pub size_threshold: usize,
    pub time_threshold: Duration,
    pub on_failure: FailurePolicy,
    /// Upper bound on retained records; the oldest are dropped past it.
    pub max_buffered: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size_threshold: DEFAULT_FLUSH_SIZE,
            time_threshold: DEFAULT_FLUSH_INTERVAL,
            on_failure: FailurePolicy::Retain,
            max_buffered: DEFAULT_MAX_BUFFERED,
        }
    }
}

/// Per-stream record buffer with size/time flushing.
///
/// Clock readings are monotonic offsets supplied by the caller, the same ones
/// the tracker sees.
pub struct PersistenceBuffer {
    stream_id: String,
    config: BufferConfig,
    records: Vec<DetectionRecord>,
    last_flush: Duration,
    flushed: u64,
    dropped: u64,
    failures: u64,
}

impl PersistenceBuffer {
    pub fn new(stream_id: impl Into<String>, config: BufferConfig, now: Duration) -> Self {
        Self {
            stream_id: stream_id.into(),
            config,
            records: Vec::new(),
            last_flush: now,
            flushed: 0,
            dropped: 0,
            failures: 0,
        }
    }

    pub fn enqueue<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = DetectionRecord>,
    {
        self.records.extend(records);
        let max = self.config.max_buffered.max(1);
        if self.records.len() > max {
            let excess = self.records.len() - max;
            self.records.drain(..excess);
            self.dropped += excess as u64;
            log::warn!(
                "persistence buffer for {} over capacity, dropped {} oldest records",
                self.stream_id,
                excess
            );
        }
    }

    fn due(&self, now: Duration) -> bool {
        if self.records.is_empty() {
            return false;
        }
        self.records.len() >= self.config.size_threshold
            || now.saturating_sub(self.last_flush) >= self.config.time_threshold
    }

    /// Flush if the size or time threshold is reached. Returns true when a
    /// batch was accepted by the sink.
    pub fn maybe_flush(&mut self, now: Duration, sink: &mut dyn BatchSink) -> bool {
        if !self.due(now) {
            return false;
        }
        self.flush(now, sink).is_ok()
    }

    /// Hand everything to the sink regardless of thresholds. Used on shutdown.
    pub fn drain(&mut self, now: Duration, sink: &mut dyn BatchSink) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        self.flush(now, sink)
    }

    fn flush(&mut self, now: Duration, sink: &mut dyn BatchSink) -> Result<()> {
        self.last_flush = now;
        match sink.submit(&self.stream_id, &self.records) {
            Ok(()) => {
                log::debug!(
                    "flushed {} records for {}",
                    self.records.len(),
                    self.stream_id
                );
                self.flushed += self.records.len() as u64;
                self.records.clear();
                Ok(())
            }
            Err(err) => {
                self.failures += 1;
                match self.config.on_failure {
                    FailurePolicy::Retain => {
                        log::warn!(
                            "flush of {} records for {} failed, will retry: {}",
                            self.records.len(),
                            self.stream_id,
                            err
                        );
                    }
                    FailurePolicy::Drop => {
                        log::error!(
                            "flush of {} records for {} failed, batch discarded: {}",
                            self.records.len(),
                            self.stream_id,
                            err
                        );
                        self.dropped += self.records.len() as u64;
                        self.records.clear();
                    }
                }
                Err(err)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DetectionStore, InMemoryDetectionStore};

    fn record(track_id: u64) -> DetectionRecord {
        DetectionRecord {
            stream_id: "cam".to_string(),
            track_id,
            frame_number: track_id,
            class_name: "car".to_string(),
            class_id: None,
            confidence: 0.9,
            bbox_x: 0.5,
            bbox_y: 0.5,
            bbox_width: 0.1,
            bbox_height: 0.1,
            captured_at: 1_700_000_000,
        }
    }

    fn config(on_failure: FailurePolicy) -> BufferConfig {
        BufferConfig {
            size_threshold: 3,
            time_threshold: Duration::from_secs(5),
            on_failure,
            max_buffered: 100,
        }
    }

    #[test]
    fn flushes_on_size() {
        let mut store = InMemoryDetectionStore::new();
        let mut buffer = PersistenceBuffer::new("cam", config(FailurePolicy::Retain), Duration::ZERO);
        buffer.enqueue([record(1), record(2)]);
        assert!(!buffer.maybe_flush(Duration::from_secs(1), &mut store));
        buffer.enqueue([record(3)]);
        assert!(buffer.maybe_flush(Duration::from_secs(1), &mut store));
        assert!(buffer.is_empty());
        assert_eq!(store.detections().len(), 3);
    }

    #[test]
    fn flushes_on_time() {
        let mut store = InMemoryDetectionStore::new();
        let mut buffer = PersistenceBuffer::new("cam", config(FailurePolicy::Retain), Duration::ZERO);
        buffer.enqueue([record(1)]);
        assert!(!buffer.maybe_flush(Duration::from_millis(4_999), &mut store));
        assert!(buffer.maybe_flush(Duration::from_secs(5), &mut store));
        assert_eq!(buffer.flushed(), 1);
    }

    #[test]
    fn empty_buffer_never_flushes() {
        let mut store = InMemoryDetectionStore::new();
        let mut buffer = PersistenceBuffer::new("cam", config(FailurePolicy::Retain), Duration::ZERO);
        assert!(!buffer.maybe_flush(Duration::from_secs(60), &mut store));
    }

    #[test]
    fn retain_policy_retries_same_records() -> Result<()> {
        let mut store = InMemoryDetectionStore::new();
        store.fail_next_writes(1);
        let mut buffer = PersistenceBuffer::new("cam", config(FailurePolicy::Retain), Duration::ZERO);
        buffer.enqueue([record(1), record(2), record(3)]);

        assert!(!buffer.maybe_flush(Duration::from_secs(1), &mut store));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.failures(), 1);

        assert!(buffer.maybe_flush(Duration::from_secs(2), &mut store));
        let ids: Vec<u64> = store.records(Some("cam"), None, 10)?.iter().map(|r| r.track_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn drop_policy_discards_failed_batch() {
        let mut store = InMemoryDetectionStore::new();
        store.fail_next_writes(1);
        let mut buffer = PersistenceBuffer::new("cam", config(FailurePolicy::Drop), Duration::ZERO);
        buffer.enqueue([record(1), record(2), record(3)]);
        assert!(!buffer.maybe_flush(Duration::from_secs(1), &mut store));
        assert!(buffer.is_empty());
        assert_eq!(buffer.dropped(), 3);
        assert!(store.detections().is_empty());
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut buffer = PersistenceBuffer::new(
            "cam",
            BufferConfig {
                max_buffered: 2,
                ..config(FailurePolicy::Retain)
            },
            Duration::ZERO,
        );
        buffer.enqueue([record(1), record(2), record(3)]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn drain_ignores_thresholds() -> Result<()> {
        let mut store = InMemoryDetectionStore::new();
        let mut buffer = PersistenceBuffer::new("cam", config(FailurePolicy::Retain), Duration::ZERO);
        buffer.enqueue([record(1)]);
        buffer.drain(Duration::from_millis(1), &mut store)?;
        assert_eq!(store.detections().len(), 1);
        Ok(())
    }
}
