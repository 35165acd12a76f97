use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::BatchSink;
use crate::storage::{DetectionRecord, DetectionStore, StreamInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreWriterConfig {
    /// Batches that may wait in the channel before `submit` fails.
    pub channel_capacity: usize,
    /// Failed batches kept for retry on the writer thread.
    pub max_pending_batches: usize,
    /// How often pending batches are retried while the channel is idle.
    pub retry_interval: Duration,
}

impl Default for StoreWriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            max_pending_batches: 256,
            retry_interval: Duration::from_secs(1),
        }
    }
}

enum Command {
    Register(StreamInfo),
    Batch {
        stream_id: String,
        records: Vec<DetectionRecord>,
    },
    Prune(Duration),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    failed_writes: AtomicU64,
    dropped_batches: AtomicU64,
    pending: AtomicUsize,
}

/// Snapshot of writer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub failed_writes: u64,
    pub dropped_batches: u64,
    pub pending: usize,
}

/// Cloneable submission handle. One per pipeline.
#[derive(Clone)]
pub struct StoreWriterHandle {
    tx: SyncSender<Command>,
    counters: Arc<Counters>,
}

impl StoreWriterHandle {
    fn send(&self, cmd: Command) -> Result<()> {
        match self.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!("store writer queue is full")),
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("store writer has stopped")),
        }
    }

    pub fn register_stream(&self, info: StreamInfo) -> Result<()> {
        self.send(Command::Register(info))
    }

    pub fn prune_older_than(&self, retention: Duration) -> Result<()> {
        self.send(Command::Prune(retention))
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed_writes: self.counters.failed_writes.load(Ordering::Relaxed),
            dropped_batches: self.counters.dropped_batches.load(Ordering::Relaxed),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }
}

impl BatchSink for StoreWriterHandle {
    fn submit(&mut self, stream_id: &str, batch: &[DetectionRecord]) -> Result<()> {
        self.send(Command::Batch {
            stream_id: stream_id.to_string(),
            records: batch.to_vec(),
        })
    }
}

/// Owns a `DetectionStore` on a dedicated thread.
///
/// Writes that fail on the thread are queued and retried in order; the
/// submitting pipeline has already moved on by then.
pub struct StoreWriter<S: DetectionStore + 'static> {
    handle: StoreWriterHandle,
    join: Option<JoinHandle<S>>,
}

impl<S: DetectionStore + 'static> StoreWriter<S> {
    pub fn spawn(store: S, config: StoreWriterConfig) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(config.channel_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let thread_counters = counters.clone();
        let join = std::thread::Builder::new()
            .name("store-writer".to_string())
            .spawn(move || run_writer(store, rx, config, thread_counters))?;
        Ok(Self {
            handle: StoreWriterHandle { tx, counters },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> StoreWriterHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> WriterStats {
        self.handle.stats()
    }

    /// Stop the thread after it has processed everything already queued, and
    /// hand the store back.
    pub fn shutdown(mut self) -> Result<S> {
        // A blocking send: the queue may be full right now.
        self.handle
            .tx
            .send(Command::Shutdown)
            .map_err(|_| anyhow!("store writer has stopped"))?;
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("store writer already shut down"))?;
        join.join().map_err(|_| anyhow!("store writer thread panicked"))
    }
}

struct PendingBatch {
    stream_id: String,
    records: Vec<DetectionRecord>,
}

fn run_writer<S: DetectionStore>(
    mut store: S,
    rx: Receiver<Command>,
    config: StoreWriterConfig,
    counters: Arc<Counters>,
) -> S {
    let mut pending: VecDeque<PendingBatch> = VecDeque::new();
    loop {
        match rx.recv_timeout(config.retry_interval) {
            Ok(Command::Batch { stream_id, records }) => {
                pending.push_back(PendingBatch { stream_id, records });
                while pending.len() > config.max_pending_batches.max(1) {
                    if let Some(dropped) = pending.pop_front() {
                        counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                        log::error!(
                            "store writer dropped {} records for {}: retry queue full",
                            dropped.records.len(),
                            dropped.stream_id
                        );
                    }
                }
                write_pending(&mut store, &mut pending, &counters);
            }
            Ok(Command::Register(info)) => {
                if let Err(err) = store.register_stream(&info) {
                    log::warn!("failed to register stream {}: {}", info.id, err);
                }
            }
            Ok(Command::Prune(retention)) => match store.prune_older_than(retention) {
                Ok(0) => {}
                Ok(removed) => log::info!("retention pruned {} rows", removed),
                Err(err) => log::warn!("retention pruning failed: {}", err),
            },
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !pending.is_empty() {
                    write_pending(&mut store, &mut pending, &counters);
                }
            }
        }
    }

    write_pending(&mut store, &mut pending, &counters);
    if !pending.is_empty() {
        let lost: usize = pending.iter().map(|b| b.records.len()).sum();
        log::error!(
            "store writer stopping with {} unwritten records in {} batches",
            lost,
            pending.len()
        );
    }
    store
}

/// Write queued batches oldest first, stopping at the first failure so order
/// is kept.
fn write_pending<S: DetectionStore>(
    store: &mut S,
    pending: &mut VecDeque<PendingBatch>,
    counters: &Counters,
) {
    while let Some(batch) = pending.front() {
        match store.write_batch(&batch.stream_id, &batch.records) {
            Ok(()) => {
                counters
                    .written
                    .fetch_add(batch.records.len() as u64, Ordering::Relaxed);
                pending.pop_front();
            }
            Err(err) => {
                counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "store write for {} failed ({} batches pending): {}",
                    batch.stream_id,
                    pending.len(),
                    err
                );
                break;
            }
        }
    }
    counters.pending.store(pending.len(), Ordering::Relaxed);
}
