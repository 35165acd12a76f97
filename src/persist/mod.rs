//! Persistence of confirmed detections.
//!
//! `PersistenceBuffer` batches records per stream and decides when to flush.
//! A `BatchSink` receives the batches: any `DetectionStore` writes them
//! synchronously, while a `StoreWriterHandle` hands them to the `StoreWriter`
//! thread so a slow database never stalls frame processing.

mod buffer;
mod writer;

use anyhow::Result;

use crate::storage::{DetectionRecord, DetectionStore};

pub use buffer::{BufferConfig, FailurePolicy, PersistenceBuffer};
pub use writer::{StoreWriter, StoreWriterConfig, StoreWriterHandle, WriterStats};

/// Destination for flushed batches.
pub trait BatchSink {
    /// Accept a whole batch or fail; partial acceptance is not a thing.
    fn submit(&mut self, stream_id: &str, batch: &[DetectionRecord]) -> Result<()>;
}

impl<S: DetectionStore + ?Sized> BatchSink for S {
    fn submit(&mut self, stream_id: &str, batch: &[DetectionRecord]) -> Result<()> {
        self.write_batch(stream_id, batch)
    }
}
