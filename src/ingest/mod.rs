//! Frame ingestion sources.
//!
//! This module provides the `FrameSource` collaborator and its adapters:
//! - Synthetic traffic (`stub://name`), deterministic, for tests and demos
//! - Local files and network streams through FFmpeg (feature: ingest-ffmpeg)
//!
//! Sources hand out owned RGB24 `Frame`s. End of stream is an explicit
//! outcome, not an error, so the pipeline can loop file playback.

#[cfg(feature = "ingest-ffmpeg")]
pub(crate) mod ffmpeg;
pub mod synthetic;

use anyhow::Result;

use crate::frame::Frame;

pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Result of one `read` call.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    EndOfStream,
}

/// Counters reported by every source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_read: u64,
    pub rewinds: u64,
    pub identifier: String,
}

/// Video frame source.
///
/// `read` errors are transient from the pipeline's point of view; only a
/// failing `open` is fatal for a stream.
pub trait FrameSource: Send {
    /// Open the source. `source_id` is an opaque locator (path, URL, device).
    fn open(&mut self, source_id: &str) -> Result<()>;

    /// Read the next frame.
    fn read(&mut self) -> Result<ReadOutcome>;

    /// Seek back to the first frame (file playback loop).
    fn rewind(&mut self) -> Result<()>;

    /// Release decoder resources. Safe to call more than once.
    fn release(&mut self);

    fn stats(&self) -> SourceStats;
}

/// Build an unopened source suitable for `identifier`.
pub fn source_for(identifier: &str) -> Result<Box<dyn FrameSource>> {
    if identifier.trim().is_empty() {
        anyhow::bail!("source identifier must not be empty");
    }
    if identifier.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig::default())));
    }
    #[cfg(feature = "ingest-ffmpeg")]
    {
        Ok(Box::new(ffmpeg::FfmpegSource::new()))
    }
    #[cfg(not(feature = "ingest-ffmpeg"))]
    {
        anyhow::bail!(
            "source '{}' requires the ingest-ffmpeg feature",
            identifier
        )
    }
}
