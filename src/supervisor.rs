use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::error::PipelineError;
use crate::events::EventSender;
use crate::pipeline::{PipelineState, StreamPipeline, StreamSpec, StreamStatus};
use crate::roi::Region;
use crate::score::ScoreEngine;

/// Outcome of starting one stream.
#[derive(Debug)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl StartReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns one pipeline per stream and drives them independently.
pub struct Supervisor {
    pipelines: BTreeMap<String, StreamPipeline>,
    /// Streams whose pipeline could not be built, with the reason.
    unavailable: BTreeMap<String, PipelineError>,
    engine: Arc<ScoreEngine>,
}

impl Supervisor {
    pub fn new(engine: Arc<ScoreEngine>) -> Self {
        Self {
            pipelines: BTreeMap::new(),
            unavailable: BTreeMap::new(),
            engine,
        }
    }

    /// Add a pipeline. Stream ids must be unique.
    pub fn add(&mut self, mut pipeline: StreamPipeline) -> Result<()> {
        let id = pipeline.stream_id().to_string();
        self.ensure_new(&id)?;
        pipeline.replace_score_engine(self.engine.clone());
        self.pipelines.insert(id, pipeline);
        Ok(())
    }

    /// Build a stream's pipeline and add it.
    ///
    /// When `build` fails the stream is recorded as unavailable, a
    /// `SourceUnavailable` status goes out on `events` and the call still
    /// succeeds, so one bad stream never keeps the rest from running. Errors
    /// only for a duplicate stream id.
    pub fn add_with<F>(&mut self, spec: &StreamSpec, events: &EventSender, build: F) -> Result<()>
    where
        F: FnOnce() -> Result<StreamPipeline>,
    {
        self.ensure_new(&spec.id)?;
        match build() {
            Ok(pipeline) => self.add(pipeline),
            Err(err) => {
                let reason = format!("{:#}", err);
                log::error!("stream {}: cannot set up {}: {}", spec.id, spec.source, reason);
                events.status(&spec.id, StreamStatus::SourceUnavailable(reason.clone()));
                self.unavailable.insert(
                    spec.id.clone(),
                    PipelineError::SourceUnavailable {
                        source: spec.source.clone(),
                        reason,
                    },
                );
                Ok(())
            }
        }
    }

    fn ensure_new(&self, id: &str) -> Result<()> {
        if self.pipelines.contains_key(id) || self.unavailable.contains_key(id) {
            return Err(anyhow!("stream '{}' is already supervised", id));
        }
        Ok(())
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn pipeline(&self, stream_id: &str) -> Option<&StreamPipeline> {
        self.pipelines.get(stream_id)
    }

    pub fn pipeline_mut(&mut self, stream_id: &str) -> Option<&mut StreamPipeline> {
        self.pipelines.get_mut(stream_id)
    }

    pub fn engine(&self) -> Arc<ScoreEngine> {
        self.engine.clone()
    }

    /// Start every stream. A stream that fails to start is reported and does
    /// not keep the others from starting.
    pub fn start_all(&mut self) -> StartReport {
        let mut report = StartReport {
            started: Vec::new(),
            failed: Vec::new(),
        };
        for (id, err) in &self.unavailable {
            report.failed.push((id.clone(), err.clone().into()));
        }
        for (id, pipeline) in self.pipelines.iter_mut() {
            match pipeline.start() {
                Ok(()) => report.started.push(id.clone()),
                Err(err) => {
                    log::error!("stream {} failed to start: {:#}", id, err);
                    report.failed.push((id.clone(), err));
                }
            }
        }
        report
    }

    pub fn start(&mut self, stream_id: &str) -> Result<()> {
        self.get_mut(stream_id)?.start()
    }

    pub fn stop(&mut self, stream_id: &str) -> Result<()> {
        self.get_mut(stream_id)?.stop()
    }

    /// Stop every stream; returns the first error after trying them all.
    pub fn stop_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (id, pipeline) in self.pipelines.iter_mut() {
            if let Err(err) = pipeline.stop() {
                log::error!("stream {} failed to stop cleanly: {:#}", id, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn set_region(&self, stream_id: &str, region: Option<Region>) -> Result<()> {
        self.pipelines
            .get(stream_id)
            .ok_or_else(|| anyhow!("unknown stream '{}'", stream_id))?
            .set_region(region);
        Ok(())
    }

    /// Install new scoring tables. Each pipeline picks them up at its next start.
    pub fn reload_scoring(&mut self, engine: Arc<ScoreEngine>) {
        for pipeline in self.pipelines.values_mut() {
            pipeline.replace_score_engine(engine.clone());
        }
        self.engine = engine;
        log::info!("scoring configuration reloaded for {} streams", self.pipelines.len());
    }

    pub fn states(&self) -> BTreeMap<String, PipelineState> {
        self.pipelines
            .iter()
            .map(|(id, p)| (id.clone(), p.state()))
            .collect()
    }

    /// Counts summed over every stream.
    pub fn combined_counts(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for pipeline in self.pipelines.values() {
            for (class_name, count) in pipeline.counts() {
                *out.entry(class_name).or_insert(0) += count;
            }
        }
        out
    }

    fn get_mut(&mut self, stream_id: &str) -> Result<&mut StreamPipeline> {
        self.pipelines
            .get_mut(stream_id)
            .ok_or_else(|| anyhow!("unknown stream '{}'", stream_id))
    }
}
