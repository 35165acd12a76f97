use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::{Frame, Rgb};

/// Vehicle paint used by the synthetic source; the stub backend looks for it.
pub const SYNTHETIC_PALETTE: &[(Rgb, &str, u32)] = &[
    (Rgb(220, 40, 40), "car", 2),
    (Rgb(40, 40, 220), "truck", 7),
    (Rgb(230, 200, 30), "bus", 5),
];

const MIN_COMPONENT_PIXELS: usize = 16;

/// Stub backend for synthetic footage.
///
/// Finds connected blobs painted in one of the `SYNTHETIC_PALETTE` colors and
/// reports each blob as a detection of the matching class. Paired with a
/// `stub://` source this gives a deterministic end-to-end run with no model.
pub struct StubBackend {
    confidence: f32,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { confidence: 0.9 }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn infer(
        &mut self,
        frame: &Frame,
        _size_hint: u32,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        if self.confidence < confidence_threshold {
            return Ok(Vec::new());
        }
        let width = frame.width as usize;
        let height = frame.height as usize;
        let mut visited = vec![false; width * height];
        let mut out = Vec::new();

        for start in 0..width * height {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let (x, y) = ((start % width) as u32, (start / width) as u32);
            let Some(color) = frame.pixel(x, y) else {
                continue;
            };
            let Some(&(_, class_name, class_id)) =
                SYNTHETIC_PALETTE.iter().find(|(c, _, _)| *c == color)
            else {
                continue;
            };

            let (min_x, min_y, max_x, max_y, count) =
                flood_fill(frame, &mut visited, start, color);
            if count < MIN_COMPONENT_PIXELS {
                continue;
            }
            let bbox = BoundingBox::from_corners(
                min_x as f32,
                min_y as f32,
                (max_x + 1) as f32,
                (max_y + 1) as f32,
            );
            out.push(Detection::new(bbox, class_name, self.confidence).with_class_id(class_id));
        }

        Ok(out)
    }
}

fn flood_fill(
    frame: &Frame,
    visited: &mut [bool],
    start: usize,
    color: Rgb,
) -> (usize, usize, usize, usize, usize) {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let mut stack = vec![start];
    let (mut min_x, mut min_y) = (start % width, start / width);
    let (mut max_x, mut max_y) = (min_x, min_y);
    let mut count = 0usize;

    while let Some(idx) = stack.pop() {
        let (x, y) = (idx % width, idx / width);
        count += 1;
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);

        let mut visit = |nx: usize, ny: usize| {
            let n = ny * width + nx;
            if !visited[n] && frame.pixel(nx as u32, ny as u32) == Some(color) {
                visited[n] = true;
                stack.push(n);
            }
        };
        if x > 0 {
            visit(x - 1, y);
        }
        if x + 1 < width {
            visit(x + 1, y);
        }
        if y > 0 {
            visit(x, y - 1);
        }
        if y + 1 < height {
            visit(x, y + 1);
        }
    }

    (min_x, min_y, max_x, max_y, count)
}

/// One scripted inference outcome.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Detections(Vec<Detection>),
    Fail(String),
}

/// Replays a fixed sequence of outcomes, one per `infer` call, then returns
/// empty results. Used to drive the pipeline deterministically in tests and
/// replays.
pub struct ScriptedBackend {
    steps: VecDeque<ScriptStep>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(frames: Vec<Vec<Detection>>) -> Self {
        Self::from_steps(frames.into_iter().map(ScriptStep::Detections).collect())
    }

    pub fn from_steps(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into(),
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn infer(
        &mut self,
        _frame: &Frame,
        _size_hint: u32,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        self.calls += 1;
        match self.steps.pop_front() {
            Some(ScriptStep::Detections(dets)) => Ok(dets
                .into_iter()
                .filter(|d| d.confidence >= confidence_threshold)
                .collect()),
            Some(ScriptStep::Fail(reason)) => Err(anyhow!(reason)),
            None => Ok(Vec::new()),
        }
    }
}
