#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::{Frame, CHANNELS};

const IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 100;

/// Tract-based backend for YOLOv8-style ONNX exports.
///
/// Expects a single `[1, 4 + classes, anchors]` output with center-format
/// boxes in input pixels followed by per-class scores. Suppression is
/// class-agnostic.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    class_names: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, class_names: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            class_names,
        })
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let side = self.input_size;
        let resized = frame.clone().resized(side, side)?;
        let pixels = resized.pixels();
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            let idx = (y * side + x) * CHANNELS + channel;
            pixels[idx] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let rows = shape[1];
        let anchors = shape[2];
        let sx = frame.width as f32 / self.input_size as f32;
        let sy = frame.height as f32 / self.input_size as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in 4..rows {
                let score = view[[0, c, a]];
                if score > best.1 {
                    best = (c - 4, score);
                }
            }
            if best.1 < confidence_threshold {
                continue;
            }
            let bbox = BoundingBox {
                cx: view[[0, 0, a]] * sx,
                cy: view[[0, 1, a]] * sy,
                w: view[[0, 2, a]] * sx,
                h: view[[0, 3, a]] * sy,
            };
            candidates.push(
                Detection::new(bbox, self.class_name(best.0), best.1).with_class_id(best.0 as u32),
            );
        }

        Ok(non_max_suppression(candidates))
    }
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ax1 = a.cx - a.w / 2.0;
    let ay1 = a.cy - a.h / 2.0;
    let bx1 = b.cx - b.w / 2.0;
    let by1 = b.cy - b.h / 2.0;
    let ix = ((ax1 + a.w).min(bx1 + b.w) - ax1.max(bx1)).max(0.0);
    let iy = ((ay1 + a.h).min(by1 + b.h) - ay1.max(by1)).max(0.0);
    let inter = ix * iy;
    let union = a.w * a.h + b.w * b.h - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn non_max_suppression(mut candidates: Vec<Detection>) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for cand in candidates {
        if kept.len() >= MAX_DETECTIONS {
            break;
        }
        if kept.iter().all(|k| iou(&k.bbox, &cand.bbox) < IOU_THRESHOLD) {
            kept.push(cand);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
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
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame, confidence_threshold)
    }
}
