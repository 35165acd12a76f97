use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detection capabilities supported by backends.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    ObjectDetection,
    Classification,
}

/// Detector backend trait.
///
/// The pipeline treats a backend as stateless across calls: any caching is
/// the backend's own business. Errors are per-frame and never fatal to a
/// stream; the pipeline passes the frame through unannotated.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a frame (or a crop of one).
    ///
    /// `size_hint` is the square input edge the model was exported for.
    /// Returned boxes are in `frame` pixel coordinates.
    fn infer(
        &mut self,
        frame: &Frame,
        size_hint: u32,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        (**self).supports(capability)
    }

    fn infer(
        &mut self,
        frame: &Frame,
        size_hint: u32,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        (**self).infer(frame, size_hint, confidence_threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
