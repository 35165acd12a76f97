mod backend;
mod backends;
mod labels;
mod registry;
mod result;

pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::{ScriptStep, ScriptedBackend, StubBackend, SYNTHETIC_PALETTE};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use labels::{coco_class_names, COCO_CLASSES};
pub use registry::{builtin_registry, BackendRegistry};
pub use result::{BoundingBox, Detection};
