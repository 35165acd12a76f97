pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{ScriptStep, ScriptedBackend, StubBackend, SYNTHETIC_PALETTE};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
