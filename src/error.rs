/// Classified pipeline failure.
///
/// Travels inside `anyhow::Error`; callers that care about the class use
/// `downcast_ref::<PipelineError>()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// The source could not be opened. Fatal for the stream.
    SourceUnavailable { source: String, reason: String },
    /// A frame read failed; the next iteration tries again.
    TransientRead(String),
    /// The detector failed on a frame; the frame passes through unannotated.
    Inference(String),
    /// A batch could not be persisted.
    Persistence(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            PipelineError::TransientRead(_) => "TRANSIENT_READ",
            PipelineError::Inference(_) => "INFERENCE",
            PipelineError::Persistence(_) => "PERSISTENCE",
        }
    }

    /// True when the stream cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::SourceUnavailable { .. })
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::SourceUnavailable { source, reason } => {
                write!(f, "{}: cannot open '{}': {}", self.code(), source, reason)
            }
            PipelineError::TransientRead(reason)
            | PipelineError::Inference(reason)
            | PipelineError::Persistence(reason) => write!(f, "{}: {}", self.code(), reason),
        }
    }
}

impl std::error::Error for PipelineError {}
