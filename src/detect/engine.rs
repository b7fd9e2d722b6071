use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::result::RecognitionResult;
use crate::frame::FrameView;

/// Which slot of the engine pair an engine fills.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Text,
    Classifier,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Text => "text",
            EngineKind::Classifier => "classifier",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    /// The model could not be loaded or became unusable. Fatal to the engine.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    /// The call did not finish within its budget. Treated as no detection.
    #[error("inference timed out")]
    InferenceTimeout,
    /// The frame was released before inference completed. The frame is skipped.
    #[error("frame released before inference completed")]
    InvalidFrame,
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::ModelUnavailable(_))
    }
}

/// Inference engine trait.
///
/// Implementations hide model-specific preprocessing behind `infer`. They run on
/// a dedicated worker thread, so `infer` may block on model compute; the frame
/// is read-only and may be read concurrently by the other engine.
pub trait InferenceEngine: Send {
    /// Engine identifier for logs.
    fn name(&self) -> &'static str;

    fn kind(&self) -> EngineKind;

    /// Load weights / allocate buffers. `ModelUnavailable` here puts the pipeline
    /// into degraded mode before the first frame.
    fn warm_up(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Run inference on one frame.
    fn infer(&mut self, frame: &FrameView<'_>) -> Result<RecognitionResult, EngineError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn kind(&self) -> EngineKind {
        (**self).kind()
    }

    fn warm_up(&mut self) -> Result<(), EngineError> {
        (**self).warm_up()
    }

    fn infer(&mut self, frame: &FrameView<'_>) -> Result<RecognitionResult, EngineError> {
        (**self).infer(frame)
    }
}
