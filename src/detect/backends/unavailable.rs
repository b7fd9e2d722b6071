use crate::detect::engine::{EngineError, EngineKind, InferenceEngine};
use crate::detect::result::RecognitionResult;
use crate::frame::FrameView;

/// Placeholder for an engine whose model could not be loaded.
///
/// Keeps the engine pair fixed: the controller sees `ModelUnavailable` at
/// warm-up and runs in degraded mode instead of fabricating results.
pub struct UnavailableEngine {
    kind: EngineKind,
    reason: String,
}

impl UnavailableEngine {
    pub fn new(kind: EngineKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl InferenceEngine for UnavailableEngine {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn warm_up(&mut self) -> Result<(), EngineError> {
        Err(EngineError::ModelUnavailable(self.reason.clone()))
    }

    fn infer(&mut self, _frame: &FrameView<'_>) -> Result<RecognitionResult, EngineError> {
        Err(EngineError::ModelUnavailable(self.reason.clone()))
    }
}
