use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::engine::{EngineError, EngineKind, InferenceEngine};
use crate::detect::result::RecognitionResult;
use crate::frame::FrameView;

const CANCEL_POLL: Duration = Duration::from_millis(2);

/// Engine that replays results keyed by frame sequence number.
///
/// Used for replaying recorded sessions and for driving the pipeline in tests.
/// Latency is simulated with a sleep that stops early when the frame is released.
pub struct ScriptedEngine {
    kind: EngineKind,
    script: HashMap<u64, Result<RecognitionResult, EngineError>>,
    fallback: RecognitionResult,
    latency: Duration,
    latency_overrides: HashMap<u64, Duration>,
    warm_up_error: Option<EngineError>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            script: HashMap::new(),
            fallback: RecognitionResult::NoDetection,
            latency: Duration::ZERO,
            latency_overrides: HashMap::new(),
            warm_up_error: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_result(mut self, seq: u64, result: RecognitionResult) -> Self {
        self.script.insert(seq, Ok(result));
        self
    }

    pub fn with_error(mut self, seq: u64, error: EngineError) -> Self {
        self.script.insert(seq, Err(error));
        self
    }

    /// Result for sequence numbers without a scripted entry.
    pub fn with_fallback(mut self, result: RecognitionResult) -> Self {
        self.fallback = result;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_latency_for(mut self, seq: u64, latency: Duration) -> Self {
        self.latency_overrides.insert(seq, latency);
        self
    }

    pub fn failing_warm_up(mut self, reason: impl Into<String>) -> Self {
        self.warm_up_error = Some(EngineError::ModelUnavailable(reason.into()));
        self
    }

    /// Shared counter of `infer` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn simulate_latency(&self, frame: &FrameView<'_>) -> Result<(), EngineError> {
        let latency = self
            .latency_overrides
            .get(&frame.seq())
            .copied()
            .unwrap_or(self.latency);
        if latency.is_zero() {
            return Ok(());
        }
        let deadline = Instant::now() + latency;
        while Instant::now() < deadline {
            if frame.is_released() {
                return Err(EngineError::InvalidFrame);
            }
            std::thread::sleep(CANCEL_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn warm_up(&mut self) -> Result<(), EngineError> {
        match &self.warm_up_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn infer(&mut self, frame: &FrameView<'_>) -> Result<RecognitionResult, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.warm_up_error {
            return Err(err.clone());
        }
        self.simulate_latency(frame)?;
        match self.script.get(&frame.seq()) {
            Some(result) => result.clone(),
            None => Ok(self.fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PixelFormat};

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, 2, 2, PixelFormat::Gray8, vec![0; 4]).unwrap()
    }

    #[test]
    fn replays_scripted_results_and_fallback() {
        let mut engine = ScriptedEngine::new(EngineKind::Classifier)
            .with_result(1, RecognitionResult::classification("tomato", 0.9))
            .with_error(2, EngineError::InferenceTimeout);
        let calls = engine.calls();

        let f1 = frame(1);
        let f2 = frame(2);
        let f3 = frame(3);
        assert_eq!(
            engine.infer(&f1.view().unwrap()).unwrap(),
            RecognitionResult::classification("tomato", 0.9)
        );
        assert_eq!(
            engine.infer(&f2.view().unwrap()),
            Err(EngineError::InferenceTimeout)
        );
        assert_eq!(
            engine.infer(&f3.view().unwrap()).unwrap(),
            RecognitionResult::NoDetection
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failing_warm_up_reports_model_unavailable() {
        let mut engine = ScriptedEngine::new(EngineKind::Text).failing_warm_up("missing weights");
        assert_eq!(
            engine.warm_up(),
            Err(EngineError::ModelUnavailable("missing weights".into()))
        );
    }

    #[test]
    fn latency_aborts_when_frame_released() {
        let mut engine =
            ScriptedEngine::new(EngineKind::Text).with_latency(Duration::from_millis(200));
        let f = frame(5);
        let view = f.view().unwrap();
        f.release();
        let started = Instant::now();
        assert_eq!(engine.infer(&view), Err(EngineError::InvalidFrame));
        assert!(started.elapsed() < Duration::from_millis(150));
    }
}
