use sha2::{Digest, Sha256};

use crate::detect::engine::{EngineError, EngineKind, InferenceEngine};
use crate::detect::preprocess::to_gray;
use crate::detect::result::RecognitionResult;
use crate::frame::FrameView;

/// Frames flatter than this (luma standard deviation) count as an empty stage.
const DEFAULT_MIN_CONTRAST: f32 = 8.0;
const STUB_CLASSIFIER_CONFIDENCE: f32 = 0.9;
const STUB_TEXT_CONFIDENCE: f32 = 0.85;

/// Deterministic engine for `stub://` sources and tests.
///
/// A frame with visible texture is "an item". The item identity is derived from
/// a hash of the coarse brightness bucket, so every frame of a steady scene maps
/// to the same label and the same printed text.
pub struct StubEngine {
    kind: EngineKind,
    outputs: Vec<String>,
    min_contrast: f32,
}

impl StubEngine {
    pub fn classifier(labels: Vec<String>) -> Self {
        Self {
            kind: EngineKind::Classifier,
            outputs: labels,
            min_contrast: DEFAULT_MIN_CONTRAST,
        }
    }

    pub fn text_recognizer(texts: Vec<String>) -> Self {
        Self {
            kind: EngineKind::Text,
            outputs: texts,
            min_contrast: DEFAULT_MIN_CONTRAST,
        }
    }

    pub fn with_min_contrast(mut self, min_contrast: f32) -> Self {
        self.min_contrast = min_contrast;
        self
    }

    fn pick(&self, brightness_bucket: u8) -> Option<&str> {
        if self.outputs.is_empty() {
            return None;
        }
        let digest: [u8; 32] = Sha256::digest([brightness_bucket]).into();
        let idx = digest[0] as usize % self.outputs.len();
        self.outputs.get(idx).map(String::as_str)
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn warm_up(&mut self) -> Result<(), EngineError> {
        if self.outputs.is_empty() {
            return Err(EngineError::ModelUnavailable(format!(
                "stub {} engine has no outputs configured",
                self.kind
            )));
        }
        Ok(())
    }

    fn infer(&mut self, frame: &FrameView<'_>) -> Result<RecognitionResult, EngineError> {
        let gray = to_gray(frame);
        let (mean, std_dev) = mean_and_std(&gray);
        if std_dev < self.min_contrast {
            return Ok(RecognitionResult::NoDetection);
        }

        let bucket = (mean / 32.0).floor().clamp(0.0, 7.0) as u8;
        let Some(output) = self.pick(bucket) else {
            return Ok(RecognitionResult::NoDetection);
        };

        Ok(match self.kind {
            EngineKind::Classifier => {
                RecognitionResult::classification(output, STUB_CLASSIFIER_CONFIDENCE)
            }
            EngineKind::Text => RecognitionResult::text(output, STUB_TEXT_CONFIDENCE),
        })
    }
}

fn mean_and_std(pixels: &[u8]) -> (f32, f32) {
    if pixels.is_empty() {
        return (0.0, 0.0);
    }
    let n = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / n;
    let var = pixels
        .iter()
        .map(|&p| {
            let d = p as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean as f32, var.sqrt() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PixelFormat};

    fn striped(seq: u64, base: u8) -> Frame {
        let pixels = (0..64u32)
            .map(|i| if i % 2 == 0 { base } else { base.saturating_add(40) })
            .collect();
        Frame::new(seq, 8, 8, PixelFormat::Gray8, pixels).unwrap()
    }

    fn labels() -> Vec<String> {
        vec!["tomato".into(), "potato".into(), "onion".into()]
    }

    #[test]
    fn flat_frame_is_no_detection() {
        let mut engine = StubEngine::classifier(labels());
        let frame = Frame::new(1, 8, 8, PixelFormat::Gray8, vec![120; 64]).unwrap();
        let result = engine.infer(&frame.view().unwrap()).unwrap();
        assert_eq!(result, RecognitionResult::NoDetection);
    }

    #[test]
    fn steady_scene_gives_stable_label() {
        let mut engine = StubEngine::classifier(labels());
        let a = engine.infer(&striped(1, 100).view().unwrap()).unwrap();
        let b = engine.infer(&striped(2, 100).view().unwrap()).unwrap();
        assert_eq!(a, b);
        assert!(a.confidence() >= 0.8);
    }

    #[test]
    fn empty_output_list_fails_warm_up() {
        let mut engine = StubEngine::text_recognizer(Vec::new());
        assert!(matches!(
            engine.warm_up(),
            Err(EngineError::ModelUnavailable(_))
        ));
    }
}
