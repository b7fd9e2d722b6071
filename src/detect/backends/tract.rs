#![cfg(feature = "backend-tract")]

//! Tract-based ONNX engines.
//!
//! Both engines load a local model file once at warm-up and run on CPU. They do
//! not perform network I/O and never write frames to disk.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::engine::{EngineError, EngineKind, InferenceEngine};
use crate::detect::preprocess::{resize_bilinear, softmax, to_gray, to_planar_unit, to_rgb, top_k};
use crate::detect::result::RecognitionResult;
use crate::frame::FrameView;
use crate::text;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

fn load_plan(model_path: &Path, channels: usize, width: u32, height: u32) -> Result<Plan> {
    tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, channels, height as usize, width as usize),
            ),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

fn build_input(view: &FrameView<'_>, channels: usize, width: u32, height: u32) -> Result<Tensor> {
    let packed = if channels == 1 {
        to_gray(view)
    } else {
        to_rgb(view)
    };
    let resized = resize_bilinear(&packed, view.width(), view.height(), channels, width, height)?;
    let planar = to_planar_unit(&resized, width, height, channels);
    let input = tract_ndarray::Array4::from_shape_vec(
        (1, channels, height as usize, width as usize),
        planar,
    )
    .map_err(|e| anyhow!("input tensor shape: {}", e))?;
    Ok(input.into_tensor())
}

fn unavailable(err: anyhow::Error) -> EngineError {
    EngineError::ModelUnavailable(format!("{:#}", err))
}

// ----------------------------------------------------------------------------
// Classifier
// ----------------------------------------------------------------------------

/// Image classifier over a `1x3xHxW` RGB input and a single score vector output.
pub struct TractClassifier {
    model_path: PathBuf,
    labels: Vec<String>,
    width: u32,
    height: u32,
    top_k: usize,
    plan: Option<Plan>,
}

impl TractClassifier {
    pub fn new<P: AsRef<Path>>(model_path: P, labels: Vec<String>, width: u32, height: u32) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            labels,
            width,
            height,
            top_k: 3,
            plan: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    fn classify(&self, plan: &Plan, view: &FrameView<'_>) -> Result<RecognitionResult> {
        let input = build_input(view, 3, self.width, self.height)?;
        let outputs = plan.run(tvec!(input.into())).context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let logits: Vec<f32> = scores.iter().cloned().collect();
        let probs = softmax(&logits);
        let best = top_k(&probs, &self.labels, self.top_k);
        let Some((label, confidence)) = best.first().cloned() else {
            return Ok(RecognitionResult::NoDetection);
        };
        Ok(RecognitionResult::Classification {
            label,
            confidence,
            top_k: best,
        })
    }
}

impl InferenceEngine for TractClassifier {
    fn name(&self) -> &'static str {
        "tract-classifier"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Classifier
    }

    fn warm_up(&mut self) -> Result<(), EngineError> {
        if self.plan.is_none() {
            let plan = load_plan(&self.model_path, 3, self.width, self.height).map_err(unavailable)?;
            self.plan = Some(plan);
        }
        Ok(())
    }

    fn infer(&mut self, frame: &FrameView<'_>) -> Result<RecognitionResult, EngineError> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| EngineError::ModelUnavailable("classifier not warmed up".into()))?;
        match self.classify(plan, frame) {
            Ok(result) => Ok(result),
            Err(err) => {
                log::debug!("classifier failed on frame {}: {:#}", frame.seq(), err);
                Ok(RecognitionResult::NoDetection)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Text recognizer
// ----------------------------------------------------------------------------

/// CRNN-style line recognizer: `1x1xHxW` grayscale in, `T x C` scores out,
/// greedy CTC decoding. Charset index 0 is the CTC blank.
pub struct TractTextRecognizer {
    model_path: PathBuf,
    charset: Vec<char>,
    width: u32,
    height: u32,
    plan: Option<Plan>,
}

impl TractTextRecognizer {
    /// `charset` lists the non-blank symbols in model output order (indices 1..).
    pub fn new<P: AsRef<Path>>(model_path: P, charset: &str, width: u32, height: u32) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            charset: charset.chars().collect(),
            width,
            height,
            plan: None,
        }
    }

    fn recognize(&self, plan: &Plan, view: &FrameView<'_>) -> Result<RecognitionResult> {
        let input = build_input(view, 1, self.width, self.height)?;
        let outputs = plan.run(tvec!(input.into())).context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;

        let classes = self.charset.len() + 1;
        let flat: Vec<f32> = scores.iter().cloned().collect();
        if flat.is_empty() || flat.len() % classes != 0 {
            return Err(anyhow!(
                "recognizer output of {} values is not a multiple of {} classes",
                flat.len(),
                classes
            ));
        }

        let steps: Vec<Vec<f32>> = flat.chunks_exact(classes).map(softmax).collect();
        let (raw, confidence) = ctc_greedy_decode(&steps, &self.charset);
        let prepared = text::prepare(&raw);
        if prepared.is_empty() {
            return Ok(RecognitionResult::NoDetection);
        }
        Ok(RecognitionResult::text(prepared, confidence))
    }
}

impl InferenceEngine for TractTextRecognizer {
    fn name(&self) -> &'static str {
        "tract-text"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Text
    }

    fn warm_up(&mut self) -> Result<(), EngineError> {
        if self.charset.is_empty() {
            return Err(EngineError::ModelUnavailable(
                "text recognizer charset is empty".into(),
            ));
        }
        if self.plan.is_none() {
            let plan = load_plan(&self.model_path, 1, self.width, self.height).map_err(unavailable)?;
            self.plan = Some(plan);
        }
        Ok(())
    }

    fn infer(&mut self, frame: &FrameView<'_>) -> Result<RecognitionResult, EngineError> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| EngineError::ModelUnavailable("text recognizer not warmed up".into()))?;
        match self.recognize(plan, frame) {
            Ok(result) => Ok(result),
            Err(err) => {
                log::debug!("text recognizer failed on frame {}: {:#}", frame.seq(), err);
                Ok(RecognitionResult::NoDetection)
            }
        }
    }
}

/// Collapse repeats, drop blanks. Confidence is the mean max-probability of the
/// emitted characters.
fn ctc_greedy_decode(steps: &[Vec<f32>], charset: &[char]) -> (String, f32) {
    let mut out = String::new();
    let mut prob_sum = 0f32;
    let mut emitted = 0usize;
    let mut prev = 0usize;

    for step in steps {
        let (best, p) = step
            .iter()
            .cloned()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc });
        if best != 0 && best != prev {
            if let Some(ch) = charset.get(best - 1) {
                out.push(*ch);
                prob_sum += p;
                emitted += 1;
            }
        }
        prev = best;
    }

    let confidence = if emitted == 0 {
        0.0
    } else {
        prob_sum / emitted as f32
    };
    (out, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(idx: usize, classes: usize) -> Vec<f32> {
        let mut v = vec![0.0; classes];
        v[idx] = 1.0;
        v
    }

    #[test]
    fn ctc_decode_collapses_repeats_and_blanks() {
        let charset: Vec<char> = "abc".chars().collect();
        let steps = vec![
            one_hot(1, 4),
            one_hot(1, 4),
            one_hot(0, 4),
            one_hot(1, 4),
            one_hot(3, 4),
        ];
        let (text, confidence) = ctc_greedy_decode(&steps, &charset);
        assert_eq!(text, "aac");
        assert!((confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn missing_model_is_unavailable() {
        let mut engine = TractClassifier::new("/nonexistent/model.onnx", vec![], 32, 32);
        assert!(matches!(
            engine.warm_up(),
            Err(EngineError::ModelUnavailable(_))
        ));
    }
}
