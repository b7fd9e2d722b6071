//! Inference engines.
//!
//! Both engines of the pipeline (text recognizer, item classifier) implement
//! `InferenceEngine`. The controller holds them as a fixed pair.

mod engine;
pub mod backends;
pub mod preprocess;
mod result;

pub use backends::{ScriptedEngine, StubEngine, UnavailableEngine};
#[cfg(feature = "backend-tract")]
pub use backends::{TractClassifier, TractTextRecognizer};
pub use engine::{EngineError, EngineKind, InferenceEngine};
pub use result::RecognitionResult;
