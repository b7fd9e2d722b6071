pub mod scripted;
pub mod stub;
pub mod unavailable;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::ScriptedEngine;
pub use stub::StubEngine;
pub use unavailable::UnavailableEngine;

#[cfg(feature = "backend-tract")]
pub use tract::{TractClassifier, TractTextRecognizer};
