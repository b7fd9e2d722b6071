/// Per-frame output of one engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RecognitionResult {
    Text {
        text: String,
        confidence: f32,
    },
    Classification {
        label: String,
        confidence: f32,
        /// Best candidates, highest confidence first.
        top_k: Vec<(String, f32)>,
    },
    #[default]
    NoDetection,
}

impl RecognitionResult {
    pub fn text(text: impl Into<String>, confidence: f32) -> Self {
        RecognitionResult::Text {
            text: text.into(),
            confidence,
        }
    }

    /// Classification whose `top_k` holds only the primary label.
    pub fn classification(label: impl Into<String>, confidence: f32) -> Self {
        let label = label.into();
        RecognitionResult::Classification {
            top_k: vec![(label.clone(), confidence)],
            label,
            confidence,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            RecognitionResult::Text { confidence, .. }
            | RecognitionResult::Classification { confidence, .. } => *confidence,
            RecognitionResult::NoDetection => 0.0,
        }
    }

    pub fn is_detection(&self) -> bool {
        !matches!(self, RecognitionResult::NoDetection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_detection_has_zero_confidence() {
        assert_eq!(RecognitionResult::NoDetection.confidence(), 0.0);
        assert!(!RecognitionResult::default().is_detection());
    }

    #[test]
    fn classification_helper_seeds_top_k() {
        let result = RecognitionResult::classification("tomato", 0.9);
        match result {
            RecognitionResult::Classification { label, top_k, .. } => {
                assert_eq!(label, "tomato");
                assert_eq!(top_k, vec![("tomato".to_string(), 0.9)]);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
