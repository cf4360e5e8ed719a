//! Object detection capability used by the enricher.

use std::time::Duration;
use thiserror::Error;

/// Why the detector produced nothing for one image.
///
/// Always local to that image: the enrichment pass records it and moves on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionFailure {
    #[error("Image could not be decoded: {0}")]
    Decode(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Detection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Detection task aborted: {0}")]
    Aborted(String),
}

/// One (class, confidence) pair as reported by a detector
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class: String,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(class: impl Into<String>, confidence: f32) -> Self {
        Self {
            class: class.into(),
            confidence,
        }
    }
}

/// Image classification capability.
///
/// Implementations must be deterministic for a fixed model version and free
/// of side effects. Calls are blocking; the enricher runs them on the
/// blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait Detector: Send + Sync {
    fn detect(&self, image: &[u8]) -> Result<Vec<RawDetection>, DetectionFailure>;

    /// Identifier of the model recorded alongside every enrichment
    fn model_version(&self) -> String;
}

/// Bring raw detector output in line with the detection row invariants.
///
/// Confidences above 1 are clamped; zero, negative and NaN scores are
/// dropped, as are blank labels.
pub fn sanitize_detections(raw: Vec<RawDetection>) -> Vec<RawDetection> {
    raw.into_iter()
        .filter_map(|detection| {
            let class = detection.class.trim();
            if class.is_empty() || detection.confidence.is_nan() || detection.confidence <= 0.0 {
                return None;
            }
            Some(RawDetection {
                class: class.to_string(),
                confidence: detection.confidence.min(1.0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_and_drops() {
        let cleaned = sanitize_detections(vec![
            RawDetection::new("syringe", 0.9),
            RawDetection::new("pill", 1.3),
            RawDetection::new("bottle", 0.0),
            RawDetection::new("cream", -0.2),
            RawDetection::new("mask", f32::NAN),
            RawDetection::new("  ", 0.5),
            RawDetection::new(" 39 ", 0.4),
        ]);

        assert_eq!(
            cleaned,
            vec![
                RawDetection::new("syringe", 0.9),
                RawDetection::new("pill", 1.0),
                RawDetection::new("39", 0.4),
            ]
        );
    }

    #[test]
    fn test_sanitize_keeps_duplicates() {
        let cleaned = sanitize_detections(vec![
            RawDetection::new("syringe", 0.9),
            RawDetection::new("syringe", 0.4),
        ]);
        assert_eq!(cleaned.len(), 2);
    }
}
