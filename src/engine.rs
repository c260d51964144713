//! Inference engine: one image in, at most one labelled detection out.

use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use tracing::debug;

use crate::error::{DiagnosisError, Result};
use crate::postprocess::{Detection, top_detection};

/// Threshold applied when the caller does not supply one.
pub const DEFAULT_CONF_THRESHOLD: f32 = 0.25;

/// Seam between the engine and the detection backend.
///
/// `detect` returns every candidate at or above `conf_threshold`; the engine
/// only ever reads class names through `class_names`.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &DynamicImage, conf_threshold: f32) -> Result<Vec<Detection>>;

    fn class_names(&self) -> &[String];
}

/// Outcome of a single inference call.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Detected {
        disease_name: String,
        /// Percent, `[0, 100]`
        confidence: f32,
        detection: Detection,
    },
    /// Nothing cleared the threshold. A normal outcome, not an error.
    NoDetection,
}

#[derive(Clone)]
pub struct InferenceEngine {
    detector: Arc<dyn Detector>,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("classes", &self.detector.class_names().len())
            .finish()
    }
}

impl InferenceEngine {
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self { detector }
    }

    pub fn class_names(&self) -> &[String] {
        self.detector.class_names()
    }

    pub fn infer(&self, image: &DynamicImage, conf_threshold: f32) -> Result<Prediction> {
        validate_threshold(conf_threshold)?;

        let t = Instant::now();
        let mut candidates = self.detector.detect(image, conf_threshold)?;
        candidates.retain(|d| d.confidence >= conf_threshold);
        debug!(candidates = candidates.len(), elapsed = ?t.elapsed(), "inference");

        let Some(top) = top_detection(&candidates) else {
            return Ok(Prediction::NoDetection);
        };
        let disease_name = self
            .class_names()
            .get(top.class_index)
            .ok_or_else(|| {
                DiagnosisError::Inference(format!(
                    "class index {} is outside the {} known classes",
                    top.class_index,
                    self.class_names().len()
                ))
            })?
            .clone();

        Ok(Prediction::Detected {
            disease_name,
            confidence: top.confidence * 100.0,
            detection: top.clone(),
        })
    }
}

/// Threshold must lie in `[0, 1]`.
pub fn validate_threshold(conf_threshold: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&conf_threshold) {
        return Err(DiagnosisError::InvalidRequest(format!(
            "confidence threshold must be between 0 and 1, got {}",
            conf_threshold
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    type Responder = dyn Fn(&DynamicImage) -> Result<Vec<Detection>> + Send + Sync;

    /// Detector whose output is computed from the input image, so tests can
    /// key results on image dimensions.
    pub struct FakeDetector {
        pub class_names: Vec<String>,
        respond: Box<Responder>,
    }

    impl FakeDetector {
        pub fn new<F>(class_names: &[&str], respond: F) -> Self
        where
            F: Fn(&DynamicImage) -> Result<Vec<Detection>> + Send + Sync + 'static,
        {
            Self {
                class_names: class_names.iter().map(|s| s.to_string()).collect(),
                respond: Box::new(respond),
            }
        }

        /// Always returns the same candidates.
        pub fn fixed(class_names: &[&str], detections: Vec<Detection>) -> Self {
            Self::new(class_names, move |_| Ok(detections.clone()))
        }
    }

    impl Detector for FakeDetector {
        fn detect(&self, image: &DynamicImage, conf_threshold: f32) -> Result<Vec<Detection>> {
            let mut detections = (self.respond)(image)?;
            detections.retain(|d| d.confidence >= conf_threshold);
            Ok(detections)
        }

        fn class_names(&self) -> &[String] {
            &self.class_names
        }
    }

    pub fn det(class_index: usize, confidence: f32) -> Detection {
        Detection { class_index, confidence, bbox: [1.0, 1.0, 3.0, 3.0] }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeDetector, det};
    use super::*;

    fn image() -> DynamicImage {
        DynamicImage::new_rgb8(4, 4)
    }

    fn engine(detector: FakeDetector) -> InferenceEngine {
        InferenceEngine::new(Arc::new(detector))
    }

    #[test]
    fn picks_highest_confidence_candidate() {
        let engine = engine(FakeDetector::fixed(
            &["Healthy", "Tomato_Early_Blight", "Corn_Rust"],
            vec![det(0, 0.40), det(1, 0.81), det(2, 0.30)],
        ));
        match engine.infer(&image(), 0.25).unwrap() {
            Prediction::Detected { disease_name, confidence, detection } => {
                assert_eq!(disease_name, "Tomato_Early_Blight");
                assert_eq!(confidence, 0.81 * 100.0);
                assert_eq!(detection.class_index, 1);
            }
            other => panic!("expected a detection, got {:?}", other),
        }
    }

    #[test]
    fn nothing_above_threshold_is_no_detection() {
        let engine = engine(FakeDetector::fixed(&["Healthy"], vec![det(0, 0.2)]));
        assert_eq!(engine.infer(&image(), 0.25).unwrap(), Prediction::NoDetection);

        let empty = self::engine(FakeDetector::fixed(&["Healthy"], vec![]));
        assert_eq!(empty.infer(&image(), 0.0).unwrap(), Prediction::NoDetection);
    }

    #[test]
    fn engine_enforces_threshold_even_if_backend_does_not() {
        struct Leaky;
        impl Detector for Leaky {
            fn detect(&self, _: &DynamicImage, _: f32) -> Result<Vec<Detection>> {
                Ok(vec![det(0, 0.1)])
            }
            fn class_names(&self) -> &[String] {
                &[]
            }
        }
        let engine = InferenceEngine::new(Arc::new(Leaky));
        assert_eq!(engine.infer(&image(), 0.5).unwrap(), Prediction::NoDetection);
    }

    #[test]
    fn ties_go_to_first_candidate() {
        let engine = engine(FakeDetector::fixed(&["A", "B"], vec![det(1, 0.7), det(0, 0.7)]));
        let Prediction::Detected { disease_name, .. } = engine.infer(&image(), 0.25).unwrap() else {
            panic!("expected a detection");
        };
        assert_eq!(disease_name, "B");
    }

    #[test]
    fn out_of_range_class_index_is_an_inference_error() {
        let engine = engine(FakeDetector::fixed(&["A"], vec![det(3, 0.9)]));
        assert!(matches!(engine.infer(&image(), 0.25), Err(DiagnosisError::Inference(_))));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let engine = engine(FakeDetector::fixed(&["A"], vec![det(0, 0.9)]));
        for bad in [-0.1, 1.5, f32::NAN] {
            assert!(matches!(engine.infer(&image(), bad), Err(DiagnosisError::InvalidRequest(_))));
        }
        assert!(engine.infer(&image(), 1.0).is_ok());
    }

    #[test]
    fn higher_threshold_never_adds_detections() {
        let detector = FakeDetector::fixed(&["A", "B", "C"], vec![det(0, 0.2), det(1, 0.5), det(2, 0.9)]);
        let mut previous = usize::MAX;
        for t in [0.0, 0.2, 0.3, 0.5, 0.8, 0.95] {
            let count = detector.detect(&image(), t).unwrap().len();
            assert!(count <= previous);
            previous = count;
        }
    }
}
