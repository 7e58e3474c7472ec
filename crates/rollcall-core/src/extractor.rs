//! Encoding extraction: one face image in, one encoding out.
//!
//! Every failure here is per-sample. Callers skip the image and move on.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_SPEC};
use crate::types::{BoundingBox, Encoding, EncodingSpec, FaceImage};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Why an otherwise readable image was refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum QualityIssue {
    TooSmall { width: u32, height: u32 },
    TooDark { mean: f32 },
    FaceTooSmall { size: f32 },
    LowConfidence { confidence: f32 },
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall { width, height } => write!(f, "image too small ({width}x{height})"),
            Self::TooDark { mean } => write!(f, "image too dark (mean brightness {mean:.0})"),
            Self::FaceTooSmall { size } => write!(f, "face too small ({size:.0}px)"),
            Self::LowConfidence { confidence } => write!(f, "face detection uncertain ({confidence:.2})"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{count} faces detected, expected exactly one")]
    MultipleFacesDetected { count: usize },
    #[error("low quality input: {0}")]
    LowQualityInput(QualityIssue),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Converts a face image into a fixed-length encoding.
///
/// Implementations must be deterministic: the same pixels always produce the
/// same encoding.
pub trait EncodingExtractor {
    /// Spec shared by every encoding this extractor returns.
    fn spec(&self) -> EncodingSpec;

    fn extract(&mut self, image: &FaceImage) -> Result<Encoding, ExtractError>;
}

impl<E: EncodingExtractor + ?Sized> EncodingExtractor for Box<E> {
    fn spec(&self) -> EncodingSpec {
        (**self).spec()
    }

    fn extract(&mut self, image: &FaceImage) -> Result<Encoding, ExtractError> {
        (**self).extract(image)
    }
}

/// Preconditions an image and its face must meet before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityGate {
    /// Minimum image width and height, in pixels.
    pub min_image_side: u32,
    /// Fraction of near-black pixels above which the frame counts as dark.
    pub max_dark_fraction: f32,
    /// Mean brightness below which the frame counts as dark.
    pub min_mean_brightness: f32,
    /// Faces whose shorter side is below this are ignored when counting and refused when alone.
    pub min_face_px: f32,
    pub min_face_confidence: f32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_image_side: 64,
            max_dark_fraction: 0.95,
            min_mean_brightness: 20.0,
            min_face_px: 40.0,
            min_face_confidence: 0.6,
        }
    }
}

impl QualityGate {
    pub fn check_image(&self, image: &FaceImage) -> Result<(), QualityIssue> {
        if image.width() < self.min_image_side || image.height() < self.min_image_side {
            return Err(QualityIssue::TooSmall {
                width: image.width(),
                height: image.height(),
            });
        }
        let mean = image.mean_brightness();
        if image.dark_fraction() > self.max_dark_fraction || mean < self.min_mean_brightness {
            return Err(QualityIssue::TooDark { mean });
        }
        Ok(())
    }

    /// Pick the one face to encode out of the detector's output.
    ///
    /// Faces below `min_face_px` are background noise and do not count toward
    /// "multiple faces"; if only such faces exist the frame is refused as too small.
    pub fn select_face(&self, mut faces: Vec<BoundingBox>) -> Result<BoundingBox, ExtractError> {
        if faces.is_empty() {
            return Err(ExtractError::NoFaceDetected);
        }

        let significant = faces.iter().filter(|f| f.side() >= self.min_face_px).count();
        if significant > 1 {
            return Err(ExtractError::MultipleFacesDetected { count: significant });
        }
        if significant == 0 {
            let size = faces.iter().map(BoundingBox::side).fold(0.0, f32::max);
            return Err(ExtractError::LowQualityInput(QualityIssue::FaceTooSmall { size }));
        }

        faces.retain(|f| f.side() >= self.min_face_px);
        let face = faces.swap_remove(0);
        if face.confidence < self.min_face_confidence {
            return Err(ExtractError::LowQualityInput(QualityIssue::LowConfidence {
                confidence: face.confidence,
            }));
        }
        Ok(face)
    }
}

/// SCRFD detection + ArcFace encoding.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    gate: QualityGate,
}

impl OnnxExtractor {
    /// Load both models from `model_dir` (`det_10g.onnx`, `w600k_r50.onnx`).
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);
        let detector = FaceDetector::load(&scrfd.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;
        Ok(Self {
            detector,
            recognizer,
            gate: QualityGate::default(),
        })
    }

    pub fn with_quality_gate(mut self, gate: QualityGate) -> Self {
        self.gate = gate;
        self
    }
}

impl EncodingExtractor for OnnxExtractor {
    fn spec(&self) -> EncodingSpec {
        ARCFACE_SPEC
    }

    fn extract(&mut self, image: &FaceImage) -> Result<Encoding, ExtractError> {
        self.gate.check_image(image).map_err(ExtractError::LowQualityInput)?;

        let faces = self.detector.detect(image.data(), image.width(), image.height())?;
        tracing::trace!(faces = faces.len(), "detector pass");

        let face = self.gate.select_face(faces)?;
        Ok(self.recognizer.encode(image, &face)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(side: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x: 10.0,
            y: 10.0,
            width: side,
            height: side * 1.2,
            confidence,
            landmarks: None,
        }
    }

    fn flat(value: u8, w: u32, h: u32) -> FaceImage {
        FaceImage::from_luma(vec![value; (w * h) as usize], w, h).unwrap()
    }

    #[test]
    fn test_gate_rejects_tiny_image() {
        let issue = QualityGate::default().check_image(&flat(128, 32, 32)).unwrap_err();
        assert_eq!(issue, QualityIssue::TooSmall { width: 32, height: 32 });
    }

    #[test]
    fn test_gate_rejects_dark_image() {
        let issue = QualityGate::default().check_image(&flat(5, 128, 128)).unwrap_err();
        assert!(matches!(issue, QualityIssue::TooDark { .. }));
    }

    #[test]
    fn test_gate_accepts_normal_image() {
        assert!(QualityGate::default().check_image(&flat(128, 128, 128)).is_ok());
    }

    #[test]
    fn test_select_face_none() {
        let err = QualityGate::default().select_face(Vec::new()).unwrap_err();
        assert!(matches!(err, ExtractError::NoFaceDetected));
    }

    #[test]
    fn test_select_face_multiple() {
        let err = QualityGate::default()
            .select_face(vec![face(80.0, 0.9), face(60.0, 0.8)])
            .unwrap_err();
        assert!(matches!(err, ExtractError::MultipleFacesDetected { count: 2 }));
    }

    #[test]
    fn test_select_face_ignores_background_faces() {
        let picked = QualityGate::default()
            .select_face(vec![face(12.0, 0.95), face(90.0, 0.9), face(15.0, 0.7)])
            .unwrap();
        assert_eq!(picked.width, 90.0);
    }

    #[test]
    fn test_select_face_only_tiny_faces() {
        let err = QualityGate::default().select_face(vec![face(20.0, 0.9)]).unwrap_err();
        match err {
            ExtractError::LowQualityInput(QualityIssue::FaceTooSmall { size }) => assert_eq!(size, 20.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_select_face_low_confidence() {
        let err = QualityGate::default().select_face(vec![face(80.0, 0.52)]).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::LowQualityInput(QualityIssue::LowConfidence { .. })
        ));
    }

    #[test]
    fn test_load_missing_models() {
        let err = OnnxExtractor::load(Path::new("/nonexistent/rollcall-models")).err();
        assert!(matches!(
            err,
            Some(ExtractError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }
}
