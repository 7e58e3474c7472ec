//! ArcFace face recognizer via ONNX Runtime.
//!
//! Turns an aligned 112×112 face crop into an L2-normalized 512-d encoding
//! using the w600k_r50 model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Encoding, EncodingSpec, FaceImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
pub const ARCFACE_DIMENSION: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// Spec of every encoding this recognizer produces.
pub const ARCFACE_SPEC: EncodingSpec = EncodingSpec::tagged(ARCFACE_DIMENSION, true, ARCFACE_MODEL_VERSION);

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}: download w600k_r50.onnx from insightface into the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based encoder.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Encode the detected `face` of `image`.
    pub fn encode(&mut self, image: &FaceImage, face: &BoundingBox) -> Result<Encoding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let crop = alignment::align_face(image.data(), image.width(), image.height(), landmarks);
        let input = crop_to_tensor(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != ARCFACE_DIMENSION {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_DIMENSION}-d output, got {}",
                raw.len()
            )));
        }

        Ok(Encoding::normalized(raw.to_vec()).with_model_version(ARCFACE_MODEL_VERSION))
    }
}

/// 112×112 grayscale crop → normalized NCHW tensor with the luma replicated per channel.
fn crop_to_tensor(crop: &[u8]) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, ALIGNED_SIZE, ALIGNED_SIZE), |(_, _, y, x)| {
        let pixel = crop.get(y * ALIGNED_SIZE + x).copied().unwrap_or(0) as f32;
        (pixel - PIXEL_MEAN) / PIXEL_STD
    })
}
