use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Shorter side of the box, in pixels.
    pub fn side(&self) -> f32 {
        self.width.min(self.height)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

/// Stable identifier of an enrolled person (student or employee number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(String);

impl PersonId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PersonId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Row id of a stored reference encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodingId(pub i64);

impl fmt::Display for EncodingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extractor configuration that every encoding is tagged with.
///
/// Two encodings are only comparable when their specs are equal, model
/// version included: vectors of the same width from different models live in
/// unrelated spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingSpec {
    pub dimension: usize,
    /// Whether vectors are L2-normalized to unit length.
    pub normalized: bool,
    /// Model that produced the vectors. `None` only matches untagged encodings.
    pub model_version: Option<Cow<'static, str>>,
}

impl EncodingSpec {
    /// Spec for untagged encodings.
    pub const fn new(dimension: usize, normalized: bool) -> Self {
        Self {
            dimension,
            normalized,
            model_version: None,
        }
    }

    pub const fn tagged(dimension: usize, normalized: bool, model_version: &'static str) -> Self {
        Self {
            dimension,
            normalized,
            model_version: Some(Cow::Borrowed(model_version)),
        }
    }

    /// Reject an encoding produced under a different configuration.
    pub fn check(&self, encoding: &Encoding) -> Result<(), SpecMismatch> {
        let actual = encoding.spec();
        if actual == *self {
            Ok(())
        } else {
            Err(SpecMismatch {
                expected: self.clone(),
                actual,
            })
        }
    }
}

impl fmt::Display for EncodingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let norm = if self.normalized { "normalized" } else { "raw" };
        write!(f, "{}-d {norm}", self.dimension)?;
        match &self.model_version {
            Some(version) => write!(f, " ({version})"),
            None => f.write_str(" (untagged)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("encoding spec mismatch: expected {expected}, got {actual}")]
pub struct SpecMismatch {
    pub expected: EncodingSpec,
    pub actual: EncodingSpec,
}

/// Face encoding: a fixed-length identity feature vector.
///
/// Immutable once produced. Values are only reachable through `values()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    values: Vec<f32>,
    normalized: bool,
    /// Model version that produced this encoding (e.g., "w600k_r50").
    model_version: Option<String>,
}

impl Encoding {
    /// Wrap raw extractor output as-is.
    pub fn raw(values: Vec<f32>) -> Self {
        Self {
            values,
            normalized: false,
            model_version: None,
        }
    }

    /// L2-normalize `values` to unit length. A zero vector is kept as zeros.
    pub fn normalized(mut values: Vec<f32>) -> Self {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        Self {
            values,
            normalized: true,
            model_version: None,
        }
    }

    /// Rebuild an encoding read back from storage under a known spec.
    pub fn from_parts(values: Vec<f32>, normalized: bool, model_version: Option<String>) -> Self {
        Self {
            values,
            normalized,
            model_version,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn spec(&self) -> EncodingSpec {
        EncodingSpec {
            dimension: self.values.len(),
            normalized: self.normalized,
            model_version: self.model_version.clone().map(Cow::Owned),
        }
    }

    /// Euclidean distance to another encoding of the same spec.
    pub fn distance(&self, other: &Encoding) -> Result<f32, SpecMismatch> {
        self.spec().check(other)?;
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

/// A reference encoding together with its storage id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEncoding {
    pub id: EncodingId,
    pub encoding: Encoding,
}

/// An enrolled person and their reference encodings, in enrollment order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub encodings: Vec<StoredEncoding>,
    pub created_at: DateTime<Utc>,
}

/// Attendance bucket a record belongs to (a calendar date by default).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One attendance event. Unique per (person, session key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub person_id: PersonId,
    pub timestamp: DateTime<Local>,
    pub session_key: SessionKey,
}

/// Attendance joined with the person's name, as consumed by reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRow {
    pub person_id: PersonId,
    pub name: String,
    pub timestamp: DateTime<Local>,
    pub session_key: SessionKey,
}

#[derive(Debug, Error)]
pub enum FaceImageError {
    #[error("pixel buffer holds {actual} bytes, {width}x{height} needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("image decode: {0}")]
    Decode(#[from] image::ImageError),
}

/// An 8-bit grayscale image handed to the extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl FaceImage {
    /// Wrap a luma buffer of exactly `width * height` bytes.
    pub fn from_luma(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FaceImageError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FaceImageError::BufferSize {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Decode an image file (any format the `image` crate reads) to grayscale.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FaceImageError> {
        let img = image::open(path.as_ref())?;
        Ok(Self::from_dynamic(&img))
    }

    pub fn from_dynamic(img: &image::DynamicImage) -> Self {
        let luma = img.to_luma8();
        let (width, height) = luma.dimensions();
        Self {
            data: luma.into_raw(),
            width,
            height,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn mean_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&p| p as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Fraction of pixels in the darkest eighth of the range (0–31).
    pub fn dark_fraction(&self) -> f32 {
        if self.data.is_empty() {
            return 1.0;
        }
        self.data.iter().filter(|&&p| p < 32).count() as f32 / self.data.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 1.0,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = boxed(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = boxed(0.0, 0.0, 10.0, 10.0);
        let b = boxed(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = boxed(0.0, 0.0, 10.0, 10.0);
        let b = boxed(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = Encoding::normalized(vec![0.3, 0.4, 0.5]);
        assert!(a.distance(&a.clone()).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_distance_orthogonal_unit_vectors() {
        let a = Encoding::normalized(vec![1.0, 0.0]);
        let b = Encoding::normalized(vec![0.0, 1.0]);
        assert!((a.distance(&b).unwrap() - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_distance_rejects_other_dimension() {
        let a = Encoding::normalized(vec![1.0, 0.0]);
        let b = Encoding::normalized(vec![1.0, 0.0, 0.0]);
        let err = a.distance(&b).unwrap_err();
        assert_eq!(err.expected.dimension, 2);
        assert_eq!(err.actual.dimension, 3);
    }

    #[test]
    fn test_other_model_of_same_width_is_not_comparable() {
        let ours = Encoding::normalized(vec![1.0, 0.0]).with_model_version("w600k_r50");
        let theirs = Encoding::normalized(vec![1.0, 0.0]).with_model_version("buffalo_s");

        let err = ours.distance(&theirs).unwrap_err();
        assert_eq!(err.expected.model_version.as_deref(), Some("w600k_r50"));
        assert_eq!(err.actual.model_version.as_deref(), Some("buffalo_s"));

        let spec = EncodingSpec::tagged(2, true, "w600k_r50");
        assert!(spec.check(&ours).is_ok());
        assert!(spec.check(&theirs).is_err());
        assert!(spec.check(&Encoding::normalized(vec![1.0, 0.0])).is_err());
        assert!(EncodingSpec::new(2, true).check(&theirs).is_err());
        assert_eq!(spec.to_string(), "2-d normalized (w600k_r50)");
    }

    #[test]
    fn test_distance_rejects_other_normalization() {
        let a = Encoding::normalized(vec![1.0, 0.0]);
        let b = Encoding::raw(vec![1.0, 0.0]);
        assert!(a.distance(&b).is_err());
    }

    #[test]
    fn test_normalized_zero_vector_stays_zero() {
        let e = Encoding::normalized(vec![0.0, 0.0, 0.0]);
        assert!(e.values().iter().all(|&v| v == 0.0));
        assert!(e.is_normalized());
    }

    #[test]
    fn test_face_image_rejects_short_buffer() {
        let err = FaceImage::from_luma(vec![0; 10], 4, 4).unwrap_err();
        assert!(matches!(err, FaceImageError::BufferSize { expected: 16, actual: 10, .. }));
    }

    #[test]
    fn test_face_image_brightness_stats() {
        let mut data = vec![0u8; 8];
        data.extend(vec![200u8; 8]);
        let img = FaceImage::from_luma(data, 4, 4).unwrap();
        assert!((img.mean_brightness() - 100.0).abs() < 1e-4);
        assert!((img.dark_fraction() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_face_image_from_dynamic_is_grayscale() {
        let rgb = image::RgbImage::from_pixel(3, 2, image::Rgb([90, 90, 90]));
        let img = FaceImage::from_dynamic(&image::DynamicImage::ImageRgb8(rgb));
        assert_eq!((img.width(), img.height()), (3, 2));
        assert_eq!(img.data().len(), 6);
        assert!(img.data().iter().all(|&p| p == 90));
    }
}
