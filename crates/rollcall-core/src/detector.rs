//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides, followed by non-maximum
//! suppression. Input frames are grayscale; the single channel is
//! replicated into the RGB planes the model expects.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: download det_10g.onnx from insightface into the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Where the score, box and keypoint tensors of one stride live in the output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    scaled_w: usize,
    scaled_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as usize).min(target);
        let scaled_h = ((height as f32 * scale).round() as usize).min(target);
        Self {
            scale,
            pad_x: (target - scaled_w) as f32 / 2.0,
            pad_y: (target - scaled_h) as f32 / 2.0,
            scaled_w,
            scaled_h,
        }
    }

    /// Map a point from model-input space back into the source frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?names, "loaded SCRFD model");

        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps for 3 strides), model has {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::debug!(?outputs, "SCRFD output mapping");

        Ok(Self { session, outputs })
    }

    /// Detect faces in a grayscale frame, highest confidence first.
    pub fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = (width as usize, height as usize);
        if width == 0 || height == 0 || frame.len() < width * height {
            return Err(DetectorError::InferenceFailed(format!(
                "frame buffer of {} bytes does not cover {width}x{height}",
                frame.len()
            )));
        }

        let letterbox = Letterbox::fit(width, height, INPUT_SIZE);
        let input = to_input_tensor(frame, width, height, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let map = self.outputs[slot];
            let (_, scores) = outputs[map.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[map.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[map.kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("keypoints stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, boxes, kps, stride, &letterbox));
        }

        Ok(non_max_suppression(candidates, NMS_IOU))
    }
}

/// Resize a grayscale buffer with bilinear interpolation (pixel-centre aligned).
fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let sx = width as f32 / new_w as f32;
    let sy = height as f32 / new_h as f32;
    let mut out = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let fy_src = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
        let y0 = (fy_src as usize).min(height - 1);
        let y1 = (y0 + 1).min(height - 1);
        let wy = fy_src - y0 as f32;

        for x in 0..new_w {
            let fx_src = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
            let x0 = (fx_src as usize).min(width - 1);
            let x1 = (x0 + 1).min(width - 1);
            let wx = fx_src - x0 as f32;

            let top = src[y0 * width + x0] as f32 * (1.0 - wx) + src[y0 * width + x1] as f32 * wx;
            let bottom = src[y1 * width + x0] as f32 * (1.0 - wx) + src[y1 * width + x1] as f32 * wx;
            out[y * new_w + x] = (top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Build the normalized NCHW input; padding uses the mean so it normalizes to zero.
fn to_input_tensor(frame: &[u8], width: usize, height: usize, lb: &Letterbox) -> Array4<f32> {
    let resized = resize_bilinear(frame, width, height, lb.scaled_w, lb.scaled_h);
    let x_off = lb.pad_x.floor() as usize;
    let y_off = lb.pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..lb.scaled_h {
        for x in 0..lb.scaled_w {
            let v = (resized[y * lb.scaled_w + x] as f32 - PIXEL_MEAN) / PIXEL_STD;
            for c in 0..3 {
                tensor[[0, c, y + y_off, x + x_off]] = v;
            }
        }
    }
    tensor
}

/// Resolve output tensor positions by name ("score_8", "bbox_16", ...),
/// falling back to the standard export order [scores, boxes, keypoints].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| {
            Some(StrideOutputs {
                score: find("score", s)?,
                bbox: find("bbox", s)?,
                kps: find("kps", s)?,
            })
        })
        .collect();

    match by_name {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Decode one stride's anchors into frame-space boxes with landmarks.
fn decode_stride(scores: &[f32], boxes: &[f32], kps: &[f32], stride: usize, lb: &Letterbox) -> Vec<BoundingBox> {
    let cols = INPUT_SIZE / stride;
    let anchors = cols * (INPUT_SIZE / stride) * ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut found = Vec::new();
    for idx in 0..anchors.min(scores.len()) {
        let confidence = scores[idx];
        if confidence <= SCORE_THRESHOLD {
            continue;
        }
        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let cx = (cell % cols) as f32 * step;
        let cy = (cell / cols) as f32 * step;

        let (x1, y1) = lb.unmap(cx - d[0] * step, cy - d[1] * step);
        let (x2, y2) = lb.unmap(cx + d[2] * step, cy + d[3] * step);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| lb.unmap(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step))
        });

        found.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
            landmarks,
        });
    }
    found
}

/// Greedy NMS: keep the most confident box, drop everything overlapping it.
fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_limit: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_limit) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence, landmarks: None }
    }

    #[test]
    fn test_nms_drops_overlapping_lower_score() {
        let kept = non_max_suppression(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_keeps_separate_faces() {
        let kept = non_max_suppression(
            vec![bbox(0.0, 0.0, 10.0, 10.0, 0.9), bbox(50.0, 50.0, 10.0, 10.0, 0.8)],
            0.4,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_unmap_recovers_source_point() {
        let lb = Letterbox::fit(320, 240, INPUT_SIZE);
        assert_eq!(lb.scaled_w, 640);
        assert_eq!(lb.scaled_h, 480);
        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 0.1 && (y - 50.0).abs() < 0.1, "got ({x}, {y})");
    }

    #[test]
    fn test_map_outputs_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let map = map_outputs(&names);
        assert_eq!(map[0], StrideOutputs { score: 2, bbox: 0, kps: 1 });
        assert_eq!(map[2], StrideOutputs { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| format!("{}", 400 + i)).collect();
        let map = map_outputs(&names);
        assert_eq!(map[1], StrideOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let src = vec![128u8; 100 * 100];
        let out = resize_bilinear(&src, 100, 100, 200, 150);
        assert_eq!(out.len(), 200 * 150);
        assert!(out.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_input_tensor_padding_normalizes_to_zero() {
        let frame = vec![255u8; 320 * 160];
        let lb = Letterbox::fit(320, 160, INPUT_SIZE);
        let t = to_input_tensor(&frame, 320, 160, &lb);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        let mid = t[[0, 1, INPUT_SIZE / 2, INPUT_SIZE / 2]];
        assert!((mid - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_maps_box_and_landmarks() {
        let lb = Letterbox::fit(INPUT_SIZE, INPUT_SIZE, INPUT_SIZE);
        let cells = (INPUT_SIZE / 32) * (INPUT_SIZE / 32) * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut boxes = vec![0.0f32; cells * 4];
        let kps = vec![0.5f32; cells * 10];
        // anchor 2 -> cell 1 -> (32, 0)
        scores[2] = 0.9;
        boxes[8..12].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);

        let found = decode_stride(&scores, &boxes, &kps, 32, &lb);
        assert_eq!(found.len(), 1);
        let b = &found[0];
        assert!((b.x - 16.0).abs() < 1e-4 && b.y.abs() < 1e-4);
        assert!((b.width - 48.0).abs() < 1e-4 && (b.height - 64.0).abs() < 1e-4);
        let lms = b.landmarks.unwrap();
        assert!((lms[0].0 - 48.0).abs() < 1e-4 && (lms[0].1 - 16.0).abs() < 1e-4);
    }
}
