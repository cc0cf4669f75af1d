//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes a luma frame into the 640×640 model input, decodes the three
//! anchor-free stride heads (scores, box offsets, keypoints) and applies NMS.
//! Every face above the confidence threshold is returned, not just the best.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer does not match {width}x{height}: {actual} bytes")]
    InvalidFrame { width: u32, height: u32, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Maps letterboxed model coordinates back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> Self {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((SCRFD_INPUT_SIZE as f32 - new_w) / 2.0).floor(),
            pad_y: ((SCRFD_INPUT_SIZE as f32 - new_h) / 2.0).floor(),
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [StrideHead; 3],
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
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }

        let heads = map_stride_heads(&names);
        tracing::debug!(?heads, "SCRFD output tensor mapping");

        Ok(Self { session, heads })
    }

    /// Detect all faces in a luma frame, sorted by descending confidence.
    pub fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame, width, height)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data.to_vec())
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(head.score, "scores")?;
            let bboxes = extract(head.bbox, "bboxes")?;
            let kps = extract(head.kps, "kps")?;

            detections.extend(decode_stride(&scores, &bboxes, &kps, stride, &letterbox));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox a luma frame into a normalized 1×3×640×640 tensor.
fn preprocess(frame: &[u8], width: u32, height: u32) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let image = GrayImage::from_raw(width, height, frame.to_vec()).ok_or(DetectorError::InvalidFrame {
        width,
        height,
        actual: frame.len(),
    })?;

    let letterbox = Letterbox::fit(width as usize, height as usize);
    let new_w = ((width as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((height as f32 * letterbox.scale).round() as u32).max(1);
    let resized = imageops::resize(&image, new_w, new_h, FilterType::Triangle);

    // Padding uses the mean so it normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let (px, py) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for y in 0..SCRFD_INPUT_SIZE {
        for x in 0..SCRFD_INPUT_SIZE {
            let inside = x >= px && y >= py && x < px + new_w as usize && y < py + new_h as usize;
            let pixel = if inside {
                resized.get_pixel((x - px) as u32, (y - py) as u32).0[0] as f32
            } else {
                SCRFD_MEAN
            };
            let v = (pixel - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }

    Ok((tensor, letterbox))
}

/// Resolve which output tensor carries each stride head.
///
/// Named exports ("score_8", "bbox_16", "kps_32", ...) are matched by name;
/// anything else falls back to the standard positional layout
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn map_stride_heads(names: &[String]) -> [StrideHead; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideHead>> = SCRFD_STRIDES
        .iter()
        .map(|&s| {
            Some(StrideHead {
                score: find("score", s)?,
                bbox: find("bbox", s)?,
                kps: find("kps", s)?,
            })
        })
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => std::array::from_fn(|i| StrideHead {
            score: i,
            bbox: i + 3,
            kps: i + 6,
        }),
    }
}

/// Decode one stride head into frame-space boxes above the confidence threshold.
fn decode_stride(scores: &[f32], bboxes: &[f32], kps: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let anchors = (SCRFD_INPUT_SIZE / stride) * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors)
        .filter(|&idx| scores.get(idx).is_some_and(|&score| score > SCRFD_CONFIDENCE_THRESHOLD))
        .filter_map(|idx| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * s;
            let cy = (cell / grid_w) as f32 * s;

            let off = bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame(cx - off[0] * s, cy - off[1] * s);
            let (x2, y2) = letterbox.to_frame(cx + off[2] * s, cy + off[3] * s);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.to_frame(cx + k[i * 2] * s, cy + k[i * 2 + 1] * s))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[idx],
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
