//! Frame → embeddings: every detected face is aligned and embedded.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Produces one embedding per face found in a luma image.
///
/// An empty vector means no face was detected.
pub trait FaceEncoder {
    fn encode(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Embedding>, EncodeError>;
}

/// SCRFD detection followed by ArcFace embedding.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEncoder {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    /// Load both models from `model_dir` (`det_10g.onnx`, `w600k_r50.onnx`).
    pub fn load(model_dir: &Path) -> Result<Self, EncodeError> {
        let (scrfd, arcface) = model_paths(model_dir);
        let detector = FaceDetector::load(&scrfd.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;
        Ok(Self::new(detector, recognizer))
    }
}

/// SCRFD and ArcFace model locations inside a model directory.
pub fn model_paths(model_dir: &Path) -> (PathBuf, PathBuf) {
    (model_dir.join("det_10g.onnx"), model_dir.join("w600k_r50.onnx"))
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Embedding>, EncodeError> {
        let faces = self.detector.detect(pixels, width, height)?;

        let mut embeddings = Vec::with_capacity(faces.len());
        for face in &faces {
            // Detections without keypoints cannot be aligned; skip rather than fail the frame.
            let Some(landmarks) = face.landmarks.as_ref() else {
                tracing::debug!(confidence = face.confidence, "face without landmarks skipped");
                continue;
            };
            let aligned = alignment::align_face(pixels, width, height, landmarks);
            embeddings.push(self.recognizer.embed(&aligned)?);
        }
        Ok(embeddings)
    }
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn encode(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Embedding>, EncodeError> {
        (**self).encode(pixels, width, height)
    }
}
