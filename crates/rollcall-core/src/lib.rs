//! rollcall-core: Face detection, embedding and roster matching.
//!
//! SCRFD detects faces and ArcFace embeds them, both via ONNX Runtime on CPU.
//! The [`gallery`] module turns a class roster into the known-face set that
//! capture sessions match against.

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod gallery;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use encoder::{EncodeError, FaceEncoder, OnnxFaceEncoder};
pub use gallery::{Gallery, GalleryBuild, GalleryLoader, SkipReason, SkippedMember};
pub use recognizer::FaceRecognizer;
pub use types::{
    BestMatch, BoundingBox, Embedding, FirstMatch, GalleryEntry, MatchStrategy, Matcher, RosterMember, StudentId,
};
