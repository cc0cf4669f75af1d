//! Camera and model stand-ins for pipeline tests.
//!
//! Identities are encoded as luma values: tag `k` (1..=5) is a band of pixels
//! with value `50 * k`. [`TagEncoder`] reports one face per distinct tag found
//! in a frame, so scripted frames and reference images share one vocabulary.

use rollcall_core::{EncodeError, Embedding, FaceEncoder, Gallery, GalleryEntry, StudentId};
use rollcall_hw::{CameraAddress, CameraError, Frame, SourceOpener, VideoSource};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FRAME_WIDTH: u32 = 8;
pub const FRAME_HEIGHT: u32 = 8;

/// Luma of frame areas without a face; bright enough not to count as dark.
const BACKGROUND: u8 = 40;
const MAX_TAG: u8 = 5;

pub fn tag_embedding(tag: u8) -> Embedding {
    let mut values = vec![0.0; MAX_TAG as usize + 1];
    values[tag as usize] = 1.0;
    Embedding::new(values)
}

/// A frame holding one face per tag, each in its own 2-row band.
pub fn face_frame(tags: &[u8]) -> Vec<u8> {
    let mut data = vec![BACKGROUND; (FRAME_WIDTH * FRAME_HEIGHT) as usize];
    let band = 2 * FRAME_WIDTH as usize;
    for (i, &tag) in tags.iter().enumerate() {
        let start = i * band;
        if start + band <= data.len() {
            data[start..start + band].fill(tag * 50);
        }
    }
    data
}

pub fn gallery_of(entries: &[(StudentId, u8)]) -> Gallery {
    Gallery::new(
        entries
            .iter()
            .map(|&(student_id, tag)| GalleryEntry {
                student_id,
                embedding: tag_embedding(tag),
            })
            .collect(),
    )
}

/// Save a uniform reference image for `tag` as `<dir>/<student_id>.png`.
pub fn write_reference(dir: &Path, student_id: StudentId, tag: u8) {
    image::GrayImage::from_pixel(16, 16, image::Luma([tag * 50]))
        .save(dir.join(format!("{student_id}.png")))
        .unwrap();
}

pub struct TagEncoder;

impl FaceEncoder for TagEncoder {
    fn encode(&mut self, pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Embedding>, EncodeError> {
        let tags: BTreeSet<u8> = pixels
            .iter()
            .filter(|&&p| p > 0 && p % 50 == 0 && p / 50 <= MAX_TAG)
            .map(|&p| p / 50)
            .collect();
        Ok(tags.into_iter().map(tag_embedding).collect())
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Frame(Vec<u8>),
    Fail,
}

/// Opens sources that replay `steps` in a loop, one step per millisecond.
#[derive(Clone)]
pub struct ScriptedOpener {
    steps: Vec<Step>,
    available: bool,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            available: true,
            opened: Arc::default(),
            released: Arc::default(),
        }
    }

    /// Every open attempt fails.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, address: &CameraAddress) -> Result<Box<dyn VideoSource>, CameraError> {
        if !self.available {
            return Err(CameraError::DeviceNotFound(address.to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource {
            steps: self.steps.clone(),
            cursor: 0,
            released: Arc::clone(&self.released),
        }))
    }
}

struct ScriptedSource {
    steps: Vec<Step>,
    cursor: usize,
    released: Arc<AtomicUsize>,
}

impl VideoSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        std::thread::sleep(Duration::from_millis(1));
        if self.steps.is_empty() {
            return Err(CameraError::CaptureFailed("empty script".into()));
        }
        let sequence = self.cursor as u32;
        let step = self.steps[self.cursor % self.steps.len()].clone();
        self.cursor += 1;
        match step {
            Step::Frame(data) => Ok(Frame::new(data, FRAME_WIDTH, FRAME_HEIGHT, sequence)),
            Step::Fail => Err(CameraError::CaptureFailed("scripted failure".into())),
        }
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
