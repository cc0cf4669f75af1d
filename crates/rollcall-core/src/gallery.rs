//! Roster gallery: reference image per student → (identity, embedding) pairs.
//!
//! Built fresh for every capture session so roster changes are picked up.
//! Members without a usable reference image are skipped and reported,
//! never fatal.

use crate::encoder::FaceEncoder;
use crate::types::{Embedding, GalleryEntry, Matcher, RosterMember, StudentId};
use std::fmt;
use std::path::{Path, PathBuf};

/// Why a roster member has no gallery entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No reference image at the expected location.
    NoReference,
    /// The file exists but could not be decoded.
    Unreadable(String),
    /// The image decoded but no face was detected in it.
    NoFace,
    /// Detection or embedding failed.
    Extraction(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoReference => write!(f, "no reference image"),
            SkipReason::Unreadable(e) => write!(f, "unreadable reference image: {e}"),
            SkipReason::NoFace => write!(f, "no face in reference image"),
            SkipReason::Extraction(e) => write!(f, "embedding failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMember {
    pub student_id: StudentId,
    pub reason: SkipReason,
}

/// In-memory set of known faces, in roster order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identity of the gallery entry `matcher` accepts for `probe`, if any.
    pub fn identify(&self, probe: &Embedding, matcher: &dyn Matcher, threshold: f32) -> Option<StudentId> {
        matcher
            .find(probe, &self.entries, threshold)
            .map(|idx| self.entries[idx].student_id)
    }
}

/// Outcome of building a gallery: the embedded subset plus every skip.
#[derive(Debug, Clone, Default)]
pub struct GalleryBuild {
    pub gallery: Gallery,
    pub skipped: Vec<SkippedMember>,
}

/// Locates reference images and embeds them.
#[derive(Debug, Clone)]
pub struct GalleryLoader {
    face_dir: PathBuf,
    extension: String,
}

impl GalleryLoader {
    /// `extension` is the file suffix of images stored under the default
    /// `<student id>.<extension>` naming.
    pub fn new(face_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            face_dir: face_dir.into(),
            extension: extension.into(),
        }
    }

    pub fn face_dir(&self) -> &Path {
        &self.face_dir
    }

    /// Where the reference image of `member` is expected to live.
    ///
    /// A stored reference without a file extension is a bare key (usually the
    /// student id itself) and gets the configured extension appended.
    pub fn reference_path(&self, member: &RosterMember) -> PathBuf {
        let key = member.reference.as_deref().filter(|r| !r.trim().is_empty());
        match key {
            Some(name) if Path::new(name).extension().is_some() => self.face_dir.join(name),
            Some(key) => self.face_dir.join(format!("{}.{}", key.trim(), self.extension)),
            None => self.face_dir.join(format!("{}.{}", member.id, self.extension)),
        }
    }

    pub fn build(&self, roster: &[RosterMember], encoder: &mut dyn FaceEncoder) -> GalleryBuild {
        let mut build = GalleryBuild::default();

        for member in roster {
            match self.embed_member(member, encoder) {
                Ok(embedding) => build.gallery.entries.push(GalleryEntry {
                    student_id: member.id,
                    embedding,
                }),
                Err(reason) => {
                    tracing::warn!(student_id = member.id, %reason, "student left out of gallery");
                    build.skipped.push(SkippedMember {
                        student_id: member.id,
                        reason,
                    });
                }
            }
        }

        tracing::info!(
            embedded = build.gallery.len(),
            skipped = build.skipped.len(),
            "gallery built"
        );
        build
    }

    fn embed_member(&self, member: &RosterMember, encoder: &mut dyn FaceEncoder) -> Result<Embedding, SkipReason> {
        let path = self.reference_path(member);
        if !path.is_file() {
            return Err(SkipReason::NoReference);
        }

        let image = image::open(&path)
            .map_err(|e| SkipReason::Unreadable(e.to_string()))?
            .to_luma8();

        let embeddings = encoder
            .encode(image.as_raw(), image.width(), image.height())
            .map_err(|e| SkipReason::Extraction(e.to_string()))?;

        // Reference photos are expected to hold one face; the first one wins.
        embeddings.into_iter().next().ok_or(SkipReason::NoFace)
    }
}
