use serde::{Deserialize, Serialize};

/// Stable numeric identifier of a student; joins the gallery and attendance rows.
pub type StudentId = i64;

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

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-length vector on either side compares as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, norm_a, norm_b) = self
            .values
            .iter()
            .zip(other.values.iter())
            .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (a, b)| {
                (dot + a * b, na + a * a, nb + b * b)
            });

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// A roster member as seen by the recognition pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterMember {
    pub id: StudentId,
    pub name: String,
    pub roll_number: String,
    /// Reference image file name inside the face directory, if one was uploaded
    /// under a non-default name.
    pub reference: Option<String>,
}

/// One (identity, embedding) pair of a gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub student_id: StudentId,
    pub embedding: Embedding,
}

/// Strategy for deciding which gallery entry (if any) a probe embedding belongs to.
///
/// Returns the index into `gallery` of the accepted entry.
pub trait Matcher {
    fn find(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> Option<usize>;
}

/// Accepts the first gallery entry, in gallery order, whose similarity reaches
/// the threshold. Not guaranteed to be the closest entry.
pub struct FirstMatch;

impl Matcher for FirstMatch {
    fn find(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> Option<usize> {
        gallery
            .iter()
            .position(|entry| probe.similarity(&entry.embedding) >= threshold)
    }
}

/// Accepts the most similar gallery entry, provided it reaches the threshold.
///
/// Always visits every entry.
pub struct BestMatch;

impl Matcher for BestMatch {
    fn find(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> Option<usize> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx = None;

        for (i, entry) in gallery.iter().enumerate() {
            let sim = probe.similarity(&entry.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        best_idx.filter(|_| best_sim >= threshold)
    }
}

/// Configurable selection of a [`Matcher`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    #[default]
    First,
    Best,
}

impl MatchStrategy {
    pub fn matcher(self) -> &'static (dyn Matcher + Send + Sync) {
        match self {
            MatchStrategy::First => &FirstMatch,
            MatchStrategy::Best => &BestMatch,
        }
    }
}

impl std::str::FromStr for MatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(MatchStrategy::First),
            "best" => Ok(MatchStrategy::Best),
            other => Err(format!("unknown match strategy: {other} (expected first or best)")),
        }
    }
}
