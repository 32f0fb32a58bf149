use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Borrowed view of an interleaved 8-bit RGB image (`width * height * 3` bytes).
#[derive(Debug, Clone, Copy)]
pub struct RgbView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> RgbView<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Self {
        Self { data, width, height }
    }

    /// True when `data` holds at least `width * height` RGB pixels.
    pub fn is_complete(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() >= self.width as usize * self.height as usize * 3
    }

    /// RGB triple at (x, y); caller guarantees bounds.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

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
    /// Corner form `(x_min, y_min, x_max, y_max)`.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (self.x, self.y, self.x + self.width, self.y + self.height)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    /// Cosine similarity between two embeddings, in [-1, 1].
    ///
    /// Allocation-free; runs once per enrolled embedding per probe.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// An enrolled person: a unique name and one embedding per usable enrollment image.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: Arc<str>,
    pub embeddings: Vec<Embedding>,
}

impl Identity {
    pub fn new(name: impl Into<Arc<str>>, embeddings: Vec<Embedding>) -> Self {
        Self { name: name.into(), embeddings }
    }

    /// Best similarity of `probe` against any of this identity's embeddings.
    ///
    /// Returns `f32::NEG_INFINITY` for an identity without embeddings.
    pub fn score(&self, probe: &Embedding) -> f32 {
        self.embeddings
            .iter()
            .map(|e| probe.similarity(e))
            .fold(f32::NEG_INFINITY, f32::max)
    }
}

/// Immutable snapshot of every enrolled identity.
///
/// Published behind an `Arc` and never mutated; a rebuild produces a new
/// table with a higher generation.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    identities: Vec<Identity>,
    generation: u64,
}

impl IdentityTable {
    pub fn new(identities: Vec<Identity>, generation: u64) -> Self {
        Self { identities, generation }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn embedding_count(&self) -> usize {
        self.identities.iter().map(|i| i.embeddings.len()).sum()
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| &*i.name == name)
    }
}

/// Result of matching a probe embedding against an identity table.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMatch<'t> {
    /// Matched identity, or `None` for Unknown.
    pub identity: Option<&'t Identity>,
    /// Similarity of the matched identity; 0.0 when Unknown.
    pub similarity: f32,
}

impl<'t> IdentityMatch<'t> {
    pub const UNKNOWN: IdentityMatch<'static> = IdentityMatch { identity: None, similarity: 0.0 };

    pub fn is_known(&self) -> bool {
        self.identity.is_some()
    }

    /// Matched name, or `"Unknown"`.
    pub fn label(&self) -> &str {
        self.identity.map(|i| &*i.name).unwrap_or("Unknown")
    }
}

/// Strategy for comparing a probe embedding against the enrolled identities.
pub trait Matcher {
    fn best_match<'t>(
        &self,
        probe: &Embedding,
        table: &'t IdentityTable,
        threshold: f32,
    ) -> IdentityMatch<'t>;
}

/// Cosine similarity matcher.
///
/// An identity is accepted only if its score is strictly greater than both the
/// running best and `threshold`. Equal scores therefore keep the identity seen
/// first in table order, and a score equal to the threshold is Unknown.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match<'t>(
        &self,
        probe: &Embedding,
        table: &'t IdentityTable,
        threshold: f32,
    ) -> IdentityMatch<'t> {
        let mut best: Option<(&Identity, f32)> = None;

        for identity in table.identities() {
            let score = identity.score(probe);
            if score > threshold && best.map_or(true, |(_, top)| score > top) {
                best = Some((identity, score));
            }
        }

        best.map_or(IdentityMatch::UNKNOWN, |(identity, similarity)| IdentityMatch {
            identity: Some(identity),
            similarity,
        })
    }
}
