use crate::signature::FaceSignature;
use crate::types::EnrollmentRecord;

/// Minimum cosine similarity for two signatures to be the same face.
pub const MATCH_THRESHOLD: f32 = 0.8;

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for empty vectors, vectors of different length, or when
/// either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom) as f32
    } else {
        0.0
    }
}

/// Similarity of two encoded signatures, `None` on any structural mismatch.
pub fn signature_similarity(a: &FaceSignature, b: &FaceSignature) -> Option<f32> {
    let va = a.decode();
    let vb = b.decode();
    if va.is_empty() || vb.is_empty() || va.len() != vb.len() {
        return None;
    }
    Some(cosine_similarity(&va, &vb))
}

/// Match decision for two signatures. Ambiguous or partial data never matches.
pub fn is_match(a: &FaceSignature, b: &FaceSignature) -> bool {
    signature_similarity(a, b).is_some_and(|s| s >= MATCH_THRESHOLD)
}

/// Result of matching a candidate signature against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Best cosine similarity found (0.0 when nothing was comparable).
    pub similarity: f32,
    /// Record that produced the match, if any.
    pub record_id: Option<String>,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            record_id: None,
        }
    }
}

/// Strategy for comparing a candidate against the enrolled gallery.
pub trait Matcher {
    fn compare(&self, candidate: &FaceSignature, gallery: &[EnrollmentRecord]) -> MatchResult;
}

/// Fixed-threshold cosine matcher. Every gallery entry is compared.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, candidate: &FaceSignature, gallery: &[EnrollmentRecord]) -> MatchResult {
        if !candidate.is_valid() {
            return MatchResult::no_match();
        }

        let mut best: Option<(f32, &EnrollmentRecord)> = None;
        for record in gallery {
            let Some(sim) = signature_similarity(candidate, &record.signature) else {
                continue;
            };
            if best.map_or(true, |(prev, _)| sim > prev) {
                best = Some((sim, record));
            }
        }

        match best {
            Some((sim, record)) if sim >= MATCH_THRESHOLD => MatchResult {
                matched: true,
                similarity: sim,
                record_id: Some(record.id.clone()),
            },
            Some((sim, _)) => MatchResult {
                matched: false,
                similarity: sim,
                record_id: None,
            },
            None => MatchResult::no_match(),
        }
    }
}
