//! Nearest-neighbour identity matching.
//!
//! A linear scan is plenty for classroom-sized galleries (tens to low
//! hundreds of identities). An indexed structure can replace
//! [`EuclideanMatcher`] behind the [`Matcher`] trait without touching callers.

use crate::types::{Embedding, EmbeddingError, Gallery};

/// Default distance upper bound for a positive match, in the normalised
/// embedding space of the extractor.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

/// Outcome of comparing one query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Best candidate when `matched` is true.
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    /// Smallest distance seen. `f32::INFINITY` for an empty gallery.
    pub distance: f32,
    /// `1 - distance` clamped to `[0, 1]`; zero when not matched.
    pub confidence: f32,
}

impl MatchResult {
    pub fn no_match(distance: f32) -> Self {
        Self {
            matched: false,
            identity_id: None,
            display_name: None,
            distance,
            confidence: 0.0,
        }
    }
}

pub trait Matcher: Send + Sync {
    /// Find the closest gallery entry to `query`.
    ///
    /// A match is accepted only when the minimal distance is strictly below
    /// `threshold`.
    fn compare(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError>;
}

/// Euclidean (L2) linear-scan matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError> {
        if gallery.is_empty() {
            return Ok(MatchResult::no_match(f32::INFINITY));
        }
        query.validate(gallery.dim())?;

        let mut best: Option<(&str, &str, f32)> = None;
        for (id, entry) in gallery.iter() {
            let distance = euclidean_distance(&query.values, &entry.embedding.values);
            // Strict comparison keeps the first entry (smallest id) on ties.
            let closer = match best {
                None => true,
                Some((_, _, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((id, entry.display_name.as_str(), distance));
            }
        }

        let Some((id, name, distance)) = best else {
            return Ok(MatchResult::no_match(f32::INFINITY));
        };

        if distance < threshold {
            tracing::debug!(identity_id = id, distance, threshold, "gallery match");
            Ok(MatchResult {
                matched: true,
                identity_id: Some(id.to_string()),
                display_name: Some(name.to_string()),
                distance,
                confidence: (1.0 - distance).clamp(0.0, 1.0),
            })
        } else {
            tracing::debug!(distance, threshold, "no gallery entry within threshold");
            Ok(MatchResult::no_match(distance))
        }
    }
}

/// L2 distance between two equal-length vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
