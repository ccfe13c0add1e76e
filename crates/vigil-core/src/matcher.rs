//! Descriptor comparison against an enrolled profile.

use thiserror::Error;

use crate::types::FaceDescriptor;

/// Result of comparing a candidate against an enrolled descriptor set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Smallest distance found across the set.
    pub distance: f32,
    /// Index of the closest enrolled descriptor.
    pub best_index: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("no enrolled descriptors")]
    NotEnrolled,
    #[error("descriptor dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("descriptor contains non-finite values")]
    NonFinite,
}

pub trait Matcher {
    fn compare(
        &self,
        candidate: &FaceDescriptor,
        gallery: &[FaceDescriptor],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// The identity is confirmed when the closest enrolled descriptor lies
/// strictly below `threshold`.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        candidate: &FaceDescriptor,
        gallery: &[FaceDescriptor],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if gallery.is_empty() {
            return Err(MatchError::NotEnrolled);
        }
        if !candidate.is_finite() {
            return Err(MatchError::NonFinite);
        }

        let mut best: Option<(usize, f32)> = None;
        for (index, enrolled) in gallery.iter().enumerate() {
            let distance = candidate
                .distance(enrolled)
                .ok_or(MatchError::DimensionMismatch {
                    expected: enrolled.len(),
                    got: candidate.len(),
                })?;
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((index, distance));
            }
        }

        let (best_index, distance) = best.ok_or(MatchError::NotEnrolled)?;
        Ok(MatchResult {
            matched: distance < threshold,
            distance,
            best_index,
        })
    }
}
