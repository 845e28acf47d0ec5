// correlation.rs -- Best-result bookkeeping.
//
// Ordering of results: higher score wins. On an exact score tie the
// deformation with the smaller Euclidean norm wins, so equally good
// candidates never resolve to the numerically larger jump. A remaining
// tie (same score, same norm) keeps the incumbent.

use std::cmp::Ordering;

use crate::deformation::magnitude;

/// Best deformation found for one facet.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    /// Zero-normalized cross-correlation, in [-1, 1].
    pub score: f64,
    pub deformation: Vec<f64>,
}

impl CorrelationResult {
    pub fn new(score: f64, deformation: Vec<f64>) -> Self {
        CorrelationResult { score, deformation }
    }

    /// Strict "better than" under the score / magnitude ordering.
    pub fn is_better_than(&self, other: &CorrelationResult) -> bool {
        self.compare(other) == Ordering::Greater
    }

    /// Total order: score first, then smaller magnitude is greater.
    /// NaN scores compare below every real score.
    pub fn compare(&self, other: &CorrelationResult) -> Ordering {
        let by_score = match (self.score.is_nan(), other.score.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.score.partial_cmp(&other.score).unwrap_or(Ordering::Equal),
        };
        by_score.then_with(|| {
            magnitude(&other.deformation)
                .partial_cmp(&magnitude(&self.deformation))
                .unwrap_or(Ordering::Equal)
        })
    }
}

/// Fold `candidate` into the running best.
pub fn pick_better(current: Option<CorrelationResult>, candidate: CorrelationResult) -> CorrelationResult {
    match current {
        Some(c) if !candidate.is_better_than(&c) => c,
        _ => candidate,
    }
}
