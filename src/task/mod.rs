// task/mod.rs -- Correlation workloads.
//
// FullTask is the whole workload of one ROI in one round: an image pair, the
// ordered facet list and, aligned by index, a weight and a deformation
// search space per facet.
//
// ComputationTask is one slice of a FullTask sized to fit the device. It
// never copies facets; it names a contiguous range of facet indices and,
// optionally, a sub-range of the deformation space of a single facet.
//
//   DeformationSpan::Full                         every facet in `facets`,
//                                                 whole deformation space
//   DeformationSpan::Partial { range, last }      exactly one facet, only
//                                                 deformations in `range`
//
// The facet index IS the identity used to fold results back into the
// global answer. Two facets with equal geometry in one FullTask would make
// their results indistinguishable to a consumer, so they are rejected.

pub mod container;
pub mod splitter;

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use crate::deformation::{DeformationDegree, DeformationLimits};
use crate::error::{DicError, Result};
use crate::facet::Facet;
use crate::image::Image;

/// Complete correlation workload for one ROI of one round.
#[derive(Debug, Clone)]
pub struct FullTask {
    pub image_a: Arc<Image<f32>>,
    pub image_b: Arc<Image<f32>>,
    pub facets: Vec<Facet>,
    pub weights: Vec<u32>,
    pub limits: Vec<Arc<DeformationLimits>>,
}

impl FullTask {
    /// Build a task, checking that the per-facet lists are aligned and
    /// every facet lies inside the reference image.
    pub fn new(
        image_a: Arc<Image<f32>>,
        image_b: Arc<Image<f32>>,
        facets: Vec<Facet>,
        weights: Vec<u32>,
        limits: Vec<Arc<DeformationLimits>>,
    ) -> Result<Self> {
        if facets.len() != weights.len() || facets.len() != limits.len() {
            return Err(DicError::InvalidConfiguration(format!(
                "facet/weight/limit arity mismatch: {}/{}/{}",
                facets.len(),
                weights.len(),
                limits.len()
            )));
        }
        if (image_a.width(), image_a.height()) != (image_b.width(), image_b.height()) {
            return Err(DicError::InvalidConfiguration(format!(
                "image size mismatch: {}x{} vs {}x{}",
                image_a.width(),
                image_a.height(),
                image_b.width(),
                image_b.height()
            )));
        }
        if let Some(f) = facets.iter().find(|f| !f.fits_in(image_a.width(), image_a.height())) {
            return Err(DicError::InvalidConfiguration(format!(
                "facet {f:?} exceeds the {}x{} image",
                image_a.width(),
                image_a.height()
            )));
        }
        Ok(FullTask { image_a, image_b, facets, weights, limits })
    }

    /// Same search space and weight for every facet.
    pub fn uniform(
        image_a: Arc<Image<f32>>,
        image_b: Arc<Image<f32>>,
        facets: Vec<Facet>,
        weight: u32,
        limits: Arc<DeformationLimits>,
    ) -> Result<Self> {
        let n = facets.len();
        Self::new(image_a, image_b, facets, vec![weight; n], vec![limits; n])
    }

    #[inline]
    pub fn facet_count(&self) -> usize {
        self.facets.len()
    }

    /// Common deformation degree of all facets, `None` for an empty task.
    pub fn degree(&self) -> Result<Option<DeformationDegree>> {
        let mut degree = None;
        for l in &self.limits {
            match degree {
                None => degree = Some(l.degree()),
                Some(d) if d != l.degree() => {
                    return Err(DicError::InvalidConfiguration(format!(
                        "facets mix {d} and {} degree deformation limits",
                        l.degree()
                    )))
                }
                _ => {}
            }
        }
        Ok(degree)
    }

    /// Reject facets that are equal by value.
    pub fn check_unique_facets(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.facets.len());
        for (i, f) in self.facets.iter().enumerate() {
            if !seen.insert(*f) {
                return Err(DicError::InternalConsistency(format!(
                    "duplicate facet at index {i}: {f:?}"
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn deformation_count(&self, facet: usize) -> u64 {
        self.limits[facet].count()
    }
}

/// Which part of the deformation space a ComputationTask covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeformationSpan {
    Full,
    /// Sub-range of a single facet's space; `last` marks the final chunk
    /// of that facet.
    Partial { range: Range<u64>, last: bool },
}

/// One device-sized slice of a FullTask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationTask {
    /// Global facet indices covered by this task.
    pub facets: Range<usize>,
    pub span: DeformationSpan,
}

impl ComputationTask {
    pub fn full(facets: Range<usize>) -> Self {
        ComputationTask { facets, span: DeformationSpan::Full }
    }

    pub fn partial(facet: usize, range: Range<u64>, last: bool) -> Self {
        ComputationTask { facets: facet..facet + 1, span: DeformationSpan::Partial { range, last } }
    }

    /// Whether this task covers only part of one facet's deformation space.
    #[inline]
    pub fn is_subtask(&self) -> bool {
        matches!(self.span, DeformationSpan::Partial { .. })
    }

    /// Deformation index range evaluated for global facet `facet`.
    pub fn deformation_range(&self, task: &FullTask, facet: usize) -> Range<u64> {
        match &self.span {
            DeformationSpan::Full => 0..task.deformation_count(facet),
            DeformationSpan::Partial { range, .. } => range.clone(),
        }
    }

    /// Number of (facet, deformation) pairs in this task.
    pub fn element_count(&self, task: &FullTask) -> u64 {
        self.facets
            .clone()
            .map(|f| {
                let r = self.deformation_range(task, f);
                r.end - r.start
            })
            .sum()
    }
}
