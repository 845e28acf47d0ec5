// facet.rs -- Facets (subsets) and the equal-spacing facet generator.
//
// A facet is a square patch of `size x size` pixels. Its position in the
// list handed to the solver is its identity: the solver and splitter only
// ever talk about facet indices, never compare facets by value.
//
// GENERATOR LAYOUT:
// Facets are laid out on a regular grid over the ROI bounding box with a
// step of `size - spacing` (neighbouring facets overlap by `spacing`
// pixels). The grid is centered in the bounding box and facets that do not
// lie entirely inside the ROI (corners of a circle) are dropped.
//
//   roi width  = W,  step = size - spacing
//   count      = (W - spacing) / step
//   gap        = (W - (step * count + spacing)) / 2

use log::debug;

use crate::error::{DicError, Result};
use crate::roi::Roi;
use crate::task::container::TaskContainer;

/// A square image patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Facet {
    /// Center pixel. For even sizes this is the pixel just right/below the
    /// geometric center.
    pub center: (i64, i64),
    pub size: usize,
}

impl Facet {
    pub fn new(center_x: i64, center_y: i64, size: usize) -> Self {
        Facet { center: (center_x, center_y), size }
    }

    /// Top-left pixel of the patch.
    #[inline]
    pub fn top_left(&self) -> (i64, i64) {
        let half = (self.size / 2) as i64;
        (self.center.0 - half, self.center.1 - half)
    }

    /// Number of pixels in the patch.
    #[inline]
    pub fn area(&self) -> usize {
        self.size * self.size
    }

    /// Absolute pixel coordinates in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = (i64, i64)> {
        let (x0, y0) = self.top_left();
        let s = self.size as i64;
        (0..s * s).map(move |i| (x0 + i % s, y0 + i / s))
    }

    /// Whether the patch lies inside a `width x height` image.
    pub fn fits_in(&self, width: usize, height: usize) -> bool {
        let (x0, y0) = self.top_left();
        let s = self.size as i64;
        x0 >= 0 && y0 >= 0 && x0 + s <= width as i64 && y0 + s <= height as i64
    }
}

/// Produces the facets of every ROI of one round.
///
/// The returned outer vector follows the ROI order of
/// `TaskContainer::round_rois(round)`. Calls with identical inputs must
/// return identical, identically ordered lists.
pub trait FacetGenerator: Send + Sync {
    fn generate(&self, container: &TaskContainer, round: usize) -> Result<Vec<Vec<Facet>>>;
}

/// Regular grid of overlapping facets.
#[derive(Debug, Clone, Copy)]
pub struct EqualSpacingGenerator {
    pub spacing: usize,
}

impl EqualSpacingGenerator {
    pub fn new(spacing: usize) -> Self {
        EqualSpacingGenerator { spacing }
    }

    /// Facets covering a single ROI.
    pub fn facets_for(&self, roi: &Roi, facet_size: usize) -> Result<Vec<Facet>> {
        if facet_size == 0 {
            return Err(DicError::InvalidConfiguration("facet size must be positive".into()));
        }
        if self.spacing >= facet_size {
            return Err(DicError::InvalidConfiguration(format!(
                "facet spacing ({}) must be smaller than facet size ({facet_size})",
                self.spacing
            )));
        }

        let (x1, y1, x2, y2) = roi.bounds();
        let roi_w = (x2 - x1 + 1).max(0) as usize;
        let roi_h = (y2 - y1 + 1).max(0) as usize;
        if roi_w < facet_size || roi_h < facet_size {
            return Ok(Vec::new());
        }

        let step = facet_size - self.spacing;
        let w_count = (roi_w - self.spacing) / step;
        let h_count = (roi_h - self.spacing) / step;
        let gap_x = ((roi_w - (step * w_count + self.spacing)) / 2) as i64;
        let gap_y = ((roi_h - (step * h_count + self.spacing)) / 2) as i64;
        let half = (facet_size / 2) as i64;

        let mut facets = Vec::with_capacity(w_count * h_count);
        for gy in 0..h_count {
            let cy = y1 + gap_y + half + (gy * step) as i64;
            for gx in 0..w_count {
                let cx = x1 + gap_x + half + (gx * step) as i64;
                let facet = Facet::new(cx, cy, facet_size);
                let (tx, ty) = facet.top_left();
                if roi.contains_square(tx, ty, facet_size) {
                    facets.push(facet);
                }
            }
        }
        Ok(facets)
    }
}

impl Default for EqualSpacingGenerator {
    fn default() -> Self {
        EqualSpacingGenerator::new(crate::config::defaults::FACET_SPACING)
    }
}

impl FacetGenerator for EqualSpacingGenerator {
    fn generate(&self, container: &TaskContainer, round: usize) -> Result<Vec<Vec<Facet>>> {
        let mut out = Vec::new();
        for settings in container.round_rois(round) {
            let facets = self.facets_for(&settings.roi, settings.facet_size)?;
            debug!("round {round}: {} facets for {:?}", facets.len(), settings.roi);
            out.push(facets);
        }
        Ok(out)
    }
}
