// displacement.rs -- Dense displacement fields from per-facet results.
//
// Every facet with a result at or above the quality threshold votes for the
// displacement of each of its pixels: the facet's deformation evaluated at
// the pixel's offset from the facet center. A pixel covered by several
// facets takes the weighted mean of their votes,
//
//   w = score * exp(-r² / (2 σ²)),   σ = correlation weight of the facet
//
// with r the pixel's distance from the voting facet's center, so a facet
// speaks loudest about its own middle. Pixels without a vote stay undefined.
//
// Rows are independent: the field is filled with one rayon task per row,
// each walking only the facets that intersect it. The rows run on the pool
// given to `with_pool`, or on the caller's rayon context without one.

use std::sync::Arc;

use log::debug;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::config::correlation_weight;
use crate::deformation::apply_deformation;
use crate::task::container::RoiResult;

/// Per-pixel displacement `(u, v)`; `None` where no facet contributed.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementResult {
    width: usize,
    height: usize,
    data: Vec<Option<(f64, f64)>>,
}

impl DisplacementResult {
    /// Field with every pixel undefined.
    pub fn new(width: usize, height: usize) -> Self {
        DisplacementResult { width, height, data: vec![None; width * height] }
    }

    /// Same displacement everywhere.
    pub fn uniform(width: usize, height: usize, d: (f64, f64)) -> Self {
        DisplacementResult { width, height, data: vec![Some(d); width * height] }
    }

    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> Option<(f64, f64)>) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        DisplacementResult { width, height, data }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Displacement at `(x, y)`; `None` when undefined or outside the field.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<(f64, f64)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, d: Option<(f64, f64)>) {
        assert!(x < self.width && y < self.height, "({x}, {y}) out of bounds");
        self.data[y * self.width + x] = d;
    }

    pub fn as_slice(&self) -> &[Option<(f64, f64)>] {
        &self.data
    }

    pub fn defined_count(&self) -> usize {
        self.data.iter().filter(|d| d.is_some()).count()
    }

    /// Displacement at a sub-pixel position.
    ///
    /// Bilinear when all four neighbours are defined, otherwise the nearest
    /// pixel's value.
    pub fn sample(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if !(x >= 0.0 && y >= 0.0 && x <= (self.width as f64 - 1.0) && y <= (self.height as f64 - 1.0)) {
            return None;
        }
        let (x0, y0) = (x.floor() as usize, y.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(self.width - 1), (y0 + 1).min(self.height - 1));
        let (fx, fy) = (x - x0 as f64, y - y0 as f64);
        match (self.get(x0, y0), self.get(x1, y0), self.get(x0, y1), self.get(x1, y1)) {
            (Some(a), Some(b), Some(c), Some(d)) => {
                let lerp = |a: f64, b: f64, c: f64, d: f64| {
                    (1.0 - fx) * (1.0 - fy) * a + fx * (1.0 - fy) * b + (1.0 - fx) * fy * c + fx * fy * d
                };
                Some((lerp(a.0, b.0, c.0, d.0), lerp(a.1, b.1, c.1, d.1)))
            }
            _ => self.get(x.round() as usize, y.round() as usize),
        }
    }
}

/// Folds per-facet correlation results into a [`DisplacementResult`].
#[derive(Debug, Clone)]
pub struct DisplacementCalculator {
    /// Results scoring below this are ignored.
    pub result_quality: f64,
    /// Correlation weight coefficient; see [`correlation_weight`].
    pub correlation_weight: f64,
    pool: Option<Arc<ThreadPool>>,
}

struct Vote<'a> {
    center: (i64, i64),
    top: i64,
    left: i64,
    size: i64,
    score: f64,
    sigma2: f64,
    deformation: &'a [f64],
}

impl DisplacementCalculator {
    pub fn new(result_quality: f64, correlation_weight: f64) -> Self {
        DisplacementCalculator { result_quality, correlation_weight, pool: None }
    }

    /// Fill rows on `pool` instead of the caller's rayon context.
    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn compute(&self, width: usize, height: usize, rois: &[RoiResult]) -> DisplacementResult {
        match &self.pool {
            Some(pool) => pool.install(|| self.fill(width, height, rois)),
            None => self.fill(width, height, rois),
        }
    }

    fn fill(&self, width: usize, height: usize, rois: &[RoiResult]) -> DisplacementResult {
        let votes: Vec<Vote<'_>> = rois
            .iter()
            .flat_map(|roi| roi.facets.iter().zip(&roi.results))
            .filter_map(|(facet, result)| {
                let r = result.as_ref()?;
                if !(r.score >= self.result_quality) {
                    return None;
                }
                let (left, top) = facet.top_left();
                let sigma = correlation_weight(facet.size, self.correlation_weight).max(1) as f64;
                Some(Vote {
                    center: facet.center,
                    top,
                    left,
                    size: facet.size as i64,
                    score: r.score.max(f64::MIN_POSITIVE),
                    sigma2: sigma * sigma,
                    deformation: &r.deformation,
                })
            })
            .collect();

        let mut by_row: Vec<Vec<usize>> = vec![Vec::new(); height];
        for (i, v) in votes.iter().enumerate() {
            let y0 = v.top.max(0) as usize;
            let y1 = ((v.top + v.size).max(0) as usize).min(height);
            for row in &mut by_row[y0.min(y1)..y1] {
                row.push(i);
            }
        }

        let mut data = vec![None; width * height];
        if width > 0 {
            data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
                let mut acc = vec![(0.0f64, 0.0f64, 0.0f64); width];
                for v in by_row[y].iter().map(|&i| &votes[i]) {
                    let dy = y as i64 - v.center.1;
                    let x0 = v.left.max(0) as usize;
                    let x1 = ((v.left + v.size).max(0) as usize).min(width);
                    for (x, a) in acc.iter_mut().enumerate().take(x1).skip(x0) {
                        let dx = x as i64 - v.center.0;
                        let (du, dv) = apply_deformation(v.deformation, dx as f64, dy as f64);
                        let r2 = (dx * dx + dy * dy) as f64;
                        let weight = v.score * (-r2 / (2.0 * v.sigma2)).exp();
                        a.0 += weight * du;
                        a.1 += weight * dv;
                        a.2 += weight;
                    }
                }
                for (out, (su, sv, sw)) in row.iter_mut().zip(acc) {
                    if sw > 0.0 {
                        *out = Some((su / sw, sv / sw));
                    }
                }
            });
        }

        let result = DisplacementResult { width, height, data };
        debug!("displacement: {} votes, {} pixels defined", votes.len(), result.defined_count());
        result
    }
}

/// Compose two consecutive fields: a pixel moved by `first` is moved again
/// by `second` sampled at its new position.
pub fn chain(first: &DisplacementResult, second: &DisplacementResult) -> DisplacementResult {
    let width = first.width;
    let mut data = vec![None; first.data.len()];
    if width > 0 {
        data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = first.get(x, y).and_then(|(u1, v1)| {
                    second
                        .sample(x as f64 + u1, y as f64 + v1)
                        .map(|(u2, v2)| (u1 + u2, v1 + v2))
                });
            }
        });
    }
    DisplacementResult { width, height: first.height, data }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationResult;
    use crate::facet::Facet;
    use crate::roi::Roi;

    fn roi_result(facets: Vec<Facet>, results: Vec<Option<CorrelationResult>>) -> RoiResult {
        RoiResult { roi: Roi::full_image(40, 30), facets, results }
    }

    #[test]
    fn translation_fills_facet_pixels_only() {
        let rr = roi_result(
            vec![Facet::new(10, 10, 5)],
            vec![Some(CorrelationResult::new(0.9, vec![2.0, -1.0]))],
        );
        let d = DisplacementCalculator::new(0.5, 0.75).compute(40, 30, &[rr]);
        assert_eq!(d.get(10, 10), Some((2.0, -1.0)));
        assert_eq!(d.get(8, 12), Some((2.0, -1.0)));
        assert_eq!(d.get(7, 10), None);
        assert_eq!(d.defined_count(), 25);
    }

    #[test]
    fn dedicated_pool_gives_the_same_field() {
        let rr = roi_result(
            vec![Facet::new(10, 10, 7), Facet::new(14, 12, 7), Facet::new(30, 20, 7)],
            vec![
                Some(CorrelationResult::new(0.9, vec![1.0, 0.5])),
                Some(CorrelationResult::new(0.6, vec![-1.0, 0.0])),
                Some(CorrelationResult::new(0.8, vec![0.25, 2.0])),
            ],
        );
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        let calc = DisplacementCalculator::new(0.25, 0.75);
        let global = calc.compute(40, 30, std::slice::from_ref(&rr));
        let pooled = calc.with_pool(pool).compute(40, 30, &[rr]);
        assert_eq!(global, pooled);
        assert!(pooled.defined_count() > 0);
    }

    #[test]
    fn low_quality_results_do_not_vote() {
        let rr = roi_result(
            vec![Facet::new(10, 10, 5), Facet::new(20, 10, 5)],
            vec![Some(CorrelationResult::new(0.1, vec![1.0, 1.0])), None],
        );
        let d = DisplacementCalculator::new(0.25, 0.75).compute(40, 30, &[rr]);
        assert_eq!(d.defined_count(), 0);
    }

    #[test]
    fn first_order_gradient_is_evaluated_per_pixel() {
        let rr = roi_result(
            vec![Facet::new(10, 10, 5)],
            vec![Some(CorrelationResult::new(1.0, vec![0.0, 0.0, 0.1, 0.0, 0.0, 0.2]))],
        );
        let d = DisplacementCalculator::new(0.0, 0.75).compute(40, 30, &[rr]);
        let (u, v) = d.get(12, 9).unwrap();
        assert!((u - 0.2).abs() < 1e-12);
        assert!((v + 0.2).abs() < 1e-12);
    }

    #[test]
    fn overlapping_votes_are_averaged() {
        let rr = roi_result(
            vec![Facet::new(10, 10, 5), Facet::new(12, 10, 5)],
            vec![
                Some(CorrelationResult::new(1.0, vec![1.0, 0.0])),
                Some(CorrelationResult::new(1.0, vec![3.0, 0.0])),
            ],
        );
        let d = DisplacementCalculator::new(0.0, 0.75).compute(40, 30, &[rr]);
        // Equidistant from both centers: plain mean.
        let (u, _) = d.get(11, 10).unwrap();
        assert!((u - 2.0).abs() < 1e-12);
        // Closer to the first facet: pulled towards its vote.
        let (u, _) = d.get(10, 10).unwrap();
        assert!(u > 1.0 && u < 2.0, "{u}");
    }

    #[test]
    fn chained_translations_add_up() {
        let a = DisplacementResult::uniform(20, 20, (1.0, 0.5));
        let b = DisplacementResult::uniform(20, 20, (2.0, -1.0));
        let c = chain(&a, &b);
        assert_eq!(c.get(5, 5), Some((3.0, -0.5)));
        // Moved outside the second field.
        assert_eq!(c.get(19, 5), None);
    }

    #[test]
    fn sample_falls_back_to_nearest() {
        let mut f = DisplacementResult::uniform(4, 4, (1.0, 1.0));
        f.set(2, 1, None);
        assert_eq!(f.sample(1.5, 1.5), Some((1.0, 1.0)));
        assert_eq!(f.sample(1.9, 1.2), None);
        assert_eq!(f.sample(0.5, 2.5), Some((1.0, 1.0)));
    }
}
