// deformation.rs -- Deformation search space.
//
// A deformation is a coefficient vector mapping a facet pixel offset
// (dx, dy) from the facet center to a displacement. The search space of one
// ROI is a flat list of (min, max, step) triples, one per coefficient. Its
// length selects the deformation degree:
//
//   length  degree  coefficients
//   6       Zero    u v
//   18      First   u v ux uy vx vy
//   36      Second  u v ux uy vx vy uxx uyy uxy vxx vyy vxy
//
// Every candidate deformation has a linear index in
// [0, DeformationLimits::count()). The index is a mixed-radix number where
// the first coefficient varies fastest:
//
//   index = i0 + n0 * (i1 + n1 * (i2 + ...))
//   coeff_k = min_k + i_k * step_k
//
// The GPU kernel decodes indices with the same rule (shaders/correlation.wgsl).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DicError, Result};

/// Polynomial order of the displacement model inside a facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeformationDegree {
    Zero,
    First,
    Second,
}

impl DeformationDegree {
    /// Resolve the degree from a flat limits array length.
    pub fn from_limits_len(len: usize) -> Result<Self> {
        match len {
            6 => Ok(DeformationDegree::Zero),
            18 => Ok(DeformationDegree::First),
            36 => Ok(DeformationDegree::Second),
            other => Err(DicError::InvalidConfiguration(format!(
                "illegal deformation limits length {other} (expected 6, 18 or 36)"
            ))),
        }
    }

    /// Number of deformation coefficients.
    pub fn coeff_count(self) -> usize {
        match self {
            DeformationDegree::Zero => 2,
            DeformationDegree::First => 6,
            DeformationDegree::Second => 12,
        }
    }
}

impl fmt::Display for DeformationDegree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeformationDegree::Zero => write!(f, "zero"),
            DeformationDegree::First => write!(f, "first"),
            DeformationDegree::Second => write!(f, "second"),
        }
    }
}

/// Slack for step counts whose quotient lands just below an integer.
const STEP_TOLERANCE: f64 = 1e-9;

/// One coefficient's search range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Range {
    /// Number of samples in `[min, max]`. A step that does not divide the
    /// range stops at the last sample below `max`.
    pub fn step_count(&self) -> u64 {
        if self.step == 0.0 || self.max == self.min {
            1
        } else {
            ((self.max - self.min) / self.step + STEP_TOLERANCE).floor() as u64 + 1
        }
    }

    /// Sample `i`, clamped so rounding never leaves the range.
    #[inline]
    pub fn value(&self, i: u64) -> f64 {
        (self.min + i as f64 * self.step).min(self.max)
    }
}

/// Validated deformation search space of one ROI.
#[derive(Debug, Clone, PartialEq)]
pub struct DeformationLimits {
    degree: DeformationDegree,
    ranges: Vec<Range>,
    counts: Vec<u64>,
    total: u64,
}

impl DeformationLimits {
    /// Build from a flat `[min, max, step]*` array.
    ///
    /// # Errors
    /// `InvalidConfiguration` when the length does not map to a degree,
    /// a value is not finite, `min > max`, a step is negative, a non-empty
    /// range has a zero step, or the space has more than `u32::MAX` points
    /// (the GPU addresses deformations with 32-bit indices).
    pub fn new(flat: &[f64]) -> Result<Self> {
        let degree = DeformationDegree::from_limits_len(flat.len())?;
        let mut ranges = Vec::with_capacity(flat.len() / 3);
        let mut counts = Vec::with_capacity(flat.len() / 3);
        let mut total: u64 = 1;

        for (k, t) in flat.chunks_exact(3).enumerate() {
            let r = Range { min: t[0], max: t[1], step: t[2] };
            if !(r.min.is_finite() && r.max.is_finite() && r.step.is_finite()) {
                return Err(DicError::InvalidConfiguration(format!(
                    "deformation limit {k} is not finite: {r:?}"
                )));
            }
            if r.min > r.max || r.step < 0.0 || (r.max > r.min && r.step == 0.0) {
                return Err(DicError::InvalidConfiguration(format!(
                    "malformed deformation limit {k}: {r:?}"
                )));
            }
            let n = r.step_count();
            total = total
                .checked_mul(n)
                .filter(|t| *t <= u32::MAX as u64)
                .ok_or_else(|| {
                    DicError::InvalidConfiguration("deformation space exceeds 2^32 points".into())
                })?;
            ranges.push(r);
            counts.push(n);
        }

        Ok(DeformationLimits { degree, ranges, counts, total })
    }

    /// Zero-degree limits: u in `u`, v in `v`.
    pub fn translation(u: (f64, f64, f64), v: (f64, f64, f64)) -> Result<Self> {
        Self::new(&[u.0, u.1, u.2, v.0, v.1, v.2])
    }

    #[inline]
    pub fn degree(&self) -> DeformationDegree {
        self.degree
    }

    #[inline]
    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Samples per coefficient.
    #[inline]
    pub fn step_counts(&self) -> &[u64] {
        &self.counts
    }

    /// Total number of candidate deformations.
    #[inline]
    pub fn count(&self) -> u64 {
        self.total
    }

    /// Flat `[min, max, step]*` representation.
    pub fn to_flat(&self) -> Vec<f64> {
        self.ranges.iter().flat_map(|r| [r.min, r.max, r.step]).collect()
    }

    /// Decode a linear deformation index into its coefficient vector.
    pub fn deformation(&self, index: u64) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.ranges.len());
        self.deformation_into(index, &mut out);
        out
    }

    /// Allocation-free variant of [`deformation`](Self::deformation).
    pub fn deformation_into(&self, mut index: u64, out: &mut Vec<f64>) {
        debug_assert!(index < self.total);
        out.clear();
        for (r, &n) in self.ranges.iter().zip(&self.counts) {
            out.push(r.value(index % n));
            index /= n;
        }
    }

    /// Finer search space around `best`.
    ///
    /// Translation ranges become `best ± step` sampled at `step / divisor`;
    /// higher-order coefficients are pinned at `best`. A translation whose
    /// coarse step was zero stays pinned.
    pub fn refined_around(&self, best: &[f64], divisor: f64) -> Result<Self> {
        if best.len() != self.ranges.len() {
            return Err(DicError::InternalConsistency(format!(
                "deformation has {} coefficients, limits expect {}",
                best.len(),
                self.ranges.len()
            )));
        }
        let mut flat = Vec::with_capacity(self.ranges.len() * 3);
        for (k, (r, &b)) in self.ranges.iter().zip(best).enumerate() {
            if k < 2 && r.step > 0.0 {
                let fine = r.step / divisor;
                flat.extend_from_slice(&[b - r.step, b + r.step, fine]);
            } else {
                flat.extend_from_slice(&[b, b, 0.0]);
            }
        }
        Self::new(&flat)
    }
}

/// Displacement of the facet pixel at offset (dx, dy) from the facet center.
#[inline]
pub fn apply_deformation(coeffs: &[f64], dx: f64, dy: f64) -> (f64, f64) {
    let mut u = coeffs[0];
    let mut v = coeffs[1];
    if coeffs.len() >= 6 {
        u += coeffs[2] * dx + coeffs[3] * dy;
        v += coeffs[4] * dx + coeffs[5] * dy;
    }
    if coeffs.len() >= 12 {
        u += 0.5 * coeffs[6] * dx * dx + 0.5 * coeffs[7] * dy * dy + coeffs[8] * dx * dy;
        v += 0.5 * coeffs[9] * dx * dx + 0.5 * coeffs[10] * dy * dy + coeffs[11] * dx * dy;
    }
    (u, v)
}

/// Euclidean norm of a deformation vector.
#[inline]
pub fn magnitude(coeffs: &[f64]) -> f64 {
    coeffs.iter().map(|c| c * c).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degree_from_length() {
        assert_eq!(DeformationDegree::from_limits_len(6).unwrap(), DeformationDegree::Zero);
        assert_eq!(DeformationDegree::from_limits_len(18).unwrap(), DeformationDegree::First);
        assert_eq!(DeformationDegree::from_limits_len(36).unwrap(), DeformationDegree::Second);
        for bad in [0, 3, 5, 7, 12, 24, 35, 37] {
            assert!(matches!(
                DeformationDegree::from_limits_len(bad),
                Err(DicError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn step_counts_and_total() {
        let l = DeformationLimits::new(&[-1.0, 1.0, 0.5, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(l.step_counts(), &[5, 1]);
        assert_eq!(l.count(), 5);
    }

    #[test]
    fn step_count_tolerates_rounding() {
        // 0.3 / 0.1 is 2.9999999999999996 in binary floating point.
        let r = Range { min: 0.0, max: 0.3, step: 0.1 };
        assert_eq!(r.step_count(), 4);
    }

    #[test]
    fn first_coefficient_varies_fastest() {
        let l = DeformationLimits::new(&[0.0, 2.0, 1.0, 10.0, 11.0, 1.0]).unwrap();
        assert_eq!(l.count(), 6);
        assert_eq!(l.deformation(0), vec![0.0, 10.0]);
        assert_eq!(l.deformation(1), vec![1.0, 10.0]);
        assert_eq!(l.deformation(2), vec![2.0, 10.0]);
        assert_eq!(l.deformation(3), vec![0.0, 11.0]);
        assert_eq!(l.deformation(5), vec![2.0, 11.0]);
    }

    #[test]
    fn malformed_limits_are_rejected() {
        for flat in [
            vec![1.0, 0.0, 0.1, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, -0.1, 0.0, 0.0, 0.0],
            vec![f64::NAN, 1.0, 0.1, 0.0, 0.0, 0.0],
        ] {
            assert!(matches!(
                DeformationLimits::new(&flat),
                Err(DicError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn oversized_space_is_rejected() {
        let mut flat = vec![];
        for _ in 0..6 {
            flat.extend_from_slice(&[0.0, 99.0, 1.0]);
        }
        // 100^6 = 1e12 > 2^32
        assert!(DeformationLimits::new(&flat).is_err());
    }

    #[test]
    fn apply_first_order() {
        let c = [1.0, 2.0, 0.1, 0.0, 0.0, 0.2];
        let (u, v) = apply_deformation(&c, 10.0, 5.0);
        assert!((u - 2.0).abs() < 1e-12);
        assert!((v - 3.0).abs() < 1e-12);
    }

    #[test]
    fn apply_second_order() {
        let mut c = [0.0; 12];
        c[6] = 0.02; // uxx
        c[11] = 0.1; // vxy
        let (u, v) = apply_deformation(&c, 3.0, 2.0);
        assert!((u - 0.5 * 0.02 * 9.0).abs() < 1e-12);
        assert!((v - 0.1 * 6.0).abs() < 1e-12);
    }

    #[test]
    fn samples_stay_inside_non_dividing_ranges() {
        for flat in [[0.0, 1.0, 0.4, 0.0, 0.0, 0.0], [-1.0, 1.0, 0.3, -0.5, 0.5, 0.35]] {
            let l = DeformationLimits::new(&flat).unwrap();
            for i in 0..l.count() {
                for (k, (c, r)) in l.deformation(i).iter().zip(l.ranges()).enumerate() {
                    assert!(*c >= r.min && *c <= r.max, "limits {flat:?}: coefficient {k} = {c}");
                }
            }
        }
        let l = DeformationLimits::new(&[0.0, 1.0, 0.4, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(l.step_counts(), &[3, 1]);
        assert_eq!(l.ranges()[0].value(2), 0.8);
    }

    #[test]
    fn refined_space_stays_inside_its_bounds() {
        let coarse = DeformationLimits::new(&[-1.0, 1.0, 0.3, -1.0, 1.0, 0.3]).unwrap();
        let fine = coarse.refined_around(&[0.2, -0.4], 7.0).unwrap();
        for i in 0..fine.count() {
            let d = fine.deformation(i);
            assert!(d[0] >= 0.2 - 0.3 - 1e-12 && d[0] <= 0.2 + 0.3 + 1e-12, "{d:?}");
            assert!(d[1] >= -0.4 - 0.3 - 1e-12 && d[1] <= -0.4 + 0.3 + 1e-12, "{d:?}");
        }
        for (r, &n) in fine.ranges().iter().zip(fine.step_counts()) {
            assert!(r.min + (n - 1) as f64 * r.step <= r.max + 1e-12);
        }
    }

    #[test]
    fn magnitude_is_euclidean() {
        assert!((magnitude(&[3.0, 4.0]) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn refine_pins_gradients() {
        let mut flat = vec![-2.0, 2.0, 1.0, -2.0, 2.0, 1.0];
        flat.extend_from_slice(&[-0.1, 0.1, 0.05].repeat(4));
        let coarse = DeformationLimits::new(&flat).unwrap();
        let fine = coarse.refined_around(&[1.0, -1.0, 0.05, 0.0, 0.0, -0.05], 10.0).unwrap();
        assert_eq!(fine.degree(), DeformationDegree::First);
        assert_eq!(fine.step_counts(), &[21, 21, 1, 1, 1, 1]);
        assert_eq!(fine.deformation(0)[0], 0.0);
        assert_eq!(fine.deformation(0)[2], 0.05);
    }
}
