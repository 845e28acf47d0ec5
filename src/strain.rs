// strain.rs -- Strain from displacement by local least squares.
//
// For every pixel with a defined displacement, the defined neighbours within
// a Chebyshev radius of ceil(window / 2) (center included) are fitted with
// two planes through the offsets (Δx, Δy):
//
//   u ≈ a0 + a1·Δx + a2·Δy
//   v ≈ b0 + b1·Δx + b2·Δy
//
// and the slopes give the strain tensor in percent:
//
//   Exx = 100·a1    Eyy = 100·b2    Exy = 100·(a2 + b1) / 2
//
// The regression standard error of each plane, sqrt(SSR / (n - 3)), is kept
// per axis as a quality map. Fewer than four samples, or a singular normal
// matrix (samples on one line), leave the pixel undefined.
//
// Pixels are independent; rows are fitted in parallel on the worker pool.
// The stop flag is polled before each pixel; a stopped estimate returns the
// partially filled field marked incomplete.

use std::sync::Arc;

use log::debug;
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::displacement::DisplacementResult;
use crate::error::{DicError, Result};
use crate::stop::StopFlag;

/// Fitted slopes are scaled by this (strain in percent).
pub const COEFF_ADJUST: f64 = 100.0;

/// Quality value of pixels with too few neighbours.
const SPARSE_QUALITY: f64 = 1.0;

/// In-plane strain tensor at one pixel, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Strain {
    pub exx: f64,
    pub eyy: f64,
    pub exy: f64,
}

/// Strain field with per-axis regression standard errors.
#[derive(Debug, Clone, PartialEq)]
pub struct StrainResult {
    width: usize,
    height: usize,
    strain: Vec<Option<Strain>>,
    quality_u: Vec<f64>,
    quality_v: Vec<f64>,
}

impl StrainResult {
    fn empty(width: usize, height: usize) -> Self {
        StrainResult {
            width,
            height,
            strain: vec![None; width * height],
            quality_u: vec![f64::NAN; width * height],
            quality_v: vec![f64::NAN; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> Option<Strain> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.strain[y * self.width + x]
    }

    /// Standard errors of the u and v fits; NaN where no fit was attempted
    /// and outside the field.
    pub fn quality(&self, x: usize, y: usize) -> (f64, f64) {
        if x >= self.width || y >= self.height {
            return (f64::NAN, f64::NAN);
        }
        let i = y * self.width + x;
        (self.quality_u[i], self.quality_v[i])
    }

    pub fn defined_count(&self) -> usize {
        self.strain.iter().filter(|s| s.is_some()).count()
    }
}

/// Output of [`StrainEstimator::estimate`].
#[derive(Debug, Clone)]
pub struct StrainOutcome {
    pub result: StrainResult,
    /// False when a stop request interrupted the estimate.
    pub complete: bool,
}

/// Local least squares strain estimator.
pub struct StrainEstimator {
    pool: Option<Arc<ThreadPool>>,
    stop: StopFlag,
}

impl StrainEstimator {
    /// Estimator running on the global rayon pool.
    pub fn new(stop: StopFlag) -> Self {
        StrainEstimator { pool: None, stop }
    }

    /// Estimator running on a dedicated worker pool.
    pub fn with_pool(pool: Arc<ThreadPool>, stop: StopFlag) -> Self {
        StrainEstimator { pool: Some(pool), stop }
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Strain of `field`, the displacement from round `from` to round `to`.
    ///
    /// # Errors
    /// `InvalidRoundOrder` unless `from < to`.
    pub fn estimate(
        &self,
        field: &DisplacementResult,
        window: usize,
        from: usize,
        to: usize,
    ) -> Result<StrainOutcome> {
        if from >= to {
            return Err(DicError::InvalidRoundOrder { from, to });
        }
        let radius = window.div_ceil(2);
        let run = || self.estimate_rows(field, radius);
        let outcome = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };
        debug!(
            "strain {from}->{to}: {} of {} pixels defined, window {window}{}",
            outcome.result.defined_count(),
            field.defined_count(),
            if outcome.complete { "" } else { ", stopped" }
        );
        Ok(outcome)
    }

    fn estimate_rows(&self, field: &DisplacementResult, radius: usize) -> StrainOutcome {
        let (width, height) = (field.width(), field.height());
        let mut result = StrainResult::empty(width, height);
        if width == 0 {
            return StrainOutcome { result, complete: true };
        }

        let StrainResult { strain, quality_u, quality_v, .. } = &mut result;
        strain
            .par_chunks_mut(width)
            .zip(quality_u.par_chunks_mut(width))
            .zip(quality_v.par_chunks_mut(width))
            .enumerate()
            .for_each(|(y, ((s_row, qu_row), qv_row))| {
                for x in 0..width {
                    if self.stop.is_stopped() {
                        return;
                    }
                    if field.get(x, y).is_none() {
                        continue;
                    }
                    match fit(field, x, y, radius) {
                        Fit::Sparse => {
                            qu_row[x] = SPARSE_QUALITY;
                            qv_row[x] = SPARSE_QUALITY;
                        }
                        Fit::Singular => {}
                        Fit::Planes { a, b, err_u, err_v } => {
                            s_row[x] = Some(Strain {
                                exx: a[1] * COEFF_ADJUST,
                                eyy: b[2] * COEFF_ADJUST,
                                exy: 0.5 * (b[1] + a[2]) * COEFF_ADJUST,
                            });
                            qu_row[x] = err_u;
                            qv_row[x] = err_v;
                        }
                    }
                }
            });

        StrainOutcome { result, complete: !self.stop.is_stopped() }
    }
}

enum Fit {
    Sparse,
    Singular,
    Planes { a: Vector3<f64>, b: Vector3<f64>, err_u: f64, err_v: f64 },
}

/// Least squares planes of u and v around `(x, y)`.
fn fit(field: &DisplacementResult, x: usize, y: usize, radius: usize) -> Fit {
    let x0 = x.saturating_sub(radius);
    let y0 = y.saturating_sub(radius);
    let x1 = (x + radius).min(field.width() - 1);
    let y1 = (y + radius).min(field.height() - 1);

    let mut samples = Vec::with_capacity((x1 - x0 + 1) * (y1 - y0 + 1));
    for j in y0..=y1 {
        for i in x0..=x1 {
            if let Some(d) = field.get(i, j) {
                let basis = Vector3::new(1.0, i as f64 - x as f64, j as f64 - y as f64);
                samples.push((basis, d));
            }
        }
    }
    if samples.len() < 4 {
        return Fit::Sparse;
    }

    let mut ata = Matrix3::<f64>::zeros();
    let mut atu = Vector3::<f64>::zeros();
    let mut atv = Vector3::<f64>::zeros();
    for (basis, (u, v)) in &samples {
        ata += basis * basis.transpose();
        atu += basis * *u;
        atv += basis * *v;
    }
    let lu = ata.lu();
    let (Some(a), Some(b)) = (lu.solve(&atu), lu.solve(&atv)) else {
        return Fit::Singular;
    };

    let dof = (samples.len() - 3) as f64;
    let (mut ssr_u, mut ssr_v) = (0.0, 0.0);
    for (basis, (u, v)) in &samples {
        ssr_u += (u - a.dot(basis)).powi(2);
        ssr_v += (v - b.dot(basis)).powi(2);
    }
    Fit::Planes { a, b, err_u: (ssr_u / dof).sqrt(), err_v: (ssr_v / dof).sqrt() }
}
