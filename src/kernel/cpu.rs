// kernel/cpu.rs -- Reference correlation kernel on the CPU.
//
// Scores are zero-normalized cross-correlation (ZNCC) between the facet in
// image A and its deformed counterpart sampled from image B:
//
//              Σ (f - f̄)(g - ḡ)
//   ZNCC = ───────────────────────────
//          sqrt(Σ (f - f̄)² · Σ (g - ḡ)²)
//
// A window without intensity variance (on either side) carries no
// information and scores -1.
//
// `load` precomputes the zero-mean reference intensities of every facet
// once, so a dispatch only samples image B. A dispatch scores its batch of
// deformations in parallel, writing into disjoint score slots. Batches run
// on the pool handed to `use_thread_pool`, else on the caller's rayon
// context.
//
// `with_memory_limit` makes `load` fail with OutOfMemory above a byte
// threshold while `memory_budget` keeps reporting unlimited memory: a
// device that over-reports its capacity. Used to exercise the solver's
// re-split path without a GPU.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::deformation::{apply_deformation, DeformationLimits};
use crate::image::{sample, Image, Interpolation};
use crate::kernel::{BackendError, KernelKey, KernelProgram, TaskData};

/// Deformation batch granularity.
const BASE_UNIT: u64 = 64;

struct LoadedFacet {
    limits: Arc<DeformationLimits>,
    first_deformation: u64,
    result_offset: usize,
    /// Pixel coordinates relative to the facet center.
    offsets: Vec<(f64, f64)>,
    center: (f64, f64),
    /// f - f̄ for each pixel.
    reference: Vec<f64>,
    reference_norm: f64,
}

struct Loaded {
    image_b: Arc<Image<f32>>,
    facets: Vec<LoadedFacet>,
    scores: Vec<f32>,
}

/// CPU implementation of [`KernelProgram`].
pub struct CpuKernelProgram {
    key: Option<KernelKey>,
    memory_limit: Option<u64>,
    loaded: Option<Loaded>,
    pool: Option<Arc<ThreadPool>>,
}

impl CpuKernelProgram {
    pub fn new() -> Self {
        CpuKernelProgram { key: None, memory_limit: None, loaded: None, pool: None }
    }

    /// Fail loads whose score buffer exceeds `bytes`.
    pub fn with_memory_limit(bytes: u64) -> Self {
        CpuKernelProgram { memory_limit: Some(bytes), ..Self::new() }
    }

    fn interpolation(&self) -> Interpolation {
        self.key.map_or(Interpolation::default(), |k| k.interpolation)
    }
}

impl Default for CpuKernelProgram {
    fn default() -> Self {
        Self::new()
    }
}

/// ZNCC of one deformation against a prepared facet.
fn score(facet: &LoadedFacet, image_b: &Image<f32>, coeffs: &[f64], interpolation: Interpolation) -> f32 {
    let n = facet.offsets.len() as f64;
    let mut deformed = Vec::with_capacity(facet.offsets.len());
    let mut sum = 0.0f64;
    for &(dx, dy) in &facet.offsets {
        let (u, v) = apply_deformation(coeffs, dx, dy);
        let x = (facet.center.0 + dx + u) as f32;
        let y = (facet.center.1 + dy + v) as f32;
        let g = sample(image_b, x, y, interpolation) as f64;
        sum += g;
        deformed.push(g);
    }
    let mean = sum / n;

    let mut cross = 0.0f64;
    let mut norm = 0.0f64;
    for (g, f) in deformed.iter().zip(&facet.reference) {
        let g = g - mean;
        cross += f * g;
        norm += g * g;
    }
    if facet.reference_norm <= f64::EPSILON || norm <= f64::EPSILON {
        return -1.0;
    }
    (cross / (facet.reference_norm * norm).sqrt()) as f32
}

impl KernelProgram for CpuKernelProgram {
    fn name(&self) -> &str {
        "cpu"
    }

    fn prepare(&mut self, key: KernelKey) -> Result<(), BackendError> {
        self.key = Some(key);
        Ok(())
    }

    fn base_unit(&self) -> u64 {
        BASE_UNIT
    }

    fn max_batch(&self) -> u64 {
        u32::MAX as u64
    }

    fn memory_budget(&self) -> u64 {
        u64::MAX
    }

    fn load(&mut self, data: &TaskData<'_>) -> Result<(), BackendError> {
        let requested = data.layout.result_bytes();
        if let Some(limit) = self.memory_limit {
            if requested > limit {
                return Err(BackendError::OutOfMemory { requested, available: limit });
            }
        }

        let task = data.task;
        let facets = data
            .layout
            .slots
            .iter()
            .map(|slot| {
                let facet = &task.facets[slot.global];
                let (cx, cy) = (facet.center.0 as f64, facet.center.1 as f64);
                let mut offsets = Vec::with_capacity(facet.area());
                let mut values = Vec::with_capacity(facet.area());
                for (x, y) in facet.pixels() {
                    offsets.push((x as f64 - cx, y as f64 - cy));
                    values.push(task.image_a.get(x as usize, y as usize) as f64);
                }
                let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
                let reference: Vec<f64> = values.iter().map(|v| v - mean).collect();
                let reference_norm = reference.iter().map(|r| r * r).sum();
                LoadedFacet {
                    limits: task.limits[slot.global].clone(),
                    first_deformation: slot.deformations.start,
                    result_offset: slot.result_offset,
                    offsets,
                    center: (cx, cy),
                    reference,
                    reference_norm,
                }
            })
            .collect();

        self.loaded = Some(Loaded {
            image_b: task.image_b.clone(),
            facets,
            scores: vec![f32::NAN; data.layout.total],
        });
        Ok(())
    }

    fn dispatch(&mut self, slot: usize, base: u64, count: u64) -> Result<Duration, BackendError> {
        let interpolation = self.interpolation();
        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| BackendError::Device("dispatch without a loaded task".into()))?;
        let facet = loaded
            .facets
            .get(slot)
            .ok_or_else(|| BackendError::Device(format!("no facet slot {slot}")))?;
        let start = facet.result_offset + base as usize;
        let out = loaded
            .scores
            .get_mut(start..start + count as usize)
            .ok_or_else(|| BackendError::Device(format!("batch [{base}, +{count}) out of range")))?;

        let started = Instant::now();
        let image_b = &loaded.image_b;
        let mut run = || {
            out.par_iter_mut().enumerate().for_each_init(Vec::new, |coeffs, (j, s)| {
                let index = facet.first_deformation + base + j as u64;
                facet.limits.deformation_into(index, coeffs);
                *s = score(facet, image_b, coeffs, interpolation);
            })
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
        Ok(started.elapsed())
    }

    fn read_scores(&mut self) -> Result<Vec<f32>, BackendError> {
        self.loaded
            .as_ref()
            .map(|l| l.scores.clone())
            .ok_or_else(|| BackendError::Device("no loaded task".into()))
    }

    fn release(&mut self) {
        self.loaded = None;
    }

    fn use_thread_pool(&mut self, pool: Arc<ThreadPool>) {
        self.pool = Some(pool);
    }
}
