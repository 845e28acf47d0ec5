// config.rs -- Task parameters and their defaults.
//
// `TaskParameters` is what a user or config file declares; every field is
// optional and the struct deserializes from partial documents. `resolve`
// is the single place defaults are applied and structural errors are
// reported. The result, `TaskSettings`, has no optional fields and is what
// the engine works from.
//
// Round limits are inclusive image indices: `(0, 3)` correlates the pairs
// (0,1), (1,2), (2,3).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::deformation::DeformationLimits;
use crate::error::{DicError, Result};
use crate::image::Interpolation;
use crate::task::splitter::SplitPolicy;

/// Default values applied by [`TaskParameters::resolve`].
pub mod defaults {
    pub const FACET_SIZE: usize = 10;
    pub const FACET_SPACING: usize = 1;
    pub const FILTER_KERNEL_SIZE: usize = 5;
    pub const CORRELATION_WEIGHT: f64 = 0.75;
    pub const RESULT_QUALITY: f64 = 0.25;
    /// Strain window edge in millimetres.
    pub const STRAIN_WINDOW_MM: f64 = 20.0;
    pub const MM_TO_PX: f64 = 1.0;
    /// 16 Mi scores (64 MiB of f32) per sub-task.
    pub const SPLIT_TARGET_ELEMENTS: u64 = 1 << 24;
    /// Translation-only search space.
    pub const LIMITS_ZERO: [f64; 6] = [-5.0, 5.0, 0.5, -5.0, 5.0, 0.5];
    /// Translation plus displacement gradients.
    pub const LIMITS_FIRST: [f64; 18] = [
        -5.0, 5.0, 0.5, -5.0, 5.0, 0.5,
        -0.05, 0.05, 0.05, -0.05, 0.05, 0.05, -0.05, 0.05, 0.05, -0.05, 0.05, 0.05,
    ];
    /// Fine search sampling relative to the coarse step.
    pub const FINE_SEARCH_DIVISOR: f64 = 10.0;
}

/// Declared task parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskParameters {
    pub round_limits: Option<(usize, usize)>,
    pub facet_size: Option<usize>,
    pub facet_spacing: Option<usize>,
    pub deformation_limits: Option<Vec<f64>>,
    pub interpolation: Option<Interpolation>,
    pub split_policy: Option<SplitPolicy>,
    pub filter_kernel_size: Option<usize>,
    pub correlation_weight: Option<f64>,
    pub result_quality: Option<f64>,
    pub strain_window_mm: Option<f64>,
    pub mm_to_px: Option<f64>,
    pub fine_search: Option<bool>,
    pub compute_strain: Option<bool>,
}

/// Fully resolved parameters.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// `(from, to)` image pairs in execution order.
    pub rounds: Vec<(usize, usize)>,
    pub facet_size: usize,
    pub facet_spacing: usize,
    pub limits: Arc<DeformationLimits>,
    pub interpolation: Interpolation,
    pub split_policy: SplitPolicy,
    pub filter_kernel_size: usize,
    pub correlation_weight: f64,
    pub result_quality: f64,
    /// Strain window edge in pixels.
    pub strain_window: usize,
    pub mm_to_px: f64,
    pub fine_search: bool,
    pub compute_strain: bool,
}

impl TaskSettings {
    /// First image index of the task; the reference of cumulative results.
    pub fn first_round(&self) -> usize {
        self.rounds.first().map_or(0, |r| r.0)
    }
}

impl TaskParameters {
    /// Apply defaults and validate against the number of input images.
    pub fn resolve(&self, image_count: usize) -> Result<TaskSettings> {
        if image_count < 2 {
            return Err(invalid(format!("need at least two images, got {image_count}")));
        }

        let (first, last) = self.round_limits.unwrap_or((0, image_count - 1));
        if first >= last || last >= image_count {
            return Err(invalid(format!(
                "illegal round limits ({first}, {last}) for {image_count} images"
            )));
        }
        let rounds = (first..last).map(|r| (r, r + 1)).collect();

        let facet_size = self.facet_size.unwrap_or(defaults::FACET_SIZE);
        if facet_size == 0 {
            return Err(invalid("facet size must be positive".into()));
        }
        let facet_spacing = self.facet_spacing.unwrap_or(defaults::FACET_SPACING);
        if facet_spacing >= facet_size {
            return Err(invalid(format!(
                "facet spacing ({facet_spacing}) must be smaller than facet size ({facet_size})"
            )));
        }

        let limits = match &self.deformation_limits {
            Some(flat) => DeformationLimits::new(flat)?,
            None => DeformationLimits::new(&defaults::LIMITS_FIRST)?,
        };

        let correlation_weight = self.correlation_weight.unwrap_or(defaults::CORRELATION_WEIGHT);
        if !(correlation_weight.is_finite() && correlation_weight > 0.0) {
            return Err(invalid(format!("correlation weight must be positive, got {correlation_weight}")));
        }
        let result_quality = self.result_quality.unwrap_or(defaults::RESULT_QUALITY);
        if !(-1.0..=1.0).contains(&result_quality) {
            return Err(invalid(format!("result quality must lie in [-1, 1], got {result_quality}")));
        }
        let mm_to_px = self.mm_to_px.unwrap_or(defaults::MM_TO_PX);
        if !(mm_to_px.is_finite() && mm_to_px > 0.0) {
            return Err(invalid(format!("mm-to-px ratio must be positive, got {mm_to_px}")));
        }
        let strain_mm = self.strain_window_mm.unwrap_or(defaults::STRAIN_WINDOW_MM);
        if !(strain_mm.is_finite() && strain_mm > 0.0) {
            return Err(invalid(format!("strain window must be positive, got {strain_mm}")));
        }

        let split_policy = self.split_policy.unwrap_or_default();
        if let SplitPolicy::Static { facets_per_task: 0 } | SplitPolicy::Dynamic { target_elements: 0 } =
            split_policy
        {
            return Err(invalid(format!("split parameter must be positive: {split_policy:?}")));
        }

        Ok(TaskSettings {
            rounds,
            facet_size,
            facet_spacing,
            limits: Arc::new(limits),
            interpolation: self.interpolation.unwrap_or_default(),
            split_policy,
            filter_kernel_size: self.filter_kernel_size.unwrap_or(defaults::FILTER_KERNEL_SIZE),
            correlation_weight,
            result_quality,
            strain_window: (strain_mm * mm_to_px).ceil() as usize,
            mm_to_px,
            fine_search: self.fine_search.unwrap_or(false),
            compute_strain: self.compute_strain.unwrap_or(true),
        })
    }
}

/// Integer correlation weight of a facet: `round(size * coefficient * 3.2)`.
pub fn correlation_weight(facet_size: usize, coefficient: f64) -> u32 {
    (facet_size as f64 * coefficient * 3.2).round() as u32
}

fn invalid(msg: String) -> DicError {
    DicError::InvalidConfiguration(msg)
}
