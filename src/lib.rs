// dicer: Digital Image Correlation with an adaptive GPU correlation pipeline
//
// Pipeline, one round per consecutive image pair:
//
//   images -> pre-filter -> facets per ROI -> CorrelationSolver
//          -> DisplacementCalculator -> StrainEstimator (background)
//
// The solver searches a discrete deformation space per facet on a
// KernelProgram backend: the rayon CPU reference (`kernel::cpu`) or the
// wgpu compute shader (`gpu::correlation`). Sub-task sizes adapt to
// device memory and measured dispatch latency.

pub mod error;
pub mod image;
pub mod convolution;
pub mod roi;
pub mod facet;
pub mod deformation;
pub mod correlation;
pub mod stop;
pub mod config;
pub mod task;
pub mod kernel;
pub mod gpu;
pub mod solver;
pub mod displacement;
pub mod strain;
pub mod engine;
