// error.rs -- Crate-wide error type.
//
// Error classes and who handles them:
//
//   InvalidConfiguration / InvalidRoundOrder   surfaced to the caller, never retried
//   DeviceOutOfMemory                          recovered inside the solver by
//                                              re-splitting; surfaced only when the
//                                              splitter cannot shrink any further
//   DeviceComputationFailure                   fatal
//   InternalConsistency                        fatal; a splitter/solver bug
//
// Numerically singular strain fits are NOT errors. They produce an
// undefined value at that pixel.

use thiserror::Error;

use crate::gpu::device::GpuError;
use crate::kernel::BackendError;

#[derive(Error, Debug)]
pub enum DicError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("source round must be lower than target round (from {from}, to {to})")]
    InvalidRoundOrder { from: usize, to: usize },

    #[error("device computation failed: {0}")]
    DeviceComputationFailure(String),

    #[error("device out of memory: {0}")]
    DeviceOutOfMemory(String),

    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("no more elements")]
    NoMoreElements,

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl From<BackendError> for DicError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::OutOfMemory { requested, available } => DicError::DeviceOutOfMemory(
                format!("requested {requested} bytes, {available} available"),
            ),
            BackendError::Device(msg) => DicError::DeviceComputationFailure(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, DicError>;
