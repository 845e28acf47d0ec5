// kernel/mod.rs -- Compute backend abstraction and the shared dispatch loop.
//
// A KernelProgram evaluates the correlation score of facet/deformation
// pairs. Two implementations exist:
//
//   kernel::cpu::CpuKernelProgram      rayon, f64, the reference
//   gpu::correlation::GpuKernelProgram wgpu compute shader
//
// Lifecycle per solve:
//
//   prepare(key)                once; selects/compiles the variant
//   for each ComputationTask:
//       load(data)              allocate + upload, sized for this task
//       dispatch(...)*          driven by run_kernel
//       read_scores()
//       release()               always, also on error (LoadedTask guard)
//   finish()                    drop per-solve caches (uploaded images)
//
// ERROR CLASSES:
// Backends decide once, at the device boundary, whether a failure is memory
// exhaustion (BackendError::OutOfMemory, recoverable by re-splitting) or
// anything else (BackendError::Device, fatal). Nothing above this layer
// inspects error strings.
//
// RESULT LAYOUT:
// Scores of a loaded task live in one flat buffer. Facet slot k owns
// `layout.slots[k].len()` consecutive scores starting at `result_offset`;
// score j of slot k belongs to deformation index `deformations.start + j`.

pub mod cpu;
pub mod work_size;

use std::ops::{Deref, DerefMut, Range};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use rayon::ThreadPool;
use thiserror::Error;

use crate::deformation::DeformationDegree;
pub use crate::image::Interpolation;
use crate::stop::StopFlag;
use crate::task::{ComputationTask, FullTask};
use self::work_size::WorkSizeManager;

/// Specialization key of a compiled kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub facet_size: usize,
    pub degree: DeformationDegree,
    pub interpolation: Interpolation,
}

/// Failure reported by a compute backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("device error: {0}")]
    Device(String),
}

/// One facet of a loaded task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetSlot {
    /// Index into `FullTask::facets`.
    pub global: usize,
    pub deformations: Range<u64>,
    pub result_offset: usize,
}

impl FacetSlot {
    #[inline]
    pub fn len(&self) -> u64 {
        self.deformations.end - self.deformations.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Score-buffer layout of one ComputationTask.
#[derive(Debug, Clone)]
pub struct TaskLayout {
    pub slots: Vec<FacetSlot>,
    pub total: usize,
}

impl TaskLayout {
    pub fn new(task: &FullTask, ct: &ComputationTask) -> Self {
        let mut slots = Vec::with_capacity(ct.facets.len());
        let mut offset = 0usize;
        for global in ct.facets.clone() {
            let deformations = ct.deformation_range(task, global);
            let len = (deformations.end - deformations.start) as usize;
            slots.push(FacetSlot { global, deformations, result_offset: offset });
            offset += len;
        }
        TaskLayout { slots, total: offset }
    }

    /// Bytes needed for the score buffer.
    pub fn result_bytes(&self) -> u64 {
        (self.total * std::mem::size_of::<f32>()) as u64
    }
}

/// Everything a backend needs to load one ComputationTask.
pub struct TaskData<'a> {
    pub task: &'a FullTask,
    pub layout: &'a TaskLayout,
}

/// A correlation kernel backend.
pub trait KernelProgram {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Select (and compile if needed) the variant for `key`.
    fn prepare(&mut self, key: KernelKey) -> Result<(), BackendError>;

    /// Granularity of deformation batches; valid after `prepare`.
    fn base_unit(&self) -> u64;

    /// Largest deformation batch a single dispatch may cover.
    fn max_batch(&self) -> u64;

    /// Device memory, in bytes, available to one sub-task's results.
    fn memory_budget(&self) -> u64;

    /// Allocate and upload the data of one ComputationTask.
    fn load(&mut self, data: &TaskData<'_>) -> Result<(), BackendError>;

    /// Score deformations `[base, base + count)` of slot `slot` (relative to
    /// the slot's deformation range). Returns the measured execution time.
    fn dispatch(&mut self, slot: usize, base: u64, count: u64) -> Result<Duration, BackendError>;

    /// Scores of the loaded task in layout order.
    fn read_scores(&mut self) -> Result<Vec<f32>, BackendError>;

    /// Free per-task resources. Must be safe to call repeatedly.
    fn release(&mut self);

    /// Free per-solve caches.
    fn finish(&mut self) {}

    /// Run host-side parallel work on `pool`. Backends without host-side
    /// parallelism ignore it.
    fn use_thread_pool(&mut self, _pool: Arc<ThreadPool>) {}
}

/// Loaded task; releases backend resources when dropped.
pub struct LoadedTask<'p, K: KernelProgram + ?Sized> {
    program: &'p mut K,
}

impl<'p, K: KernelProgram + ?Sized> LoadedTask<'p, K> {
    pub fn load(program: &'p mut K, data: &TaskData<'_>) -> Result<Self, BackendError> {
        if let Err(e) = program.load(data) {
            program.release();
            return Err(e);
        }
        Ok(LoadedTask { program })
    }
}

impl<K: KernelProgram + ?Sized> Deref for LoadedTask<'_, K> {
    type Target = K;

    fn deref(&self) -> &K {
        self.program
    }
}

impl<K: KernelProgram + ?Sized> DerefMut for LoadedTask<'_, K> {
    fn deref_mut(&mut self) -> &mut K {
        self.program
    }
}

impl<K: KernelProgram + ?Sized> Drop for LoadedTask<'_, K> {
    fn drop(&mut self) {
        self.program.release();
    }
}

/// Drive the dispatches of a loaded task.
///
/// Facets are the outer loop, deformation batches the inner one. The batch
/// size comes from `wsm` and every measured dispatch time is fed back into
/// it. `stop` is polled before each submission.
///
/// Returns `Ok(false)` when stopped before every batch was submitted.
pub fn run_kernel<K: KernelProgram + ?Sized>(
    program: &mut K,
    wsm: &mut WorkSizeManager,
    layout: &TaskLayout,
    stop: &StopFlag,
) -> Result<bool, BackendError> {
    wsm.reset(program.base_unit(), program.max_batch());
    for (slot, facet) in layout.slots.iter().enumerate() {
        let total = facet.len();
        let mut base = 0u64;
        while base < total {
            if stop.is_stopped() {
                return Ok(false);
            }
            let count = wsm.batch().min(total - base);
            let elapsed = program.dispatch(slot, base, count)?;
            trace!("{}: slot {slot} [{base}, +{count}) in {elapsed:?}", program.name());
            wsm.store_time(count, elapsed);
            base += count;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::task;

    /// Records dispatch calls; every dispatch "takes" a fixed duration.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<(usize, u64, u64)>,
        released: usize,
        fail_load: bool,
    }

    impl KernelProgram for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn prepare(&mut self, _: KernelKey) -> Result<(), BackendError> {
            Ok(())
        }
        fn base_unit(&self) -> u64 {
            4
        }
        fn max_batch(&self) -> u64 {
            1 << 20
        }
        fn memory_budget(&self) -> u64 {
            u64::MAX
        }
        fn load(&mut self, _: &TaskData<'_>) -> Result<(), BackendError> {
            if self.fail_load {
                Err(BackendError::OutOfMemory { requested: 1, available: 0 })
            } else {
                Ok(())
            }
        }
        fn dispatch(&mut self, slot: usize, base: u64, count: u64) -> Result<Duration, BackendError> {
            self.calls.push((slot, base, count));
            Ok(Duration::from_millis(1))
        }
        fn read_scores(&mut self) -> Result<Vec<f32>, BackendError> {
            Ok(Vec::new())
        }
        fn release(&mut self) {
            self.released += 1;
        }
    }

    #[test]
    fn layout_offsets_follow_slots() {
        let t = task(3, &[0.0, 9.0, 1.0, 0.0, 0.0, 0.0]);
        let layout = TaskLayout::new(&t, &ComputationTask::full(0..3));
        assert_eq!(layout.total, 30);
        assert_eq!(layout.slots[2].result_offset, 20);
        let sub = TaskLayout::new(&t, &ComputationTask::partial(1, 3..7, false));
        assert_eq!(sub.total, 4);
        assert_eq!(sub.slots[0].global, 1);
        assert_eq!(sub.result_bytes(), 16);
    }

    #[test]
    fn run_kernel_covers_every_deformation_once() {
        let t = task(2, &[0.0, 99.0, 1.0, 0.0, 0.0, 0.0]);
        let layout = TaskLayout::new(&t, &ComputationTask::full(0..2));
        let mut rec = Recorder::default();
        let mut wsm = WorkSizeManager::new(Duration::from_millis(1));
        assert!(run_kernel(&mut rec, &mut wsm, &layout, &StopFlag::new()).unwrap());
        for slot in 0..2 {
            let covered: u64 = rec.calls.iter().filter(|c| c.0 == slot).map(|c| c.2).sum();
            assert_eq!(covered, 100);
        }
        // Facet-outer ordering.
        let first_slot1 = rec.calls.iter().position(|c| c.0 == 1).unwrap();
        assert!(rec.calls[first_slot1..].iter().all(|c| c.0 == 1));
    }

    #[test]
    fn run_kernel_stops_before_submission() {
        let t = task(1, &[0.0, 9.0, 1.0, 0.0, 0.0, 0.0]);
        let layout = TaskLayout::new(&t, &ComputationTask::full(0..1));
        let mut rec = Recorder::default();
        let stop = StopFlag::new();
        stop.stop();
        let mut wsm = WorkSizeManager::new(Duration::from_millis(1));
        assert!(!run_kernel(&mut rec, &mut wsm, &layout, &stop).unwrap());
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn loaded_task_releases_on_drop_and_failure() {
        let t = task(1, &[0.0; 6]);
        let layout = TaskLayout::new(&t, &ComputationTask::full(0..1));
        let data = TaskData { task: &t, layout: &layout };
        let mut rec = Recorder::default();
        {
            let _loaded = LoadedTask::load(&mut rec, &data).unwrap();
        }
        assert_eq!(rec.released, 1);
        rec.fail_load = true;
        assert!(LoadedTask::load(&mut rec, &data).is_err());
        assert_eq!(rec.released, 2);
    }
}
