// task/splitter.rs -- Partition a FullTask into device-sized pieces.
//
// The splitter walks the facets that are still pending and emits
// ComputationTasks whose element count (facet x deformation pairs) stays
// within a budget:
//
//   - consecutive pending facets are grouped while the group fits
//   - a facet whose deformation space alone exceeds the budget is cut into
//     Partial chunks; the final chunk carries `last = true`
//   - a finalized facet is never emitted and breaks a group, so every
//     facet range stays contiguous in global index space
//
// BUDGET:
//
//   policy                  facet cap      element cap
//   None                    unlimited      unlimited
//   Static { n }            n              unlimited
//   Dynamic { target }      unlimited      min(target, device memory / 4 B)
//
// and on top of that the cap learned from out-of-memory failures, held in
// SplitState. `SplitState::signal_task_size_too_big` halves the size of the
// sub-task that failed. The current splitter is abandoned; the NEXT splitter
// built from the same state uses the smaller cap. The cap never drops below
// the floor (one facet times the kernel's minimum batch); a failure at the
// floor is reported as DeviceOutOfMemory.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{DicError, Result};
use crate::task::{ComputationTask, FullTask};

/// Result buffer bytes per evaluated deformation.
pub const BYTES_PER_ELEMENT: u64 = std::mem::size_of::<f32>() as u64;

/// How a FullTask is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitPolicy {
    /// One task for everything (still subject to learned OOM caps).
    None,
    /// At most `facets_per_task` facets per task.
    Static { facets_per_task: usize },
    /// Element budget derived from `target_elements` and device memory.
    Dynamic { target_elements: u64 },
}

impl Default for SplitPolicy {
    fn default() -> Self {
        SplitPolicy::Dynamic { target_elements: crate::config::defaults::SPLIT_TARGET_ELEMENTS }
    }
}

/// Split size learned from out-of-memory failures.
#[derive(Debug, Clone)]
pub struct SplitState {
    cap: Option<u64>,
    floor: u64,
}

impl SplitState {
    pub fn new(floor: u64) -> Self {
        SplitState { cap: None, floor: floor.max(1) }
    }

    /// Current learned element cap, if any.
    pub fn cap(&self) -> Option<u64> {
        self.cap
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Raise the floor (kernel base unit may change between configurations).
    pub fn set_floor(&mut self, floor: u64) {
        self.floor = floor.max(1);
        if let Some(c) = self.cap {
            self.cap = Some(c.max(self.floor));
        }
    }

    /// Forget learned caps.
    pub fn reset(&mut self) {
        self.cap = None;
    }

    /// Record that a sub-task of `failed_elements` did not fit.
    ///
    /// # Errors
    /// `DeviceOutOfMemory` when the failed sub-task was already at the floor.
    pub fn signal_task_size_too_big(&mut self, failed_elements: u64) -> Result<()> {
        if failed_elements <= self.floor {
            return Err(DicError::DeviceOutOfMemory(format!(
                "sub-task of {failed_elements} elements failed at the minimum split size {}",
                self.floor
            )));
        }
        let halved = (failed_elements / 2).max(self.floor);
        let cap = self.cap.map_or(halved, |c| c.min(halved));
        warn!("task too big ({failed_elements} elements), next split capped at {cap}");
        self.cap = Some(cap);
        Ok(())
    }
}

/// Restartable external iterator over the pending work of a FullTask.
pub struct TaskSplitter<'a> {
    task: &'a FullTask,
    pending: Vec<usize>,
    cursor: usize,
    /// Next deformation index inside `pending[cursor]` when a facet is
    /// being emitted in Partial chunks.
    deformation_cursor: u64,
    max_facets: usize,
    max_elements: u64,
}

impl<'a> TaskSplitter<'a> {
    /// Build a splitter over the facets of `task` not yet marked in
    /// `committed`. `memory_bytes` is the device memory available for the
    /// result buffer of one sub-task.
    pub fn new(
        task: &'a FullTask,
        policy: SplitPolicy,
        state: &SplitState,
        committed: &[bool],
        memory_bytes: u64,
    ) -> Self {
        let pending: Vec<usize> = (0..task.facet_count())
            .filter(|&i| !committed.get(i).copied().unwrap_or(false))
            .collect();

        let (max_facets, mut max_elements) = match policy {
            SplitPolicy::None => (usize::MAX, u64::MAX),
            SplitPolicy::Static { facets_per_task } => (facets_per_task.max(1), u64::MAX),
            SplitPolicy::Dynamic { target_elements } => {
                (usize::MAX, target_elements.min(memory_bytes / BYTES_PER_ELEMENT))
            }
        };
        if let Some(cap) = state.cap() {
            max_elements = max_elements.min(cap);
        }
        let max_elements = max_elements.max(state.floor());

        debug!(
            "splitter: {} pending facets, facet cap {}, element cap {}",
            pending.len(),
            max_facets,
            max_elements
        );

        TaskSplitter { task, pending, cursor: 0, deformation_cursor: 0, max_facets, max_elements }
    }

    /// Element cap in effect for this splitter.
    pub fn max_elements(&self) -> u64 {
        self.max_elements
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.pending.len()
    }

    /// Next sub-task.
    ///
    /// # Errors
    /// `NoMoreElements` after the sequence is exhausted.
    pub fn next_task(&mut self) -> Result<ComputationTask> {
        if !self.has_next() {
            return Err(DicError::NoMoreElements);
        }
        let first = self.pending[self.cursor];
        let first_count = self.task.deformation_count(first);

        // Facet too large for one task: emit its deformation space in chunks.
        if self.deformation_cursor > 0 || first_count > self.max_elements {
            let start = self.deformation_cursor;
            let end = (start + self.max_elements).min(first_count);
            let last = end == first_count;
            if last {
                self.cursor += 1;
                self.deformation_cursor = 0;
            } else {
                self.deformation_cursor = end;
            }
            return Ok(ComputationTask::partial(first, start..end, last));
        }

        let mut elements = first_count;
        let mut end = first + 1;
        self.cursor += 1;
        while self.cursor < self.pending.len() && end - first < self.max_facets {
            let next = self.pending[self.cursor];
            if next != end {
                break;
            }
            let count = self.task.deformation_count(next);
            if elements + count > self.max_elements {
                break;
            }
            elements += count;
            end += 1;
            self.cursor += 1;
        }
        Ok(ComputationTask::full(first..end))
    }
}

impl Iterator for TaskSplitter<'_> {
    type Item = ComputationTask;

    fn next(&mut self) -> Option<ComputationTask> {
        self.next_task().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::task;
    use crate::task::DeformationSpan;

    const LIMITS_10: [f64; 6] = [0.0, 9.0, 1.0, 0.0, 0.0, 0.0];

    #[test]
    fn no_split_emits_one_task() {
        let t = task(5, &LIMITS_10);
        let mut s = TaskSplitter::new(&t, SplitPolicy::None, &SplitState::new(1), &[], u64::MAX);
        assert_eq!(s.next_task().unwrap(), ComputationTask::full(0..5));
        assert!(!s.has_next());
        assert!(matches!(s.next_task(), Err(DicError::NoMoreElements)));
    }

    #[test]
    fn static_groups_by_facet_count() {
        let t = task(5, &LIMITS_10);
        let s = TaskSplitter::new(
            &t,
            SplitPolicy::Static { facets_per_task: 2 },
            &SplitState::new(1),
            &[],
            u64::MAX,
        );
        let ranges: Vec<_> = s.map(|c| c.facets).collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..5]);
    }

    #[test]
    fn dynamic_respects_memory() {
        let t = task(5, &LIMITS_10);
        // 100 bytes -> 25 elements -> two facets of 10 per task
        let s = TaskSplitter::new(
            &t,
            SplitPolicy::Dynamic { target_elements: 1_000 },
            &SplitState::new(1),
            &[],
            100,
        );
        assert_eq!(s.max_elements(), 25);
        let ranges: Vec<_> = s.map(|c| c.facets).collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..5]);
    }

    #[test]
    fn oversized_facet_is_chunked() {
        let t = task(2, &LIMITS_10);
        let s = TaskSplitter::new(
            &t,
            SplitPolicy::Dynamic { target_elements: 4 },
            &SplitState::new(1),
            &[],
            u64::MAX,
        );
        let tasks: Vec<_> = s.collect();
        assert_eq!(tasks.len(), 6);
        assert_eq!(tasks[0], ComputationTask::partial(0, 0..4, false));
        assert_eq!(tasks[2], ComputationTask::partial(0, 8..10, true));
        assert_eq!(tasks[5].span, DeformationSpan::Partial { range: 8..10, last: true });
        assert_eq!(tasks[5].facets, 1..2);
    }

    #[test]
    fn committed_facets_are_skipped_and_break_groups() {
        let t = task(5, &LIMITS_10);
        let committed = [false, true, false, false, true];
        let s = TaskSplitter::new(&t, SplitPolicy::None, &SplitState::new(1), &committed, u64::MAX);
        let ranges: Vec<_> = s.map(|c| c.facets).collect();
        assert_eq!(ranges, vec![0..1, 2..4]);
    }

    #[test]
    fn too_big_halves_next_splitter() {
        let t = task(8, &LIMITS_10);
        let mut state = SplitState::new(1);
        let first = TaskSplitter::new(&t, SplitPolicy::None, &state, &[], u64::MAX)
            .next()
            .unwrap();
        state.signal_task_size_too_big(first.element_count(&t)).unwrap();
        assert_eq!(state.cap(), Some(40));
        let ranges: Vec<_> = TaskSplitter::new(&t, SplitPolicy::None, &state, &[], u64::MAX)
            .map(|c| c.facets)
            .collect();
        assert_eq!(ranges, vec![0..4, 4..8]);
    }

    #[test]
    fn too_big_at_floor_is_out_of_memory() {
        let mut state = SplitState::new(8);
        state.signal_task_size_too_big(20).unwrap();
        assert_eq!(state.cap(), Some(10));
        state.signal_task_size_too_big(10).unwrap();
        assert_eq!(state.cap(), Some(8));
        assert!(matches!(
            state.signal_task_size_too_big(8),
            Err(DicError::DeviceOutOfMemory(_))
        ));
    }

    #[test]
    fn cap_never_below_floor() {
        let t = task(1, &LIMITS_10);
        let mut state = SplitState::new(3);
        state.signal_task_size_too_big(4).unwrap();
        let s = TaskSplitter::new(&t, SplitPolicy::None, &state, &[], u64::MAX);
        assert_eq!(s.max_elements(), 3);
    }
}
