// solver.rs -- Best deformation per facet over a whole FullTask.
//
// The solver is the only place where the three adaptive mechanisms meet:
//
//   TaskSplitter        how much of the task is loaded at once
//   WorkSizeManager     how much of a loaded task is dispatched at once
//   SplitState          what the device refused before
//
// Loop:
//
//   splitter = TaskSplitter(task, policy, split_state, committed)
//   while splitter.has_next():
//       poll stop
//       ct = splitter.next_task()
//       load ct, run_kernel, read scores, release
//         OutOfMemory  -> split_state.signal_task_size_too_big(|ct|),
//                         drop the pending partial, build a new splitter
//         other error  -> fatal
//       fold per-slot bests into the result vector
//
// RESULT REDUCTION:
// A Full sub-task commits each of its facets directly. Partial sub-tasks of
// one facet fold into a single pending value; the chunk flagged `last`
// commits it. Committed facets are masked out of every later splitter, so a
// re-split after OOM only redoes unfinished work. Every commit is checked:
// index in range, not committed before, pending value of the same facet.
// After a pass every facet must be committed. Any violation is an
// InternalConsistency error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use rayon::prelude::*;

use crate::correlation::{pick_better, CorrelationResult};
use crate::error::{DicError, Result};
use crate::image::Interpolation;
use crate::kernel::work_size::WorkSizeManager;
use crate::kernel::{run_kernel, BackendError, FacetSlot, KernelKey, KernelProgram, LoadedTask, TaskData, TaskLayout};
use crate::stop::StopFlag;
use crate::task::splitter::{SplitPolicy, SplitState, TaskSplitter};
use crate::task::{ComputationTask, DeformationSpan, FullTask};

/// Per-facet results of one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    /// Aligned with the FullTask facets; `None` where no result was committed.
    pub results: Vec<Option<CorrelationResult>>,
    /// False when a stop request cut the solve short.
    pub complete: bool,
}

/// Drives a [`KernelProgram`] over split FullTasks.
pub struct CorrelationSolver<K: KernelProgram> {
    kernel: K,
    policy: SplitPolicy,
    interpolation: Interpolation,
    stop: StopFlag,
    wsm: WorkSizeManager,
    split_state: SplitState,
}

impl<K: KernelProgram> CorrelationSolver<K> {
    pub fn new(kernel: K) -> Self {
        CorrelationSolver {
            kernel,
            policy: SplitPolicy::default(),
            interpolation: Interpolation::default(),
            stop: StopFlag::new(),
            wsm: WorkSizeManager::default(),
            split_state: SplitState::new(1),
        }
    }

    pub fn with_policy(mut self, policy: SplitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_latency_target(mut self, target: Duration) -> Self {
        self.wsm = WorkSizeManager::new(target);
        self
    }

    pub fn set_policy(&mut self, policy: SplitPolicy) {
        self.policy = policy;
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.interpolation = interpolation;
    }

    /// Share an externally owned stop flag.
    pub fn set_stop(&mut self, stop: StopFlag) {
        self.stop = stop;
    }

    pub fn stop_handle(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn split_state(&self) -> &SplitState {
        &self.split_state
    }

    /// Forget split sizes learned from earlier OOM failures.
    pub fn reset_split_state(&mut self) {
        self.split_state.reset();
    }

    /// Best deformation for every facet of `task`.
    ///
    /// # Errors
    /// `InvalidConfiguration` for mixed degrees or facets of another size,
    /// `InternalConsistency` for duplicate facets or a broken reduction,
    /// `DeviceOutOfMemory` when the task cannot be split any smaller and
    /// `DeviceComputationFailure` for every other backend failure.
    pub fn solve(&mut self, task: &FullTask, facet_size: usize) -> Result<SolveOutcome> {
        let n = task.facet_count();
        let mut results = vec![None; n];
        let Some(degree) = task.degree()? else {
            return Ok(SolveOutcome { results, complete: true });
        };
        if let Some(f) = task.facets.iter().find(|f| f.size != facet_size) {
            return Err(DicError::InvalidConfiguration(format!(
                "facet {f:?} in a task of facet size {facet_size}"
            )));
        }
        task.check_unique_facets()?;

        let started = Instant::now();
        let key = KernelKey { facet_size, degree, interpolation: self.interpolation };
        self.kernel.prepare(key)?;
        self.split_state.set_floor(self.kernel.base_unit());

        let mut committed = vec![false; n];
        let outcome = self.solve_pending(task, &mut results, &mut committed);
        self.kernel.finish();
        let complete = outcome?;

        info!(
            "{}: solved {n} facets ({} degree) in {:?}{}",
            self.kernel.name(),
            degree,
            started.elapsed(),
            if complete { "" } else { ", stopped" }
        );
        Ok(SolveOutcome { results, complete })
    }

    /// Search again around each coarse optimum at `1 / divisor` of the coarse
    /// translation step and keep the better result per facet.
    ///
    /// Facets without a coarse result are left as they are.
    pub fn refine(
        &mut self,
        task: &FullTask,
        facet_size: usize,
        coarse: &SolveOutcome,
        divisor: f64,
    ) -> Result<SolveOutcome> {
        let mut index = Vec::new();
        let mut facets = Vec::new();
        let mut weights = Vec::new();
        let mut limits = Vec::new();
        for (i, r) in coarse.results.iter().enumerate() {
            if let Some(r) = r {
                index.push(i);
                facets.push(task.facets[i]);
                weights.push(task.weights[i]);
                limits.push(Arc::new(task.limits[i].refined_around(&r.deformation, divisor)?));
            }
        }
        let fine_task = FullTask::new(task.image_a.clone(), task.image_b.clone(), facets, weights, limits)?;
        let fine = self.solve(&fine_task, facet_size)?;

        let mut results = coarse.results.clone();
        if fine.complete {
            for (r, i) in fine.results.into_iter().zip(index) {
                if let Some(r) = r {
                    results[i] = Some(pick_better(results[i].take(), r));
                }
            }
        }
        debug!("refined {} facets", fine_task.facet_count());
        Ok(SolveOutcome { results, complete: coarse.complete && fine.complete })
    }

    /// Split passes until every facet is committed. `Ok(false)` when stopped.
    fn solve_pending(
        &mut self,
        task: &FullTask,
        results: &mut [Option<CorrelationResult>],
        committed: &mut [bool],
    ) -> Result<bool> {
        'split: loop {
            let mut splitter =
                TaskSplitter::new(task, self.policy, &self.split_state, committed, self.kernel.memory_budget());
            let mut pending: Option<(usize, CorrelationResult)> = None;

            while splitter.has_next() {
                if self.stop.is_stopped() {
                    info!("solve stopped with {} facets pending", committed.iter().filter(|c| !**c).count());
                    return Ok(false);
                }
                let ct = splitter.next_task()?;
                let bests = match self.run_task(task, &ct) {
                    Ok(Some(bests)) => bests,
                    Ok(None) => return Ok(false),
                    Err(BackendError::OutOfMemory { requested, available }) => {
                        debug!("sub-task {ct:?} needs {requested} bytes, {available} available");
                        self.split_state.signal_task_size_too_big(ct.element_count(task))?;
                        continue 'split;
                    }
                    Err(e) => return Err(e.into()),
                };

                for (global, best) in bests {
                    match &ct.span {
                        DeformationSpan::Full => commit(results, committed, global, best)?,
                        DeformationSpan::Partial { last, .. } => {
                            let folded = match pending.take() {
                                Some((g, prev)) if g == global => pick_better(Some(prev), best),
                                Some((g, _)) => {
                                    return Err(DicError::InternalConsistency(format!(
                                        "partial result of facet {g} interleaved with facet {global}"
                                    )))
                                }
                                None => best,
                            };
                            if *last {
                                commit(results, committed, global, folded)?;
                            } else {
                                pending = Some((global, folded));
                            }
                        }
                    }
                }
            }

            if let Some((g, _)) = pending {
                return Err(DicError::InternalConsistency(format!(
                    "partial results of facet {g} never reached the last chunk"
                )));
            }
            if let Some(i) = committed.iter().position(|c| !c) {
                return Err(DicError::InternalConsistency(format!("facet {i} was never committed")));
            }
            return Ok(true);
        }
    }

    /// Load, dispatch and reduce one sub-task. `Ok(None)` when stopped.
    fn run_task(
        &mut self,
        task: &FullTask,
        ct: &ComputationTask,
    ) -> std::result::Result<Option<Vec<(usize, CorrelationResult)>>, BackendError> {
        let layout = TaskLayout::new(task, ct);
        debug!("{}: sub-task {ct:?}, {} scores", self.kernel.name(), layout.total);

        let mut loaded = LoadedTask::load(&mut self.kernel, &TaskData { task, layout: &layout })?;
        if !run_kernel(&mut *loaded, &mut self.wsm, &layout, &self.stop)? {
            return Ok(None);
        }
        let scores = loaded.read_scores()?;
        drop(loaded);

        if scores.len() != layout.total {
            return Err(BackendError::Device(format!(
                "read {} scores, expected {}",
                scores.len(),
                layout.total
            )));
        }
        layout
            .slots
            .par_iter()
            .map(|slot| {
                let s = &scores[slot.result_offset..slot.result_offset + slot.len() as usize];
                best_of_slot(task, slot, s)
                    .map(|best| (slot.global, best))
                    .ok_or_else(|| BackendError::Device(format!("facet {} produced no score", slot.global)))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Some)
    }
}

fn commit(
    results: &mut [Option<CorrelationResult>],
    committed: &mut [bool],
    global: usize,
    best: CorrelationResult,
) -> Result<()> {
    match committed.get_mut(global) {
        None => Err(DicError::InternalConsistency(format!(
            "result for facet {global} outside a task of {} facets",
            results.len()
        ))),
        Some(true) => Err(DicError::InternalConsistency(format!("facet {global} committed twice"))),
        Some(c) => {
            *c = true;
            results[global] = Some(best);
            Ok(())
        }
    }
}

/// Best deformation of one slot. Scores tied with the maximum are decoded
/// and resolved by magnitude.
fn best_of_slot(task: &FullTask, slot: &FacetSlot, scores: &[f32]) -> Option<CorrelationResult> {
    let max = scores.iter().copied().filter(|s| !s.is_nan()).fold(None, |m: Option<f32>, s| {
        Some(m.map_or(s, |m| m.max(s)))
    })?;
    let limits = &task.limits[slot.global];
    let mut best: Option<CorrelationResult> = None;
    for (j, _) in scores.iter().enumerate().filter(|(_, s)| **s == max) {
        let candidate =
            CorrelationResult::new(max as f64, limits.deformation(slot.deformations.start + j as u64));
        best = Some(pick_better(best, candidate));
    }
    best
}
