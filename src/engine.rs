// engine.rs -- Round-by-round DIC pipeline.
//
// Ties every component together into the loop an orchestration layer calls
// once per task:
//
//   1. Validate parameters and resolve the ROIs of every round
//   2. For each round (from, to):
//        a. pre-filter both images
//        b. generate facets per ROI
//        c. solve every ROI, optionally refine around the coarse optimum
//        d. fold all ROIs into one displacement field
//        e. chain the field onto the cumulative field from the first round
//        f. submit strain of the direct and cumulative fields to the pool
//   3. Join all background strain jobs
//
// State machine:
//
//   Idle -> Validating -> ComputingRound(r) -> ... -> Finalizing -> Done
//
// Round r + 1 starts as soon as round r's displacement is stored. Its
// strain runs concurrently on the worker pool and is only awaited at
// Finalizing, so correlation on the device never waits for regression on
// the CPU. Each background job reports over its own mpsc channel; joining
// is one blocking `recv` per job.
//
// The cumulative field is chained on the engine thread before submission,
// so background jobs never read each other's output.
//
// THREADS:
// Two rayon pools. The correlation pool runs host-side kernel batches and
// displacement rows of the current round; the worker pool runs strain jobs,
// so round r + 1 never queues behind round r's strain. `stop` does not tear the worker pool down: jobs already queued
// still start, see the flag and return without estimating.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::{correlation_weight, defaults, TaskSettings};
use crate::displacement::{chain, DisplacementCalculator, DisplacementResult};
use crate::error::{DicError, Result};
use crate::facet::{EqualSpacingGenerator, FacetGenerator};
use crate::kernel::KernelProgram;
use crate::solver::CorrelationSolver;
use crate::stop::StopFlag;
use crate::strain::StrainEstimator;
use crate::task::container::{RoiResult, RoundResult, TaskContainer};
use crate::task::FullTask;

/// Coarse pipeline phase reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    Validating,
    Generating,
    Solving { roi: usize },
    Refining { roi: usize },
    Displacement,
    Strain,
    RoundFinished { elapsed: Duration },
    Finished,
}

/// Progress notification; `round` is the source image index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub round: usize,
    pub phase: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Validating,
    ComputingRound(usize),
    Finalizing,
    Done,
}

/// Summary of a [`Engine::compute_task`] run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    /// Rounds whose correlation finished, in execution order.
    pub rounds: Vec<(usize, usize)>,
    /// False when a stop request cut the task short.
    pub complete: bool,
}

/// Displacement fields of one round, ready for strain estimation.
struct RoundFields {
    from: usize,
    to: usize,
    field: Arc<DisplacementResult>,
}

/// DIC session: one solver, one worker pool, one stop flag.
pub struct Engine<K: KernelProgram> {
    solver: CorrelationSolver<K>,
    strain: Arc<StrainEstimator>,
    pool: Arc<ThreadPool>,
    correlation_pool: Option<Arc<ThreadPool>>,
    stop: StopFlag,
    generator: Option<Box<dyn FacetGenerator>>,
    subscribers: Vec<Sender<ProgressEvent>>,
    state: EngineState,
}

impl<K: KernelProgram> Engine<K> {
    /// Engine with correlation and worker pools sized to the available
    /// parallelism.
    pub fn new(kernel: K) -> Result<Self> {
        let correlation = ThreadPoolBuilder::new()
            .thread_name(|i| format!("dicer-correlate-{i}"))
            .build()?;
        let workers = ThreadPoolBuilder::new()
            .thread_name(|i| format!("dicer-worker-{i}"))
            .build()?;
        Ok(Self::with_pools(kernel, Arc::new(correlation), Arc::new(workers)))
    }

    /// Engine on caller-built pools.
    pub fn with_pools(kernel: K, correlation: Arc<ThreadPool>, workers: Arc<ThreadPool>) -> Self {
        let mut engine = Self::with_pool(kernel, workers);
        engine.solver.kernel_mut().use_thread_pool(correlation.clone());
        engine.correlation_pool = Some(correlation);
        engine
    }

    /// Engine with strain jobs on `pool`; correlation work runs on the
    /// caller's rayon context.
    pub fn with_pool(kernel: K, pool: Arc<ThreadPool>) -> Self {
        let stop = StopFlag::new();
        let mut solver = CorrelationSolver::new(kernel);
        solver.set_stop(stop.clone());
        Engine {
            solver,
            strain: Arc::new(StrainEstimator::with_pool(pool.clone(), stop.clone())),
            pool,
            correlation_pool: None,
            stop,
            generator: None,
            subscribers: Vec::new(),
            state: EngineState::Idle,
        }
    }

    /// Replace the default equal-spacing facet generator.
    pub fn with_generator(mut self, generator: impl FacetGenerator + 'static) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }

    pub fn solver(&self) -> &CorrelationSolver<K> {
        &self.solver
    }

    pub fn solver_mut(&mut self) -> &mut CorrelationSolver<K> {
        &mut self.solver
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Request a stop of the running task.
    ///
    /// Cooperative: the solver and the strain estimator poll the flag, and
    /// queued strain jobs skip their work once it is set. The worker pool
    /// itself keeps running and drains.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Stop flag to trip from another thread while a task runs.
    pub fn stop_handle(&self) -> StopFlag {
        self.stop.clone()
    }

    /// New progress channel. Dropped receivers are pruned on the next event.
    pub fn subscribe(&mut self) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Run every round of the task.
    ///
    /// Earlier results in `container` are cleared first. On error, results
    /// of the rounds finished before stay in the container.
    pub fn compute_task(&mut self, container: &Arc<TaskContainer>) -> Result<TaskStatus> {
        let started = Instant::now();
        container.clear_results();
        self.stop.reset();
        self.solver.reset_split_state();

        self.state = EngineState::Validating;
        let settings = container.validate()?;
        let first = settings.first_round();
        self.emit(first, Phase::Validating);
        self.configure(&settings);

        let mut jobs = Vec::new();
        let outcome = self.run_rounds(container, &settings, &mut jobs);

        self.state = EngineState::Finalizing;
        let joined = join_jobs(jobs);
        let status = outcome?;
        joined?;

        self.state = EngineState::Done;
        self.emit(first, Phase::Finished);
        info!(
            "task finished: {} of {} rounds in {:?}{}",
            status.rounds.len(),
            settings.rounds.len(),
            started.elapsed(),
            if status.complete { "" } else { ", stopped" }
        );
        Ok(status)
    }

    /// Correlate image `from` against image `to` and estimate strain on the
    /// calling thread.
    ///
    /// Uses the ROIs resolved for round `from`; the container is validated
    /// first if it has not been.
    pub fn compute_round(&mut self, container: &Arc<TaskContainer>, from: usize, to: usize) -> Result<RoundResult> {
        if from >= to {
            return Err(DicError::InvalidRoundOrder { from, to });
        }
        if to >= container.image_count() {
            return Err(DicError::InvalidConfiguration(format!(
                "no image with index {to} ({} images)",
                container.image_count()
            )));
        }
        let settings = match container.settings() {
            Some(s) => s,
            None => container.validate()?,
        };
        if container.round_rois(from).is_empty() {
            return Err(DicError::InvalidConfiguration(format!("round {from} is not part of the task")));
        }
        self.stop.reset();
        self.configure(&settings);

        self.state = EngineState::ComputingRound(from);
        let started = Instant::now();
        let (field, complete) = self.correlate_round(container, &settings, from, to)?;
        if settings.compute_strain && complete {
            self.emit(from, Phase::Strain);
            let out = self.strain.estimate(&field, settings.strain_window, from, to)?;
            container.store_strain(from, to, Arc::new(out.result), out.complete);
        }
        self.emit(from, Phase::RoundFinished { elapsed: started.elapsed() });
        self.state = EngineState::Done;

        container
            .result(from, to)
            .ok_or_else(|| DicError::InternalConsistency(format!("result ({from}, {to}) missing after store")))
    }

    fn configure(&mut self, settings: &TaskSettings) {
        self.solver.set_policy(settings.split_policy);
        self.solver.set_interpolation(settings.interpolation);
    }

    fn run_rounds(
        &mut self,
        container: &Arc<TaskContainer>,
        settings: &TaskSettings,
        jobs: &mut Vec<Receiver<Result<()>>>,
    ) -> Result<TaskStatus> {
        let first = settings.first_round();
        let mut done = Vec::with_capacity(settings.rounds.len());
        let mut cumulative: Option<(Arc<DisplacementResult>, bool)> = None;

        for &(from, to) in &settings.rounds {
            if self.stop.is_stopped() {
                return Ok(TaskStatus { rounds: done, complete: false });
            }
            self.state = EngineState::ComputingRound(from);
            let started = Instant::now();
            let (field, complete) = self.correlate_round(container, settings, from, to)?;

            let mut fields = vec![RoundFields { from, to, field: field.clone() }];
            cumulative = Some(match cumulative {
                Some((prev, prev_complete)) => {
                    let overlap = Arc::new(chain(&prev, &field));
                    let overlap_complete = prev_complete && complete;
                    container.store_result(
                        first,
                        to,
                        RoundResult {
                            displacement: Some(overlap.clone()),
                            complete: overlap_complete,
                            ..Default::default()
                        },
                    );
                    fields.push(RoundFields { from: first, to, field: overlap.clone() });
                    (overlap, overlap_complete)
                }
                None => (field, complete),
            });

            if settings.compute_strain && complete {
                self.emit(from, Phase::Strain);
                jobs.push(self.submit_strain(container.clone(), settings.strain_window, fields));
            }
            done.push((from, to));
            self.emit(from, Phase::RoundFinished { elapsed: started.elapsed() });
            debug!("round {from}->{to} correlated in {:?}", started.elapsed());

            if !complete {
                return Ok(TaskStatus { rounds: done, complete: false });
            }
        }
        Ok(TaskStatus { rounds: done, complete: true })
    }

    /// Correlation and displacement of one round; stores the result.
    fn correlate_round(
        &mut self,
        container: &TaskContainer,
        settings: &TaskSettings,
        from: usize,
        to: usize,
    ) -> Result<(Arc<DisplacementResult>, bool)> {
        let image_a = container.filtered_image(from, settings.filter_kernel_size)?;
        let image_b = container.filtered_image(to, settings.filter_kernel_size)?;

        self.emit(from, Phase::Generating);
        let rois = container.round_rois(from);
        let facets = match &self.generator {
            Some(g) => g.generate(container, from)?,
            None => EqualSpacingGenerator::new(settings.facet_spacing).generate(container, from)?,
        };
        if facets.len() != rois.len() {
            return Err(DicError::InternalConsistency(format!(
                "generator returned {} facet lists for {} ROIs",
                facets.len(),
                rois.len()
            )));
        }

        let mut roi_results = Vec::with_capacity(rois.len());
        let mut complete = true;
        for (i, (roi, facets)) in rois.iter().zip(facets).enumerate() {
            if self.stop.is_stopped() {
                complete = false;
                break;
            }
            self.emit(from, Phase::Solving { roi: i });
            let weight = correlation_weight(roi.facet_size, settings.correlation_weight);
            let task = FullTask::uniform(image_a.clone(), image_b.clone(), facets, weight, roi.limits.clone())?;
            let mut outcome = self.solver.solve(&task, roi.facet_size)?;
            if settings.fine_search && outcome.complete {
                self.emit(from, Phase::Refining { roi: i });
                outcome = self.solver.refine(&task, roi.facet_size, &outcome, defaults::FINE_SEARCH_DIVISOR)?;
            }
            complete &= outcome.complete;
            roi_results.push(RoiResult { roi: roi.roi, facets: task.facets, results: outcome.results });
        }

        self.emit(from, Phase::Displacement);
        let mut calc = DisplacementCalculator::new(settings.result_quality, settings.correlation_weight);
        if let Some(pool) = &self.correlation_pool {
            calc = calc.with_pool(pool.clone());
        }
        let field = Arc::new(calc.compute(image_a.width(), image_a.height(), &roi_results));
        container.store_result(
            from,
            to,
            RoundResult { rois: roi_results, displacement: Some(field.clone()), strain: None, complete },
        );
        if !complete {
            warn!("round {from}->{to} stopped before all ROIs were solved");
        }
        Ok((field, complete))
    }

    fn submit_strain(
        &self,
        container: Arc<TaskContainer>,
        window: usize,
        fields: Vec<RoundFields>,
    ) -> Receiver<Result<()>> {
        let (tx, rx) = mpsc::channel();
        let estimator = self.strain.clone();
        let stop = self.stop.clone();
        self.pool.spawn(move || {
            let run = || -> Result<()> {
                for RoundFields { from, to, field } in fields {
                    if stop.is_stopped() {
                        container.mark_incomplete(from, to);
                        continue;
                    }
                    let out = estimator.estimate(&field, window, from, to)?;
                    container.store_strain(from, to, Arc::new(out.result), out.complete);
                }
                Ok(())
            };
            // The receiver is gone only if the engine was dropped mid-task.
            let _ = tx.send(run());
        });
        rx
    }

    fn emit(&mut self, round: usize, phase: Phase) {
        let event = ProgressEvent { round, phase };
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

/// Wait for every background job; the first failure wins.
fn join_jobs(jobs: Vec<Receiver<Result<()>>>) -> Result<()> {
    let mut first_error = None;
    for rx in jobs {
        let outcome = rx
            .recv()
            .unwrap_or_else(|_| Err(DicError::InternalConsistency("strain job ended without reporting".into())));
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskParameters;
    use crate::image::Image;
    use crate::kernel::cpu::CpuKernelProgram;
    use crate::roi::Roi;

    fn speckle(w: usize, h: usize, dx: f32, dy: f32) -> Image<f32> {
        Image::from_fn(w, h, |x, y| {
            let (x, y) = (x as f32 - dx, y as f32 - dy);
            128.0 + 60.0 * (0.7 * x).sin() * (0.45 * y).cos() + 40.0 * (0.23 * x + 0.61 * y).sin()
        })
    }

    fn container(shifts: &[(f32, f32)], params: TaskParameters) -> Arc<TaskContainer> {
        let images = shifts.iter().map(|&(dx, dy)| speckle(48, 40, dx, dy)).collect();
        let mut tc = TaskContainer::new(images, params);
        for r in 0..shifts.len() {
            tc.add_roi(r, Roi::Rectangle { x1: 10, y1: 10, x2: 37, y2: 29 });
        }
        Arc::new(tc)
    }

    fn params() -> TaskParameters {
        TaskParameters {
            facet_size: Some(9),
            facet_spacing: Some(4),
            deformation_limits: Some(vec![-3.0, 3.0, 1.0, -3.0, 3.0, 1.0]),
            filter_kernel_size: Some(0),
            strain_window_mm: Some(5.0),
            ..Default::default()
        }
    }

    fn engine() -> Engine<CpuKernelProgram> {
        let pool = Arc::new(ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        Engine::with_pool(CpuKernelProgram::new(), pool)
    }

    #[test]
    fn task_stores_direct_and_cumulative_results() {
        let tc = container(&[(0.0, 0.0), (1.0, 0.0), (2.0, 1.0)], params());
        let mut engine = engine();
        let status = engine.compute_task(&tc).unwrap();
        assert!(status.complete);
        assert_eq!(status.rounds, vec![(0, 1), (1, 2)]);
        assert_eq!(engine.state(), EngineState::Done);
        assert_eq!(tc.result_keys(), vec![(0, 1), (0, 2), (1, 2)]);

        let direct = tc.result(1, 2).unwrap();
        assert!(direct.complete);
        assert_eq!(direct.displacement.unwrap().get(20, 20), Some((1.0, 1.0)));
        assert!(direct.strain.is_some());

        let overlap = tc.result(0, 2).unwrap();
        assert!(overlap.rois.is_empty());
        assert_eq!(overlap.displacement.unwrap().get(20, 20), Some((2.0, 1.0)));
        assert!(overlap.strain.is_some());
    }

    #[test]
    fn progress_events_are_ordered_per_round() {
        let tc = container(&[(0.0, 0.0), (1.0, 0.0)], params());
        let mut engine = engine();
        let rx = engine.subscribe();
        engine.compute_task(&tc).unwrap();
        let phases: Vec<Phase> = rx.try_iter().map(|e| e.phase).collect();
        assert_eq!(phases[0], Phase::Validating);
        assert_eq!(phases[1], Phase::Generating);
        assert_eq!(phases[2], Phase::Solving { roi: 0 });
        assert_eq!(phases[3], Phase::Displacement);
        assert_eq!(phases[4], Phase::Strain);
        assert!(matches!(phases[5], Phase::RoundFinished { .. }));
        assert_eq!(phases.last(), Some(&Phase::Finished));
    }

    #[test]
    fn stop_from_progress_listener_ends_task() {
        let tc = container(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)], params());
        let mut engine = engine();
        let rx = engine.subscribe();
        let stop = engine.stop_handle();
        // Trip the flag once the first round has been reported finished.
        let watcher = std::thread::spawn(move || {
            for event in rx {
                if matches!(event.phase, Phase::RoundFinished { .. }) {
                    stop.stop();
                }
            }
        });
        let status = engine.compute_task(&tc).unwrap();
        drop(engine);
        watcher.join().unwrap();
        assert!(status.rounds.len() <= 2);
        if status.rounds.len() < 2 {
            assert!(!status.complete);
        }
    }

    #[test]
    fn compute_round_checks_order() {
        let tc = container(&[(0.0, 0.0), (1.0, 0.0)], params());
        let mut engine = engine();
        assert!(matches!(engine.compute_round(&tc, 1, 0), Err(DicError::InvalidRoundOrder { from: 1, to: 0 })));
        assert!(matches!(engine.compute_round(&tc, 0, 5), Err(DicError::InvalidConfiguration(_))));
    }

    #[test]
    fn compute_round_returns_stored_result() {
        let tc = container(&[(0.0, 0.0), (0.0, -2.0)], params());
        let mut engine = engine();
        let result = engine.compute_round(&tc, 0, 1).unwrap();
        assert!(result.complete);
        assert_eq!(result.displacement.unwrap().get(20, 20), Some((0.0, -2.0)));
        let strain = result.strain.unwrap();
        let s = strain.get(20, 20).unwrap();
        assert!(s.exx.abs() < 1e-9 && s.eyy.abs() < 1e-9);
    }

    #[test]
    fn invalid_parameters_fail_validation() {
        let p = TaskParameters { deformation_limits: Some(vec![0.0; 5]), ..params() };
        let tc = container(&[(0.0, 0.0), (1.0, 0.0)], p);
        let mut engine = engine();
        assert!(matches!(engine.compute_task(&tc), Err(DicError::InvalidConfiguration(_))));
    }
}
