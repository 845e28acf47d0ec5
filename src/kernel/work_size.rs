// kernel/work_size.rs -- Adaptive deformation batch sizing.
//
// Latency feedback loop. Each dispatch reports how long a batch of N
// deformations took; the next batch is sized so that one dispatch lands
// near the target latency:
//
//   ideal = N * target / elapsed
//   next  = clamp(ideal, current / 2, current * 2)
//           rounded down to a multiple of the base unit,
//           within [base_unit, max_batch]
//
// The factor-of-two clamp keeps a single noisy measurement (driver
// warm-up, first-use pipeline compile) from collapsing or exploding the
// batch. Batches shorter than the current size (the tail of a facet) are
// only used when they ran slower than target, as a short batch says little
// about the throughput of a full one.

use std::time::Duration;

use log::trace;

/// Default per-dispatch latency target.
pub const DEFAULT_TARGET_LATENCY: Duration = Duration::from_millis(50);

/// Base units in the first batch after a reset.
const INITIAL_UNITS: u64 = 16;

#[derive(Debug, Clone)]
pub struct WorkSizeManager {
    target: Duration,
    base_unit: u64,
    max_batch: u64,
    current: u64,
}

impl WorkSizeManager {
    pub fn new(target: Duration) -> Self {
        let mut wsm = WorkSizeManager { target, base_unit: 1, max_batch: u64::MAX, current: 1 };
        wsm.reset(1, u64::MAX);
        wsm
    }

    /// Start a new task with the kernel's batch granularity and limit.
    pub fn reset(&mut self, base_unit: u64, max_batch: u64) {
        self.base_unit = base_unit.max(1);
        self.max_batch = max_batch.max(self.base_unit);
        self.current = self.fit(self.base_unit.saturating_mul(INITIAL_UNITS));
    }

    /// Proposed size of the next batch.
    #[inline]
    pub fn batch(&self) -> u64 {
        self.current
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    /// Feed back the measured time of a batch of `batch` deformations.
    pub fn store_time(&mut self, batch: u64, elapsed: Duration) {
        if batch == 0 {
            return;
        }
        if batch < self.current && elapsed <= self.target {
            return;
        }
        let proposed = if elapsed.is_zero() {
            self.current.saturating_mul(2)
        } else {
            let ratio = self.target.as_secs_f64() / elapsed.as_secs_f64();
            (batch as f64 * ratio).min(u64::MAX as f64) as u64
        };
        let lo = (self.current / 2).max(1);
        let hi = self.current.saturating_mul(2);
        let next = self.fit(proposed.clamp(lo, hi));
        if next != self.current {
            trace!("work size {} -> {next} ({batch} in {elapsed:?})", self.current);
        }
        self.current = next;
    }

    fn fit(&self, n: u64) -> u64 {
        let n = n.min(self.max_batch);
        ((n / self.base_unit) * self.base_unit).max(self.base_unit)
    }
}

impl Default for WorkSizeManager {
    fn default() -> Self {
        WorkSizeManager::new(DEFAULT_TARGET_LATENCY)
    }
}
