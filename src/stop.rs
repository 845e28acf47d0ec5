// stop.rs -- Cooperative cancellation flag.
//
// The flag is monotonic (false -> true, never back while a run is live) and
// shared between the device path and the worker pool without a lock.
// Release on store / Acquire on load is enough: a worker that observes the
// flag also observes everything the stopping thread wrote before it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, cloneable stop signal.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag::default()
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Re-arm the flag for a new run.
    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let a = StopFlag::new();
        let b = a.clone();
        assert!(!b.is_stopped());
        a.stop();
        assert!(b.is_stopped());
        a.stop();
        assert!(b.is_stopped());
        b.reset();
        assert!(!a.is_stopped());
    }

    #[test]
    fn visible_across_threads() {
        let flag = StopFlag::new();
        let f2 = flag.clone();
        std::thread::spawn(move || f2.stop()).join().unwrap();
        assert!(flag.is_stopped());
    }
}
