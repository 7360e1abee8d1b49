use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Completed-task counter shared by every worker of a run.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    completed: AtomicU64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the post-increment value.
    pub fn increment_and_get(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_value(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

/// One-shot latch in front of the final snapshot.
#[derive(Debug, Default)]
pub struct FinalSnapshotGuard {
    fired: AtomicBool,
}

impl FinalSnapshotGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `capture` if no caller has won the latch yet. Returns whether this
    /// call ran it.
    pub fn try_fire<F: FnOnce()>(&self, capture: F) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        capture();
        true
    }

    #[cfg(test)]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
