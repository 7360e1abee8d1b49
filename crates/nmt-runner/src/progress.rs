use std::io::{self, Write};

/// Receives a notification each time a task completes.
pub trait ProgressObserver: Send + Sync {
    fn task_completed(&self, completed: u64, worker: &str);
}

/// Rewrites a single stdout line in place.
#[derive(Debug, Default)]
pub struct ConsoleProgress;

impl ProgressObserver for ConsoleProgress {
    fn task_completed(&self, completed: u64, worker: &str) {
        let mut out = io::stdout().lock();
        let _ = write!(
            out,
            "\rTasks completed: {} (by thread: {})",
            completed, worker
        );
        let _ = out.flush();
    }
}

#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressObserver for SilentProgress {
    fn task_completed(&self, _completed: u64, _worker: &str) {}
}
