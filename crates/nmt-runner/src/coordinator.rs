use crate::config::{FailurePolicy, RunConfig, RunOptions};
use crate::counter::{FinalSnapshotGuard, ProgressCounter};
use crate::pool::{AwaitOutcome, PoolError, TaskFailure, WorkerPool};
use crate::progress::{ProgressObserver, SilentProgress};
use crate::sampler::{PeriodicSampler, SamplerError};
use crate::snapshot::{take_snapshot, SnapshotCapturer, SnapshotKind, SnapshotRecord};
use crate::work::{TaskContext, UnitOfWork, WorkError};
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    NormalCompletion,
    Timeout,
    Interrupted,
}

impl TerminationReason {
    pub fn label(self) -> &'static str {
        match self {
            TerminationReason::NormalCompletion => "normal completion",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Interrupted => "interrupted",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::NormalCompletion => "normal_completion",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error("unrecoverable task failure: {failure} ({completed} task(s) completed)")]
    TaskFailed { failure: TaskFailure, completed: u64 },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub reason: TerminationReason,
    pub completed: u64,
    pub failed: u64,
    pub discarded: usize,
    pub subject: PathBuf,
    pub elapsed: Duration,
    pub snapshots: Vec<SnapshotRecord>,
    /// An interruption arrived after another exit path had already been taken.
    pub interrupted_during_shutdown: bool,
}

impl RunReport {
    /// Whether the process still owes its parent the interruption.
    pub fn interruption_pending(&self) -> bool {
        self.reason == TerminationReason::Interrupted || self.interrupted_during_shutdown
    }

    pub fn count_of(&self, kind: SnapshotKind) -> usize {
        self.snapshots.iter().filter(|s| s.kind == kind).count()
    }
}

/// Final snapshot label for a run aborted by a failed task.
const TASK_FAILURE_LABEL: &str = "task failure";

type SnapshotLog = Arc<Mutex<Vec<SnapshotRecord>>>;

/// Drives one harness run: baseline snapshot, sampler, worker pool, bounded
/// wait, then sampler stop and exactly one final snapshot.
pub struct Coordinator {
    config: RunConfig,
    options: RunOptions,
    capturer: Arc<dyn SnapshotCapturer>,
    work: Arc<dyn UnitOfWork>,
    progress: Arc<dyn ProgressObserver>,
    interrupt: Receiver<()>,
    counter: Arc<ProgressCounter>,
    final_guard: Arc<FinalSnapshotGuard>,
    snapshots: SnapshotLog,
}

impl Coordinator {
    pub fn new(
        config: RunConfig,
        options: RunOptions,
        capturer: Arc<dyn SnapshotCapturer>,
        work: Arc<dyn UnitOfWork>,
    ) -> Self {
        Self {
            config,
            options,
            capturer,
            work,
            progress: Arc::new(SilentProgress),
            interrupt: crossbeam_channel::never(),
            counter: Arc::new(ProgressCounter::new()),
            final_guard: Arc::new(FinalSnapshotGuard::new()),
            snapshots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Each message on `interrupt` is a cancellation request for the run.
    pub fn with_interrupt(mut self, interrupt: Receiver<()>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    pub fn counter(&self) -> Arc<ProgressCounter> {
        Arc::clone(&self.counter)
    }

    pub fn run(self) -> Result<RunReport, RunError> {
        let started = Instant::now();

        // No worker thread exists until the baseline has been attempted.
        self.snapshot(SnapshotKind::Baseline, "Baseline (before thread start)");

        let mut sampler = PeriodicSampler::new(self.options.sampler_grace);
        if self.config.sampling_enabled() {
            sampler.start(self.config.sample_interval(), self.periodic_capture())?;
            info!(
                interval_ms = self.config.sample_interval().as_millis() as u64,
                "periodic NMT dumps enabled"
            );
        }

        let mut pool = WorkerPool::new(self.config.worker_count())?;
        let subject: Arc<Path> = Arc::from(self.config.subject());
        for _ in 0..self.config.invocation_count() {
            pool.submit(self.task(Arc::clone(&subject)))?;
        }
        pool.close_for_submission();
        info!(
            workers = self.config.worker_count(),
            invocations = self.config.invocation_count(),
            subject = %self.config.subject().display(),
            "submitted all tasks"
        );

        let deadline = Instant::now() + self.options.completion_timeout;
        let mut failed = 0u64;
        let reason = loop {
            match pool.await_until(deadline, &self.interrupt) {
                AwaitOutcome::Completed => break TerminationReason::NormalCompletion,
                AwaitOutcome::TimedOut => break TerminationReason::Timeout,
                AwaitOutcome::Interrupted => break TerminationReason::Interrupted,
                AwaitOutcome::Failed(failure) => {
                    failed += 1;
                    error!(worker = %failure.worker, error = %failure.message, "task failed");
                    if self.options.failure_policy == FailurePolicy::Abort {
                        pool.force_cancel_remaining();
                        sampler.stop();
                        self.finish(TASK_FAILURE_LABEL);
                        return Err(RunError::TaskFailed {
                            failure,
                            completed: self.counter.current_value(),
                        });
                    }
                }
            }
        };

        let discarded = match reason {
            TerminationReason::NormalCompletion => {
                pool.join();
                info!(
                    completed = self.counter.current_value(),
                    subject = %self.config.subject().display(),
                    "all tasks completed"
                );
                0
            }
            TerminationReason::Timeout => {
                warn!(
                    timeout_secs = self.options.completion_timeout.as_secs(),
                    "timeout while waiting for tasks to complete"
                );
                pool.force_cancel_remaining()
            }
            TerminationReason::Interrupted => {
                warn!("interrupted while waiting for tasks to complete");
                pool.force_cancel_remaining()
            }
        };

        sampler.stop();
        self.finish(reason.label());

        let mut interrupted_during_shutdown = false;
        if reason != TerminationReason::Interrupted && self.interrupt.try_recv().is_ok() {
            warn!("interrupt received during shutdown");
            interrupted_during_shutdown = true;
            self.finish(TerminationReason::Interrupted.label());
        }

        let snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(RunReport {
            reason,
            completed: self.counter.current_value(),
            failed,
            discarded,
            subject: self.config.subject().to_path_buf(),
            elapsed: started.elapsed(),
            snapshots,
            interrupted_during_shutdown,
        })
    }

    /// Attempts the final snapshot; only the first caller captures.
    fn finish(&self, label: &str) -> bool {
        let fired = self.final_guard.try_fire(|| {
            self.snapshot(SnapshotKind::Final, &format!("Final ({})", label));
        });
        if !fired {
            info!(reason = label, "final NMT dump already captured");
        }
        fired
    }

    fn snapshot(&self, kind: SnapshotKind, description: &str) {
        record_snapshot(
            &self.snapshots,
            self.capturer.as_ref(),
            &self.options.snapshot_dir,
            kind,
            description,
        );
    }

    fn periodic_capture(&self) -> impl FnMut() + Send + 'static {
        let snapshots = Arc::clone(&self.snapshots);
        let capturer = Arc::clone(&self.capturer);
        let dir = self.options.snapshot_dir.clone();
        move || {
            record_snapshot(
                &snapshots,
                capturer.as_ref(),
                &dir,
                SnapshotKind::Periodic,
                "Periodic dump",
            )
        }
    }

    fn task(
        &self,
        subject: Arc<Path>,
    ) -> impl FnOnce(&TaskContext<'_>) -> Result<(), WorkError> + Send + 'static {
        let work = Arc::clone(&self.work);
        let counter = Arc::clone(&self.counter);
        let progress = Arc::clone(&self.progress);
        move |ctx: &TaskContext<'_>| {
            work.execute(&subject, ctx)?;
            let completed = counter.increment_and_get();
            progress.task_completed(completed, ctx.worker);
            Ok(())
        }
    }
}

fn record_snapshot(
    log: &SnapshotLog,
    capturer: &dyn SnapshotCapturer,
    dir: &Path,
    kind: SnapshotKind,
    description: &str,
) {
    let record = take_snapshot(capturer, dir, kind, description);
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(record);
}
