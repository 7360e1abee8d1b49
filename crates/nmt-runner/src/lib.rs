//! Concurrent load harness that hammers a unit of work from a fixed worker
//! pool while capturing native memory snapshots of the process: one baseline,
//! optional periodic ones, and exactly one final snapshot per run.

mod config;
mod coordinator;
mod counter;
mod pool;
mod progress;
mod sampler;
mod snapshot;
mod work;

pub use config::{
    ConfigError, FailurePolicy, HarnessSettings, RunConfig, RunOptions, SnapshotSettings,
    WorkSettings, DEFAULT_COMPLETION_TIMEOUT_SECS, DEFAULT_SAMPLER_GRACE_SECS, PID_PLACEHOLDER,
};
pub use coordinator::{Coordinator, RunError, RunReport, TerminationReason};
pub use counter::{FinalSnapshotGuard, ProgressCounter};
pub use pool::{AwaitOutcome, PoolError, Task, TaskFailure, WorkerPool};
pub use progress::{ConsoleProgress, ProgressObserver, SilentProgress};
pub use sampler::{PeriodicSampler, SamplerError};
pub use snapshot::{
    current_timestamp, take_snapshot, CommandCapturer, SnapshotCapturer, SnapshotError,
    SnapshotKind, SnapshotRecord, SnapshotRequest, SnapshotTargets, TIMESTAMP_FORMAT,
};
pub use work::{
    ArtifactGuard, CancelFlag, TaskContext, ThumbnailWork, UnitOfWork, WorkError,
    THUMBNAIL_MAX_EDGE,
};
