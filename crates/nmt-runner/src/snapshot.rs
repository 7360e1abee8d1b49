use crate::config::PID_PLACEHOLDER;
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{info, warn};

/// Filename-safe, millisecond resolution.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%3f";

const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Baseline,
    Periodic,
    Final,
}

impl SnapshotKind {
    pub fn tag(self) -> &'static str {
        match self {
            SnapshotKind::Baseline => "nmt-baseline",
            SnapshotKind::Periodic => "nmt-periodic",
            SnapshotKind::Final => "nmt-final",
        }
    }
}

pub fn current_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub kind: SnapshotKind,
    pub description: String,
    pub timestamp: String,
}

impl SnapshotRequest {
    pub fn new(kind: SnapshotKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            timestamp: current_timestamp(),
        }
    }

    pub fn stem(&self) -> String {
        format!("{}-{}", self.kind.tag(), self.timestamp)
    }
}

/// The `.log`/`.err` pair a single capture writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTargets {
    pub output: PathBuf,
    pub error: PathBuf,
}

impl SnapshotTargets {
    /// Creates both files exclusively under `dir`. When `stem` is already
    /// taken a numeric suffix is appended, so two captures never share files.
    pub fn reserve(dir: &Path, stem: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                stem.to_string()
            } else {
                format!("{}-{}", stem, attempt)
            };
            let output = dir.join(format!("{}.log", name));
            let error = dir.join(format!("{}.err", name));
            match create_new(&output) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
            match create_new(&error) {
                Ok(()) => return Ok(Self { output, error }),
                Err(e) => {
                    let _ = fs::remove_file(&output);
                    if e.kind() != io::ErrorKind::AlreadyExists {
                        return Err(e);
                    }
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free snapshot file name for {}", stem),
        ))
    }
}

fn create_new(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(|_| ())
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot command is empty")]
    EmptyCommand,
    #[error("cannot open snapshot target {}: {source}", .path.display())]
    Target {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("snapshot command exited with {}", describe_code(.0))]
    ExitStatus(Option<i32>),
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// Produces one diagnostic snapshot of the running process.
pub trait SnapshotCapturer: Send + Sync {
    fn capture(&self, output: &Path, error: &Path, description: &str)
        -> Result<(), SnapshotError>;
}

/// Runs an external command against this process, e.g. `pmap -x {pid}`.
#[derive(Debug, Clone)]
pub struct CommandCapturer {
    command: Vec<String>,
    pid: u32,
}

impl CommandCapturer {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            pid: std::process::id(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn resolved_command(&self) -> Vec<String> {
        let pid = self.pid.to_string();
        self.command
            .iter()
            .map(|part| part.replace(PID_PLACEHOLDER, &pid))
            .collect()
    }
}

impl SnapshotCapturer for CommandCapturer {
    fn capture(&self, output: &Path, error: &Path, _description: &str) -> Result<(), SnapshotError> {
        let resolved = self.resolved_command();
        let (program, args) = resolved.split_first().ok_or(SnapshotError::EmptyCommand)?;
        let stdout = open_target(output)?;
        let stderr = open_target(error)?;
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .map_err(|source| SnapshotError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(SnapshotError::ExitStatus(status.code()));
        }
        Ok(())
    }
}

fn open_target(path: &Path) -> Result<File, SnapshotError> {
    File::create(path).map_err(|source| SnapshotError::Target {
        path: path.to_path_buf(),
        source,
    })
}

/// Outcome of one capture attempt, kept for the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub kind: SnapshotKind,
    pub description: String,
    pub targets: Option<SnapshotTargets>,
    pub succeeded: bool,
}

/// Captures a snapshot into `dir`. Failures are logged and reported in the
/// record, never returned.
pub fn take_snapshot(
    capturer: &dyn SnapshotCapturer,
    dir: &Path,
    kind: SnapshotKind,
    description: &str,
) -> SnapshotRecord {
    let request = SnapshotRequest::new(kind, description);
    info!(tag = kind.tag(), "capturing NMT dump: {}", description);
    let targets = match SnapshotTargets::reserve(dir, &request.stem()) {
        Ok(targets) => targets,
        Err(err) => {
            warn!(tag = kind.tag(), error = %err, "cannot create NMT dump files");
            return SnapshotRecord {
                kind,
                description: request.description,
                targets: None,
                succeeded: false,
            };
        }
    };
    let succeeded = match capturer.capture(&targets.output, &targets.error, description) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                tag = kind.tag(),
                error = %err,
                "failed to capture NMT dump: {}",
                description
            );
            false
        }
    };
    SnapshotRecord {
        kind,
        description: request.description,
        targets: Some(targets),
        succeeded,
    }
}
