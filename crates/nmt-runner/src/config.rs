use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_SAMPLER_GRACE_SECS: u64 = 3;
pub const PID_PLACEHOLDER: &str = "{pid}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("thread count and invocation count must be positive integers")]
    NonPositiveCount,
    #[error("subject file does not exist: {}", .0.display())]
    SubjectMissing(PathBuf),
    #[error("path is not a regular file: {}", .0.display())]
    SubjectNotFile(PathBuf),
    #[error("cannot resolve subject path {}: {source}", .path.display())]
    SubjectUnresolved {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read settings file {}: {source}", .path.display())]
    SettingsRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid settings file {}: {source}", .path.display())]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

/// Validated parameters of a single harness run.
///
/// Only constructible through [`RunConfig::new`], so holding one means the
/// subject exists and both counts are positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    worker_count: usize,
    invocation_count: u64,
    subject: PathBuf,
    sample_interval: Duration,
}

impl RunConfig {
    pub fn new(
        worker_count: usize,
        invocation_count: u64,
        subject: &Path,
        sample_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if worker_count == 0 || invocation_count == 0 {
            return Err(ConfigError::NonPositiveCount);
        }
        let absolute = absolutize(subject);
        if !absolute.exists() {
            return Err(ConfigError::SubjectMissing(absolute));
        }
        if !absolute.is_file() {
            return Err(ConfigError::SubjectNotFile(absolute));
        }
        let subject = absolute
            .canonicalize()
            .map_err(|source| ConfigError::SubjectUnresolved {
                path: absolute.clone(),
                source,
            })?;
        Ok(Self {
            worker_count,
            invocation_count,
            subject,
            sample_interval,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocation_count
    }

    /// Canonical path of the subject resource.
    pub fn subject(&self) -> &Path {
        &self.subject
    }

    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    pub fn sampling_enabled(&self) -> bool {
        !self.sample_interval.is_zero()
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First task failure terminates the run.
    #[default]
    Abort,
    /// Task failures are logged and counted; the run carries on.
    Continue,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Abort => "abort",
            FailurePolicy::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotSettings {
    pub command: Vec<String>,
    pub dir: PathBuf,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            command: vec!["pmap".to_string(), "-x".to_string(), PID_PLACEHOLDER.to_string()],
            dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkSettings {
    pub rotate_degrees: Option<u32>,
    pub artifact_dir: Option<PathBuf>,
}

/// Harness knobs that are not part of the positional run arguments.
///
/// Layering is defaults, then the YAML settings file, then command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSettings {
    pub snapshot: SnapshotSettings,
    pub completion_timeout_secs: u64,
    pub sampler_grace_secs: u64,
    pub failure_policy: FailurePolicy,
    pub work: WorkSettings,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            snapshot: SnapshotSettings::default(),
            completion_timeout_secs: DEFAULT_COMPLETION_TIMEOUT_SECS,
            sampler_grace_secs: DEFAULT_SAMPLER_GRACE_SECS,
            failure_policy: FailurePolicy::default(),
            work: WorkSettings::default(),
        }
    }
}

impl HarnessSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::SettingsRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data).map_err(|source| ConfigError::SettingsParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(data: &str) -> Result<Self, serde_yaml::Error> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.snapshot.command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::InvalidSetting {
                    key: "snapshot.command",
                    reason: "must name a program to run".to_string(),
                })
            }
        }
        if self.completion_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "completion_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(degrees) = self.work.rotate_degrees {
            if degrees % 90 != 0 || degrees >= 360 {
                return Err(ConfigError::InvalidSetting {
                    key: "work.rotate_degrees",
                    reason: format!("expected one of 0, 90, 180, 270, got {}", degrees),
                });
            }
        }
        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            completion_timeout: Duration::from_secs(self.completion_timeout_secs),
            sampler_grace: Duration::from_secs(self.sampler_grace_secs),
            failure_policy: self.failure_policy,
            snapshot_dir: self.snapshot.dir.clone(),
        }
    }
}

/// Coordinator tuning derived from [`HarnessSettings`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub completion_timeout: Duration,
    pub sampler_grace: Duration,
    pub failure_policy: FailurePolicy,
    pub snapshot_dir: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        HarnessSettings::default().run_options()
    }
}
