use chrono::Utc;
use image::{DynamicImage, ImageFormat};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const THUMBNAIL_MAX_EDGE: u32 = 320;

#[derive(Debug, Error)]
pub enum WorkError {
    #[error("task cancelled")]
    Cancelled,
    #[error("error getting media information from {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("error saving thumbnail {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("error deleting thumbnail {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Failed(String),
}

/// Shared cancellation signal raised when a run gives up on its tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a task can see about the worker running it.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub worker: &'a str,
    pub cancel: &'a CancelFlag,
}

impl TaskContext<'_> {
    pub fn check_cancelled(&self) -> Result<(), WorkError> {
        if self.cancel.is_cancelled() {
            return Err(WorkError::Cancelled);
        }
        Ok(())
    }
}

/// One invocation of the operation under load.
///
/// Implementations must release every intermediate artifact before
/// returning, on success and on error alike.
pub trait UnitOfWork: Send + Sync {
    fn execute(&self, subject: &Path, ctx: &TaskContext<'_>) -> Result<(), WorkError>;
}

impl<F> UnitOfWork for F
where
    F: Fn(&Path, &TaskContext<'_>) -> Result<(), WorkError> + Send + Sync,
{
    fn execute(&self, subject: &Path, ctx: &TaskContext<'_>) -> Result<(), WorkError> {
        self(subject, ctx)
    }
}

/// Removes an intermediate file when dropped unless [`ArtifactGuard::release`]
/// already did so.
#[derive(Debug)]
pub struct ArtifactGuard {
    path: PathBuf,
    released: bool,
}

impl ArtifactGuard {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the artifact; failing to do so fails the task.
    pub fn release(mut self) -> Result<(), WorkError> {
        fs::remove_file(&self.path).map_err(|source| WorkError::Cleanup {
            path: self.path.clone(),
            source,
        })?;
        self.released = true;
        Ok(())
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Decodes the subject image, orients it, writes a PNG thumbnail and
/// deletes it again.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailWork {
    rotate_degrees: Option<u32>,
    artifact_dir: Option<PathBuf>,
}

impl ThumbnailWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rotation(mut self, degrees: Option<u32>) -> Self {
        self.rotate_degrees = degrees;
        self
    }

    pub fn with_artifact_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.artifact_dir = dir;
        self
    }

    fn thumbnail_path(&self, subject: &Path) -> PathBuf {
        let file_name = subject
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("subject");
        let dir = match &self.artifact_dir {
            Some(dir) => dir.as_path(),
            None => subject.parent().unwrap_or_else(|| Path::new(".")),
        };
        dir.join(format!("{}{}.png", file_name, unique_suffix()))
    }
}

impl UnitOfWork for ThumbnailWork {
    fn execute(&self, subject: &Path, ctx: &TaskContext<'_>) -> Result<(), WorkError> {
        let decoded = image::open(subject).map_err(|source| WorkError::Decode {
            path: subject.to_path_buf(),
            source,
        })?;
        debug!(
            worker = ctx.worker,
            width = decoded.width(),
            height = decoded.height(),
            "decoded subject"
        );
        ctx.check_cancelled()?;

        let thumbnail =
            orient(decoded, self.rotate_degrees).thumbnail(THUMBNAIL_MAX_EDGE, THUMBNAIL_MAX_EDGE);
        ctx.check_cancelled()?;

        let artifact = ArtifactGuard::new(self.thumbnail_path(subject));
        thumbnail
            .save_with_format(artifact.path(), ImageFormat::Png)
            .map_err(|source| WorkError::Encode {
                path: artifact.path().to_path_buf(),
                source,
            })?;
        artifact.release()
    }
}

fn orient(image: DynamicImage, degrees: Option<u32>) -> DynamicImage {
    match degrees {
        Some(90) => image.rotate90(),
        Some(180) => image.rotate180(),
        Some(270) => image.rotate270(),
        _ => image,
    }
}

fn unique_suffix() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y-%m-%d-%H%M%S"), &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "nmt_work_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn write_subject(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("frame.png");
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 7]));
        img.save(&path).expect("write subject");
        path
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn thumbnail_work_leaves_no_artifacts() {
        let dir = scratch_dir("clean");
        let subject = write_subject(&dir, 640, 360);
        let cancel = CancelFlag::new();
        let ctx = TaskContext {
            worker: "nmt-worker-0",
            cancel: &cancel,
        };
        let work = ThumbnailWork::new().with_rotation(Some(90));
        for _ in 0..3 {
            work.execute(&subject, &ctx).expect("thumbnail");
        }
        assert_eq!(entries(&dir), vec!["frame.png".to_string()]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn thumbnail_work_uses_artifact_dir() {
        let dir = scratch_dir("artifact_dir");
        let subject = write_subject(&dir, 32, 32);
        let scratch = dir.join("scratch");
        fs::create_dir_all(&scratch).expect("scratch");
        let work = ThumbnailWork::new().with_artifact_dir(Some(scratch.clone()));
        let path = work.thumbnail_path(&subject);
        assert_eq!(path.parent(), Some(scratch.as_path()));
        let name = path.file_name().and_then(|s| s.to_str()).expect("name");
        assert!(name.starts_with("frame.png"), "{}", name);
        assert!(name.ends_with(".png"), "{}", name);
        assert_ne!(path, work.thumbnail_path(&subject));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn undecodable_subject_is_a_task_failure() {
        let dir = scratch_dir("decode");
        let subject = dir.join("clip.mp4");
        fs::write(&subject, b"not an image").expect("subject");
        let cancel = CancelFlag::new();
        let ctx = TaskContext {
            worker: "w",
            cancel: &cancel,
        };
        let err = ThumbnailWork::new()
            .execute(&subject, &ctx)
            .expect_err("decode failure");
        assert!(matches!(err, WorkError::Decode { .. }), "{:?}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn cancelled_task_stops_before_writing() {
        let dir = scratch_dir("cancel");
        let subject = write_subject(&dir, 16, 16);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let ctx = TaskContext {
            worker: "w",
            cancel: &cancel,
        };
        let err = ThumbnailWork::new()
            .execute(&subject, &ctx)
            .expect_err("cancelled");
        assert!(matches!(err, WorkError::Cancelled));
        assert_eq!(entries(&dir), vec!["frame.png".to_string()]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn artifact_guard_removes_on_drop() {
        let dir = scratch_dir("guard");
        let path = dir.join("partial.png");
        fs::write(&path, b"x").expect("artifact");
        drop(ArtifactGuard::new(path.clone()));
        assert!(!path.exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn releasing_a_missing_artifact_fails() {
        let dir = scratch_dir("release");
        let err = ArtifactGuard::new(dir.join("never-written.png"))
            .release()
            .expect_err("missing artifact");
        assert!(matches!(err, WorkError::Cleanup { .. }));
        assert!(err.to_string().contains("error deleting thumbnail"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn orient_swaps_dimensions_for_quarter_turns() {
        let img = DynamicImage::new_rgb8(4, 2);
        let turned = orient(img.clone(), Some(90));
        assert_eq!((turned.width(), turned.height()), (2, 4));
        let turned = orient(img.clone(), Some(180));
        assert_eq!((turned.width(), turned.height()), (4, 2));
        let turned = orient(img.clone(), Some(270));
        assert_eq!((turned.width(), turned.height()), (2, 4));
        let same = orient(img, None);
        assert_eq!((same.width(), same.height()), (4, 2));
    }
}
