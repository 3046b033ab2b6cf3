//! Scratch directory holding the artifacts of one sandboxed run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::stat::Mode;
use tempfile::TempDir;
use tracing::{debug, warn};

use super::SetupError;

/// Paths of the five artifacts generated for node `node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFiles {
    pub boot: PathBuf,
    pub manifest: PathBuf,
    pub nvram: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl RuntimeFiles {
    pub fn new(dir: &Path, node: u32) -> Self {
        let file = |name: &str| dir.join(format!("{}.{}", name, node));
        Self {
            boot: file("boot"),
            manifest: file("manifest"),
            nvram: file("nvram"),
            stdout: file("stdout"),
            stderr: file("stderr"),
        }
    }

    pub fn all(&self) -> [&Path; 5] {
        [
            &self.boot,
            &self.manifest,
            &self.nvram,
            &self.stdout,
            &self.stderr,
        ]
    }

    /// Refuse to reuse a directory that still holds artifacts of another run.
    pub fn ensure_absent(&self) -> Result<(), SetupError> {
        match self.all().into_iter().find(|p| p.exists()) {
            Some(existing) => Err(SetupError::ArtifactExists(existing.to_path_buf())),
            None => Ok(()),
        }
    }
}

enum Location {
    Temporary(TempDir),
    Saved(PathBuf),
}

/// Working directory owned by one invocation.
///
/// A temporary directory is removed on drop; a user-supplied save directory is kept.
pub struct WorkDir {
    location: Location,
    files: RuntimeFiles,
}

impl WorkDir {
    pub fn create(save_dir: Option<&Path>, node: u32) -> Result<Self> {
        let location = match save_dir {
            Some(dir) => {
                let dir = std::path::absolute(dir)
                    .with_context(|| format!("Invalid save directory: {}", dir.display()))?;
                fs::create_dir_all(&dir).with_context(|| {
                    format!("Failed to create save directory: {}", dir.display())
                })?;
                Location::Saved(dir)
            }
            None => Location::Temporary(
                tempfile::Builder::new()
                    .prefix("zvsh-")
                    .tempdir()
                    .context("Failed to create temporary working directory")?,
            ),
        };

        let path = match &location {
            Location::Temporary(tmp) => tmp.path().to_path_buf(),
            Location::Saved(dir) => dir.clone(),
        };
        let files = RuntimeFiles::new(&path, node);
        files.ensure_absent()?;

        debug!(dir = %path.display(), node, "workdir:created");
        Ok(Self { location, files })
    }

    /// Create the stdout and stderr transport FIFOs.
    pub fn create_fifos(&self) -> Result<()> {
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        for fifo in [&self.files.stdout, &self.files.stderr] {
            nix::unistd::mkfifo(fifo, mode)
                .with_context(|| format!("Failed to create transport FIFO {}", fifo.display()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        match &self.location {
            Location::Temporary(tmp) => tmp.path(),
            Location::Saved(dir) => dir,
        }
    }

    pub fn files(&self) -> &RuntimeFiles {
        &self.files
    }

    pub fn is_retained(&self) -> bool {
        matches!(self.location, Location::Saved(_))
    }

    /// Remove the directory now, logging instead of failing if removal breaks.
    pub fn cleanup(self) {
        match self.location {
            Location::Temporary(tmp) => {
                let path = tmp.path().to_path_buf();
                if let Err(e) = tmp.close() {
                    warn!(dir = %path.display(), error = %e, "workdir:cleanup failed");
                } else {
                    debug!(dir = %path.display(), "workdir:removed");
                }
            }
            Location::Saved(dir) => {
                debug!(dir = %dir.display(), "workdir:retained");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RuntimeFiles, WorkDir};
    use crate::sandbox::SetupError;
    use std::fs;
    use std::os::unix::fs::FileTypeExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    #[test]
    fn runtime_file_names() {
        let files = RuntimeFiles::new(Path::new("foo/"), 1);
        assert_eq!(files.boot, PathBuf::from("foo/boot.1"));
        assert_eq!(files.manifest, PathBuf::from("foo/manifest.1"));
        assert_eq!(files.nvram, PathBuf::from("foo/nvram.1"));
        assert_eq!(files.stdout, PathBuf::from("foo/stdout.1"));
        assert_eq!(files.stderr, PathBuf::from("foo/stderr.1"));
    }

    #[test]
    fn existing_artifact_is_fatal() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("nvram.1"), "stale").unwrap();

        let err = match WorkDir::create(Some(temp.path()), 1) {
            Ok(_) => panic!("expected stale nvram to be rejected"),
            Err(e) => e,
        };
        match err.downcast_ref::<SetupError>() {
            Some(SetupError::ArtifactExists(path)) => assert!(path.ends_with("nvram.1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn save_dir_is_created_and_retained() {
        let temp = TempDir::new().unwrap();
        let save = temp.path().join("nested/run");

        let workdir = WorkDir::create(Some(&save), 3).unwrap();
        workdir.create_fifos().unwrap();
        assert!(workdir.is_retained());
        let stdout_meta = fs::metadata(&workdir.files().stdout).unwrap();
        assert!(stdout_meta.file_type().is_fifo());
        workdir.cleanup();

        assert!(save.join("stderr.3").exists());
    }

    #[test]
    fn temporary_dir_is_removed() {
        let workdir = WorkDir::create(None, 1).unwrap();
        let path = workdir.path().to_path_buf();
        assert!(path.exists());
        workdir.cleanup();
        assert!(!path.exists());
    }
}
