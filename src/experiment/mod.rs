//! Experiment directories and persisted artifacts
//!
//! Every run gets its own folder under the models directory. Names never
//! collide: a taken name gets a `_v2`, `_v3`, ... suffix.

pub mod checkpoint;
pub mod scalars;

use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

pub use checkpoint::{CheckpointManifest, ExperimentCheckpoint};
pub use scalars::ScalarLog;

/// A freshly created, uniquely named experiment folder
#[derive(Debug, Clone)]
pub struct ExperimentDir {
    name: String,
    path: PathBuf,
}

impl ExperimentDir {
    /// Create `<models_dir>/<name>`, versioning the name if it already exists
    pub fn create(models_dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let models_dir = models_dir.as_ref();
        fs::create_dir_all(models_dir)?;

        let mut resolved = name.to_string();
        let mut next_version = 2;
        loop {
            let path = models_dir.join(&resolved);
            match fs::create_dir(&path) {
                Ok(()) => {
                    log::info!("Created experiment folder {}", path.display());
                    return Ok(ExperimentDir {
                        name: resolved,
                        path,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    resolved = format!("{}_v{}", name, next_version);
                    next_version += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Open an existing experiment folder
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        ExperimentDir { name, path }
    }

    /// Resolved name including any version suffix
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory for scalar logs
    pub fn runs_dir(&self) -> PathBuf {
        self.path.join("runs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_names() {
        let dir = tempfile::tempdir().unwrap();

        let first = ExperimentDir::create(dir.path(), "lstm").unwrap();
        let second = ExperimentDir::create(dir.path(), "lstm").unwrap();
        let third = ExperimentDir::create(dir.path(), "lstm").unwrap();

        assert_eq!(first.name(), "lstm");
        assert_eq!(second.name(), "lstm_v2");
        assert_eq!(third.name(), "lstm_v3");
        assert!(third.path().is_dir());
    }

    #[test]
    fn test_open_existing() {
        let dir = tempfile::tempdir().unwrap();
        let created = ExperimentDir::create(dir.path(), "graph").unwrap();
        let opened = ExperimentDir::open(created.path());
        assert_eq!(opened.name(), "graph");
        assert_eq!(opened.runs_dir(), created.path().join("runs"));
    }
}
