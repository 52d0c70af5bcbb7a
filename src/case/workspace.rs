//! Per-configuration working copy.
//!
//! ```text
//! <tmp>/src    project root the builder reads; steps are applied here
//! <tmp>/out    output directory
//! <tmp>/cache  cache directory, unless the case shares a cache group
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use super::FileChange;
use crate::error::HarnessError;

pub struct Workspace {
    // Held for its Drop.
    _dir: tempfile::TempDir,
    project_root: PathBuf,
    output_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Workspace {
    /// Create a fresh working copy under `work_root` (the system temp directory when `None`).
    pub fn new(work_root: Option<&Path>, shared_cache: Option<PathBuf>) -> Result<Self, HarnessError> {
        let dir = match work_root {
            Some(root) => {
                fs::create_dir_all(root).map_err(|e| HarnessError::io(format!("creating {}", root.display()), e))?;
                tempfile::Builder::new().prefix("case-").tempdir_in(root)
            }
            None => tempfile::Builder::new().prefix("bundletest-").tempdir(),
        }
        .map_err(|e| HarnessError::io("creating case workspace", e))?;

        let project_root = dir.path().join("src");
        let output_dir = dir.path().join("out");
        let cache_dir = shared_cache.unwrap_or_else(|| dir.path().join("cache"));
        for path in [&project_root, &output_dir, &cache_dir] {
            fs::create_dir_all(path).map_err(|e| HarnessError::io(format!("creating {}", path.display()), e))?;
        }
        Ok(Self {
            _dir: dir,
            project_root,
            output_dir,
            cache_dir,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Write and remove files for one step.
    pub fn apply(&self, delta: &[FileChange]) -> Result<(), HarnessError> {
        for change in delta {
            let path = self.project_root.join(change.path());
            match change {
                FileChange::Write { content, .. } => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| HarnessError::io(format!("creating {}", parent.display()), e))?;
                    }
                    fs::write(&path, content).map_err(|e| HarnessError::io(format!("writing {}", path.display()), e))?;
                }
                FileChange::Remove { .. } => match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!(path = %change.path(), "step removes a file that does not exist");
                    }
                    Err(e) => return Err(HarnessError::io(format!("removing {}", path.display()), e)),
                },
            }
        }
        Ok(())
    }
}
