use std::fs;

use camino::Utf8Path;
use tracing::debug;

use crate::error::StageError;

/// Empties the staging directory once a batch's conversion decisions are made.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagingReclaimer;

impl StagingReclaimer {
    /// Removes everything under `staging_root`, keeping the directory itself.
    /// Returns the number of top-level entries removed.
    pub fn reclaim(&self, staging_root: &Utf8Path) -> Result<usize, StageError> {
        if !staging_root.as_std_path().exists() {
            return Ok(0);
        }
        let entries = staging_root
            .read_dir_utf8()
            .map_err(|err| StageError::io(format!("read {staging_root}"), err))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|err| StageError::io(format!("read {staging_root}"), err))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| StageError::io(format!("stat {path}"), err))?;
            if file_type.is_dir() {
                fs::remove_dir_all(path.as_std_path())
            } else {
                fs::remove_file(path.as_std_path())
            }
            .map_err(|err| StageError::io(format!("remove {path}"), err))?;
            removed += 1;
        }
        debug!(staging = %staging_root, removed, "staging reclaimed");
        Ok(removed)
    }
}
