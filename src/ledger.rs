//! Append-only record of series that have been fully processed.
//!
//! The file holds one identifier per line and is only ever appended to, so a
//! crash mid-write leaves a valid prefix. A torn final line never equals a
//! real identifier; the next append starts on a fresh line.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::domain::SeriesId;
use crate::error::StageError;

#[derive(Debug)]
pub struct Ledger {
    path: Utf8PathBuf,
    completed: HashSet<String>,
}

impl Ledger {
    pub fn open(path: &Utf8Path) -> Result<Self, StageError> {
        let completed = if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| StageError::io(format!("read ledger {path}"), err))?;
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            HashSet::new()
        };
        debug!(ledger = %path, entries = completed.len(), "ledger loaded");
        Ok(Self {
            path: path.to_path_buf(),
            completed,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn is_complete(&self, id: &SeriesId) -> bool {
        self.completed.contains(id.as_str())
    }

    /// `all - completed`, keeping the order of `all`.
    pub fn pending(&self, all: &[SeriesId]) -> Vec<SeriesId> {
        let mut seen = HashSet::new();
        all.iter()
            .filter(|id| !self.is_complete(id) && seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    /// Appends identifiers not yet recorded and syncs the file. Returns how many were written.
    pub fn append(&mut self, ids: &[SeriesId]) -> Result<usize, StageError> {
        let mut fresh = Vec::new();
        for id in ids {
            if !self.completed.contains(id.as_str()) && !fresh.contains(&id) {
                fresh.push(id);
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| StageError::io(format!("create {parent}"), err))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(self.path.as_std_path())
            .map_err(|err| StageError::io(format!("open ledger {}", self.path), err))?;

        let mut buffer = String::new();
        if needs_leading_newline(&mut file)
            .map_err(|err| StageError::io(format!("inspect ledger {}", self.path), err))?
        {
            buffer.push('\n');
        }
        for id in &fresh {
            buffer.push_str(id.as_str());
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|err| StageError::io(format!("append ledger {}", self.path), err))?;

        for id in &fresh {
            self.completed.insert(id.as_str().to_string());
        }
        Ok(fresh.len())
    }
}

fn needs_leading_newline(file: &mut fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
