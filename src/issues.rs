use std::fs::{self, OpenOptions};
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueClass {
    Skip,
    Fatal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub timestamp: String,
    pub component: String,
    pub unit: String,
    pub class: IssueClass,
    pub message: String,
}

/// JSON-lines log of skipped units, warnings and aborts. Kept apart from the ledger.
#[derive(Debug, Clone)]
pub struct IssueLog {
    path: Utf8PathBuf,
}

impl IssueLog {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn record(
        &self,
        component: &str,
        unit: &str,
        class: IssueClass,
        message: &str,
    ) -> Result<(), StageError> {
        match class {
            IssueClass::Fatal => error!(component, unit, "{message}"),
            IssueClass::Skip | IssueClass::Warning => warn!(component, unit, "{message}"),
        }
        let record = IssueRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            component: component.to_string(),
            unit: unit.to_string(),
            class,
            message: message.to_string(),
        };
        let mut line =
            serde_json::to_string(&record).map_err(|err| StageError::Filesystem(err.to_string()))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| StageError::io(format!("create {parent}"), err))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_std_path())
            .map_err(|err| StageError::io(format!("open issue log {}", self.path), err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| StageError::io(format!("append issue log {}", self.path), err))
    }

    /// Records without failing the caller; the issue is still visible through tracing.
    pub fn note(&self, component: &str, unit: &str, class: IssueClass, message: &str) {
        if let Err(err) = self.record(component, unit, class, message) {
            warn!(issue_log = %self.path, "issue log unavailable: {err}");
        }
    }

    pub fn read_all(&self) -> Result<Vec<IssueRecord>, StageError> {
        if !self.path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| StageError::io(format!("read issue log {}", self.path), err))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| StageError::Filesystem(err.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_appended_as_json_lines() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("issues.jsonl")).unwrap();
        let log = IssueLog::new(path);
        log.record("batcher", "chunk 1", IssueClass::Skip, "download failed")
            .unwrap();
        log.note("slices", "case_00001", IssueClass::Warning, "identity affine");

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].class, IssueClass::Skip);
        assert_eq!(records[1].unit, "case_00001");
    }
}
