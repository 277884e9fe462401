//! Copy-verify-delete migration of local `case_*` folders into the dataset layout.
//!
//! Moving deletes the only remaining copy of the source files. Callers must
//! hold an independent backup; nothing here checks for one.
//!
//! Each case advances through [`RelocationState`] and the state is written
//! to `<destination>/.relocation/<case>.json` after every step, so a run
//! killed between deleting the source image and copying the label resumes
//! that case instead of stranding it.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::domain::{CaseId, RunSummary, UnitOutcome, UnitReport};
use crate::error::StageError;
use crate::issues::{IssueClass, IssueLog};
use crate::store::{DatasetLayout, copy_file_no_clobber, file_has_content, write_json_atomic};

const COMPONENT: &str = "relocator";
pub const IMAGE_STEM: &str = "imaging";
pub const LABEL_STEM: &str = "segmentation";
const GLOB_CANDIDATE_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationState {
    Pending,
    ImageCopied,
    ImageVerified,
    SourceImageDeleted,
    LabelCopied,
    LabelVerified,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelocationMode {
    /// Copy, verify, then delete the source.
    Move,
    /// Copy and verify only; sources are left in place.
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseJournal {
    pub case_id: String,
    pub state: RelocationState,
    pub source_dir: String,
    pub image_source: Option<String>,
    pub label_source: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelocationReport {
    pub summary: RunSummary,
    /// Cases left mid-migration whose source folder no longer exists.
    pub stranded: Vec<String>,
}

enum CaseFailure {
    Skip(String),
    Fatal(String),
}

impl From<StageError> for CaseFailure {
    fn from(err: StageError) -> Self {
        if err.is_fatal() {
            CaseFailure::Fatal(err.to_string())
        } else {
            CaseFailure::Skip(err.to_string())
        }
    }
}

pub struct SafeRelocator<'a> {
    layout: &'a DatasetLayout,
    issues: &'a IssueLog,
    mode: RelocationMode,
}

impl<'a> SafeRelocator<'a> {
    pub fn new(layout: &'a DatasetLayout, issues: &'a IssueLog, mode: RelocationMode) -> Self {
        Self {
            layout,
            issues,
            mode,
        }
    }

    pub fn run(&self, case_dirs: &[Utf8PathBuf]) -> Result<RelocationReport, StageError> {
        self.layout.ensure_dirs()?;
        let mut report = RelocationReport::default();
        for case_dir in case_dirs {
            let unit = self.relocate_case(case_dir);
            let fatal = matches!(unit.outcome, UnitOutcome::Fatal(_));
            report.summary.record(unit);
            if fatal {
                error!(case = %case_dir, "aborting relocation run");
                break;
            }
        }
        if self.mode == RelocationMode::Move {
            report.stranded = self.stranded_cases()?;
            for case in &report.stranded {
                self.issues.note(
                    COMPONENT,
                    case,
                    IssueClass::Warning,
                    "half-migrated case whose source folder is gone; destination pair incomplete",
                );
            }
        }
        Ok(report)
    }

    pub fn relocate_case(&self, case_dir: &Utf8Path) -> UnitReport {
        let unit = case_dir
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| case_dir.to_string());
        match self.advance(case_dir) {
            Ok(outputs) => {
                let mut report = UnitReport::new(&unit, UnitOutcome::Success);
                report.outputs = outputs;
                report
            }
            Err(CaseFailure::Skip(reason)) => {
                self.issues.note(COMPONENT, &unit, IssueClass::Skip, &reason);
                UnitReport::new(&unit, UnitOutcome::Skipped(reason))
            }
            Err(CaseFailure::Fatal(reason)) => {
                self.issues.note(COMPONENT, &unit, IssueClass::Fatal, &reason);
                UnitReport::new(&unit, UnitOutcome::Fatal(reason))
            }
        }
    }

    fn advance(&self, case_dir: &Utf8Path) -> Result<Vec<String>, CaseFailure> {
        let case: CaseId = case_dir
            .file_name()
            .unwrap_or_default()
            .parse()
            .map_err(|err: StageError| CaseFailure::Skip(err.to_string()))?;
        let dst_image = self.layout.image_path(&case);
        let dst_label = self.layout.label_path(&case);
        let outputs = vec![dst_image.to_string(), dst_label.to_string()];

        let mut journal = match self.mode {
            RelocationMode::Move => self.load_journal(&case)?,
            RelocationMode::Copy => None,
        }
        .unwrap_or_else(|| CaseJournal {
            case_id: case.to_string(),
            state: RelocationState::Pending,
            source_dir: case_dir.to_string(),
            image_source: None,
            label_source: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
        });

        if journal.state == RelocationState::Complete {
            return Err(CaseFailure::Skip(format!("{case} already relocated")));
        }

        let image_src = match &journal.image_source {
            Some(path) => Some(Utf8PathBuf::from(path)),
            None => self.locate(case_dir, IMAGE_STEM)?,
        };
        let label_src = match &journal.label_source {
            Some(path) => Some(Utf8PathBuf::from(path)),
            None => self.locate(case_dir, LABEL_STEM)?,
        };

        if journal.state == RelocationState::Pending {
            // Both sources must be usable before anything is copied or deleted.
            let Some(image_src) = image_src.as_ref().filter(|p| file_has_content(p)) else {
                return Err(CaseFailure::Skip(format!("missing or empty {IMAGE_STEM} file")));
            };
            let Some(label_src) = label_src.as_ref().filter(|p| file_has_content(p)) else {
                return Err(CaseFailure::Skip(format!("missing or empty {LABEL_STEM} file")));
            };
            journal.image_source = Some(image_src.to_string());
            journal.label_source = Some(label_src.to_string());
        } else {
            info!(case = %case, state = ?journal.state, "resuming half-migrated case");
        }

        if journal.state < RelocationState::ImageCopied {
            let source = required(&image_src, IMAGE_STEM)?;
            remove_empty_leftover(&dst_image)?;
            copy_file_no_clobber(source, &dst_image)?;
            self.advance_to(&mut journal, RelocationState::ImageCopied)?;
        }
        if journal.state < RelocationState::ImageVerified {
            self.verify_copy(&mut journal, &dst_image, RelocationState::Pending)?;
            self.advance_to(&mut journal, RelocationState::ImageVerified)?;
        }
        if journal.state < RelocationState::SourceImageDeleted {
            if self.mode == RelocationMode::Move {
                verify_destination(&dst_image)?;
                if let Some(source) = &image_src {
                    remove_if_present(source)?;
                }
            }
            self.advance_to(&mut journal, RelocationState::SourceImageDeleted)?;
        }
        if journal.state < RelocationState::LabelCopied {
            let source = required(&label_src, LABEL_STEM)?;
            remove_empty_leftover(&dst_label)?;
            copy_file_no_clobber(source, &dst_label)?;
            self.advance_to(&mut journal, RelocationState::LabelCopied)?;
        }
        if journal.state < RelocationState::LabelVerified {
            self.verify_copy(&mut journal, &dst_label, RelocationState::SourceImageDeleted)?;
            self.advance_to(&mut journal, RelocationState::LabelVerified)?;
        }

        if self.mode == RelocationMode::Move {
            verify_destination(&dst_label)?;
            if let Some(source) = &label_src {
                remove_if_present(source)?;
            }
            if case_dir.as_std_path().exists() {
                if let Err(err) = fs::remove_dir_all(case_dir.as_std_path()) {
                    warn!(case = %case, "source folder not removed: {err}");
                }
            }
        }
        self.advance_to(&mut journal, RelocationState::Complete)?;
        debug!(case = %case, mode = ?self.mode, "case relocated");
        Ok(outputs)
    }

    /// `<stem><ext>` if present, else the first `<stem>*.nii*`-style match in the folder.
    fn locate(&self, case_dir: &Utf8Path, stem: &str) -> Result<Option<Utf8PathBuf>, CaseFailure> {
        let exact = case_dir.join(format!("{stem}{}", self.layout.file_ending()));
        if exact.as_std_path().is_file() {
            return Ok(Some(exact));
        }
        let ending = self.layout.file_ending();
        let primary_ext = ending
            .char_indices()
            .skip(1)
            .find(|(_, ch)| *ch == '.')
            .map(|(index, _)| &ending[..index])
            .unwrap_or(ending);
        let pattern = format!(
            "{}/{stem}*{primary_ext}*",
            glob::Pattern::escape(case_dir.as_str())
        );
        let paths = glob::glob(&pattern)
            .map_err(|err| CaseFailure::Skip(format!("bad glob {pattern}: {err}")))?;
        let mut candidates: Vec<Utf8PathBuf> = paths
            .take(GLOB_CANDIDATE_LIMIT)
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
            .collect();
        candidates.sort();
        Ok(candidates.into_iter().next())
    }

    /// Checks a fresh copy. A missing or empty destination is removed and the
    /// journal steps back to `retry_from`, so the next run copies again.
    fn verify_copy(
        &self,
        journal: &mut CaseJournal,
        dest: &Utf8Path,
        retry_from: RelocationState,
    ) -> Result<(), CaseFailure> {
        if file_has_content(dest) {
            return Ok(());
        }
        remove_if_present(dest)?;
        self.advance_to(journal, retry_from)?;
        Err(CaseFailure::Skip(format!(
            "destination {dest} missing or empty after copy"
        )))
    }

    fn journal_path(&self, case: &CaseId) -> Utf8PathBuf {
        self.layout.journal_dir().join(format!("{case}.json"))
    }

    fn load_journal(&self, case: &CaseId) -> Result<Option<CaseJournal>, CaseFailure> {
        let path = self.journal_path(case);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| StageError::io(format!("read {path}"), err))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| CaseFailure::Skip(format!("unreadable journal {path}: {err}")))
    }

    fn advance_to(
        &self,
        journal: &mut CaseJournal,
        state: RelocationState,
    ) -> Result<(), StageError> {
        journal.state = state;
        journal.updated_at = chrono::Utc::now().to_rfc3339();
        if self.mode == RelocationMode::Move {
            let case: CaseId = journal.case_id.parse()?;
            write_json_atomic(&self.journal_path(&case), journal)?;
        }
        Ok(())
    }

    /// Journals stuck before `Complete` whose source folder has disappeared.
    pub fn stranded_cases(&self) -> Result<Vec<String>, StageError> {
        let dir = self.layout.journal_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut stranded = Vec::new();
        let entries = dir
            .read_dir_utf8()
            .map_err(|err| StageError::io(format!("read {dir}"), err))?;
        for entry in entries {
            let entry = entry.map_err(|err| StageError::io(format!("read {dir}"), err))?;
            if entry.path().extension() != Some("json") {
                continue;
            }
            let content = fs::read_to_string(entry.path().as_std_path())
                .map_err(|err| StageError::io(format!("read {}", entry.path()), err))?;
            let Ok(journal) = serde_json::from_str::<CaseJournal>(&content) else {
                continue;
            };
            if journal.state != RelocationState::Complete
                && !Utf8Path::new(&journal.source_dir).as_std_path().exists()
            {
                stranded.push(journal.case_id);
            }
        }
        stranded.sort();
        Ok(stranded)
    }
}

fn required<'p>(path: &'p Option<Utf8PathBuf>, stem: &str) -> Result<&'p Utf8Path, CaseFailure> {
    match path {
        Some(path) if file_has_content(path) => Ok(path),
        _ => Err(CaseFailure::Skip(format!(
            "half-migrated case: {stem} source missing or empty"
        ))),
    }
}

fn verify_destination(path: &Utf8Path) -> Result<(), CaseFailure> {
    if file_has_content(path) {
        Ok(())
    } else {
        Err(CaseFailure::Skip(format!(
            "destination {path} missing or empty after copy"
        )))
    }
}

/// A zero-byte destination would satisfy the no-clobber copy; drop it first.
fn remove_empty_leftover(path: &Utf8Path) -> Result<(), StageError> {
    if path.as_std_path().is_file() && !file_has_content(path) {
        remove_if_present(path)?;
    }
    Ok(())
}

fn remove_if_present(path: &Utf8Path) -> Result<(), StageError> {
    if path.as_std_path().exists() {
        fs::remove_file(path.as_std_path())
            .map_err(|err| StageError::io(format!("remove {path}"), err))?;
    }
    Ok(())
}
