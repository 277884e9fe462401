use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;

use crate::domain::CaseId;
use crate::error::StageError;

pub const IMAGES_DIR: &str = "imagesTr";
pub const LABELS_DIR: &str = "labelsTr";
pub const MANIFEST_FILE: &str = "dataset.json";
const JOURNAL_DIR: &str = ".relocation";
const IMAGE_CHANNEL_SUFFIX: &str = "_0000";

/// Destination dataset layout: `imagesTr/`, `labelsTr/` and `dataset.json`.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: Utf8PathBuf,
    file_ending: String,
}

/// One case in the destination, keyed by case id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseRecord {
    pub case_id: String,
    pub image: Utf8PathBuf,
    pub label: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyAction {
    Copied,
    AlreadyPresent,
}

impl DatasetLayout {
    pub fn new(root: Utf8PathBuf, file_ending: impl Into<String>) -> Self {
        Self {
            root,
            file_ending: file_ending.into(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn file_ending(&self) -> &str {
        &self.file_ending
    }

    pub fn images_dir(&self) -> Utf8PathBuf {
        self.root.join(IMAGES_DIR)
    }

    pub fn labels_dir(&self) -> Utf8PathBuf {
        self.root.join(LABELS_DIR)
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn journal_dir(&self) -> Utf8PathBuf {
        self.root.join(JOURNAL_DIR)
    }

    pub fn image_path(&self, case: &CaseId) -> Utf8PathBuf {
        self.images_dir()
            .join(case.image_file_name(&self.file_ending))
    }

    pub fn label_path(&self, case: &CaseId) -> Utf8PathBuf {
        self.labels_dir()
            .join(case.label_file_name(&self.file_ending))
    }

    pub fn ensure_dirs(&self) -> Result<(), StageError> {
        for dir in [self.images_dir(), self.labels_dir()] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| StageError::io(format!("create {dir}"), err))?;
        }
        Ok(())
    }

    /// Cases whose image artifact is present and non-empty, sorted by id.
    pub fn case_records(&self) -> Result<Vec<CaseRecord>, StageError> {
        let images_dir = self.images_dir();
        if !images_dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let suffix = format!("{IMAGE_CHANNEL_SUFFIX}{}", self.file_ending);
        let mut records = Vec::new();
        let entries = images_dir
            .read_dir_utf8()
            .map_err(|err| StageError::io(format!("read {images_dir}"), err))?;
        for entry in entries {
            let entry = entry.map_err(|err| StageError::io(format!("read {images_dir}"), err))?;
            let Some(case_id) = entry.file_name().strip_suffix(&suffix) else {
                continue;
            };
            let image = entry.path().to_path_buf();
            if !file_has_content(&image) {
                continue;
            }
            let label = self
                .labels_dir()
                .join(format!("{case_id}{}", self.file_ending));
            records.push(CaseRecord {
                case_id: case_id.to_string(),
                image,
                label: file_has_content(&label).then_some(label),
            });
        }
        records.sort_by(|a, b| a.case_id.cmp(&b.case_id));
        Ok(records)
    }
}

pub fn file_has_content(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Copies through a temp file in the destination directory; never replaces an existing file.
pub fn copy_file_no_clobber(source: &Utf8Path, dest: &Utf8Path) -> Result<CopyAction, StageError> {
    if dest.as_std_path().exists() {
        return Ok(CopyAction::AlreadyPresent);
    }
    let parent = dest
        .parent()
        .ok_or_else(|| StageError::Filesystem(format!("invalid destination path {dest}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| StageError::io(format!("create {parent}"), err))?;
    let temp = Builder::new()
        .prefix(".volstage-copy")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| StageError::io(format!("temp file in {parent}"), err))?;
    fs::copy(source.as_std_path(), temp.path())
        .map_err(|err| StageError::io(format!("copy {source} -> {dest}"), err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| StageError::io(format!("sync {dest}"), err))?;
    temp.persist_noclobber(dest.as_std_path())
        .map_err(|err| StageError::io(format!("persist {dest}"), err.error))?;
    Ok(CopyAction::Copied)
}

/// Writes pretty JSON via a sibling temp file and rename, replacing any previous content.
pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), StageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| StageError::io(format!("create {parent}"), err))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| StageError::Filesystem(err.to_string()))?;
    fs::write(tmp_path.as_std_path(), &content)
        .map_err(|err| StageError::io(format!("write {tmp_path}"), err))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| StageError::io(format!("rename {tmp_path}"), err))?;
    Ok(())
}

pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, StageError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| StageError::io(format!("read {}", path.display()), err))?;
        for entry in entries {
            let entry =
                entry.map_err(|err| StageError::io(format!("read {}", path.display()), err))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

/// Directories named `case_*` under `root`; recursive only when the top level has none.
pub fn discover_case_dirs(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StageError> {
    if !root.as_std_path().is_dir() {
        return Err(StageError::Filesystem(format!(
            "source directory does not exist: {root}"
        )));
    }
    let is_case_dir = |path: &Path| {
        path.is_dir()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("case_"))
                .unwrap_or(false)
    };

    let mut top_level = Vec::new();
    let entries = fs::read_dir(root.as_std_path())
        .map_err(|err| StageError::io(format!("read {root}"), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| StageError::io(format!("read {root}"), err))?;
        if is_case_dir(&entry.path()) {
            top_level.push(entry.path());
        }
    }
    let found = if top_level.is_empty() {
        walk_dir(root.as_std_path())?
            .into_iter()
            .filter(|path| is_case_dir(path))
            .collect()
    } else {
        top_level
    };

    let mut dirs = found
        .into_iter()
        .map(|path| {
            Utf8PathBuf::from_path_buf(path)
                .map_err(|path| StageError::Filesystem(format!("non-utf8 path {}", path.display())))
        })
        .collect::<Result<Vec<_>, _>>()?;
    dirs.sort();
    Ok(dirs)
}
