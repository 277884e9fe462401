use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::codec::VolumeCodec;
use crate::error::StageError;
use crate::store::walk_dir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    OpenFailure { message: String },
    Dimensionality { shape: Vec<usize> },
    ZeroDimension { shape: Vec<usize> },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::OpenFailure { message } => write!(f, "cannot open: {message}"),
            IntegrityIssue::Dimensionality { shape } => {
                write!(f, "expected 3 dimensions, found {} {:?}", shape.len(), shape)
            }
            IntegrityIssue::ZeroDimension { shape } => write!(f, "zero-length axis in {shape:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileIntegrity {
    pub path: Utf8PathBuf,
    pub shape: Option<Vec<usize>>,
    pub issue: Option<IntegrityIssue>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub files: Vec<FileIntegrity>,
}

impl IntegrityReport {
    pub fn issues(&self) -> impl Iterator<Item = &FileIntegrity> {
        self.files.iter().filter(|file| file.issue.is_some())
    }

    pub fn issue_count(&self) -> usize {
        self.issues().count()
    }

    pub fn is_clean(&self) -> bool {
        self.issue_count() == 0
    }
}

/// Read-only scan of produced artifacts: every file must open as a
/// 3-dimensional volume with no zero-length axis.
pub struct IntegrityVerifier<'a, C: VolumeCodec> {
    codec: &'a C,
    file_ending: &'a str,
}

impl<'a, C: VolumeCodec> IntegrityVerifier<'a, C> {
    pub fn new(codec: &'a C, file_ending: &'a str) -> Self {
        Self { codec, file_ending }
    }

    pub fn check_file(&self, path: &Utf8Path) -> FileIntegrity {
        let (shape, issue) = match self.codec.read_shape(path) {
            Err(err) => (
                None,
                Some(IntegrityIssue::OpenFailure {
                    message: err.to_string(),
                }),
            ),
            Ok(shape) if shape.len() != 3 => (
                Some(shape.clone()),
                Some(IntegrityIssue::Dimensionality { shape }),
            ),
            Ok(shape) if shape.contains(&0) => (
                Some(shape.clone()),
                Some(IntegrityIssue::ZeroDimension { shape }),
            ),
            Ok(shape) => (Some(shape), None),
        };
        if let Some(issue) = &issue {
            warn!(file = %path, "integrity issue: {issue}");
        }
        FileIntegrity {
            path: path.to_path_buf(),
            shape,
            issue,
        }
    }

    /// Checks every file under `root` ending in the configured extension.
    pub fn verify_tree(&self, root: &Utf8Path) -> Result<IntegrityReport, StageError> {
        let mut report = IntegrityReport::default();
        if !root.as_std_path().is_dir() {
            return Ok(report);
        }
        for path in walk_dir(root.as_std_path())? {
            let Some(path) = Utf8Path::from_path(&path) else {
                continue;
            };
            if !path.is_file() || !path.as_str().ends_with(self.file_ending) {
                continue;
            }
            report.files.push(self.check_file(path));
        }
        report.checked = report.files.len();
        info!(
            root = %root,
            checked = report.checked,
            issues = report.issue_count(),
            "integrity scan finished"
        );
        Ok(report)
    }
}
