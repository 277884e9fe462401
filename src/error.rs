use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

const ENOSPC: i32 = 28;

#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    #[error("invalid series identifier: {0:?}")]
    InvalidSeriesId(String),

    #[error("invalid case identifier: {0:?}")]
    InvalidCaseId(String),

    #[error("missing config file volstage.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("archive request failed: {0}")]
    ArchiveHttp(String),

    #[error("archive returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("unexpected archive listing: {0}")]
    ArchiveListing(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("raster decode failed for {path}: {message}")]
    Raster { path: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("no space left on device: {context}")]
    #[diagnostic(help("free disk space, then re-run; completed work is resumed"))]
    NoSpace { context: String },

    #[error("integrity check found {0} issue(s)")]
    IntegrityIssues(usize),
}

impl StageError {
    /// Wraps an io error with context, promoting disk exhaustion to `NoSpace`.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        if is_storage_full(&source) {
            return StageError::NoSpace { context };
        }
        StageError::Io { context, source }
    }

    /// Errors after which no further unit of work can make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::NoSpace { .. })
    }
}

pub fn is_storage_full(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::StorageFull || err.raw_os_error() == Some(ENOSPC)
}
