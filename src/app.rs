use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{error, info};

use crate::archive::ArchiveClient;
use crate::batcher::AcquisitionBatcher;
use crate::codec::{RasterReader, VolumeCodec};
use crate::config::PipelineConfig;
use crate::converter::{SeriesConverter, StagedSeries, discover_series_dirs};
use crate::domain::{RunSummary, UnitOutcome};
use crate::error::StageError;
use crate::issues::{IssueClass, IssueLog};
use crate::ledger::Ledger;
use crate::manifest::{DatasetManifest, ManifestWriter};
use crate::relocate::{RelocationMode, SafeRelocator};
use crate::slices::SliceAssembler;
use crate::store::{DatasetLayout, discover_case_dirs};
use crate::verify::{IntegrityReport, IntegrityVerifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Acquire,
    Convert,
    Relocate,
    Organize,
    Reconstruct,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionCounts {
    pub listed: usize,
    pub already_complete: usize,
    pub pending: usize,
    pub chunks: usize,
    pub committed: usize,
}

/// Outcome of one pipeline command, printed as the final summary.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub operation: Operation,
    pub destination: Utf8PathBuf,
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquisition: Option<AcquisitionCounts>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stranded: Vec<String>,
    pub manifest: Option<DatasetManifest>,
    pub issue_log: Utf8PathBuf,
    pub elapsed_ms: u128,
}

impl PipelineResult {
    pub fn is_aborted(&self) -> bool {
        self.summary.is_aborted()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Wires configuration, destination layout and the external collaborators
/// together; each method is one CLI command.
pub struct App<A: ArchiveClient, C: VolumeCodec, R: RasterReader> {
    config: PipelineConfig,
    layout: DatasetLayout,
    issues: IssueLog,
    archive: A,
    codec: C,
    raster: R,
}

impl<A: ArchiveClient, C: VolumeCodec, R: RasterReader> App<A, C, R> {
    pub fn new(config: PipelineConfig, archive: A, codec: C, raster: R) -> Self {
        let layout = DatasetLayout::new(config.destination_path.clone(), config.file_ending.clone());
        let issues = IssueLog::new(config.issue_log_path.clone());
        Self {
            config,
            layout,
            issues,
            archive,
            codec,
            raster,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    pub fn issues(&self) -> &IssueLog {
        &self.issues
    }

    /// Remote path: list, diff against the ledger, then batch through staging.
    pub fn acquire(&self, sink: &dyn ProgressSink) -> Result<PipelineResult, StageError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; listing {} {} series",
                self.config.collection, self.config.modality
            ),
            elapsed: None,
        });
        let mut ledger = Ledger::open(&self.config.ledger_path)?;
        let batcher = AcquisitionBatcher::new(
            &self.archive,
            &self.codec,
            &self.config,
            &self.layout,
            &self.issues,
        );
        let report = batcher.run(&mut ledger, sink)?;
        let acquisition = AcquisitionCounts {
            listed: report.listed,
            already_complete: report.already_complete,
            pending: report.pending,
            chunks: report.chunks,
            committed: report.committed,
        };
        let mut result = self.finish(Operation::Acquire, report.summary, started, sink);
        result.acquisition = Some(acquisition);
        Ok(result)
    }

    /// Local path: convert every series directory found under the source root.
    pub fn convert_local(&self, sink: &dyn ProgressSink) -> Result<PipelineResult, StageError> {
        let started = Instant::now();
        let series_dirs = discover_series_dirs(&self.config.source_path)?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} series directories", series_dirs.len()),
            elapsed: Some(started.elapsed()),
        });
        self.layout.ensure_dirs()?;

        let mut converter = SeriesConverter::new(&self.codec, &self.layout, &self.issues);
        let mut summary = RunSummary::default();
        for dir in series_dirs {
            sink.event(ProgressEvent {
                message: format!("phase=Convert; {dir}"),
                elapsed: Some(started.elapsed()),
            });
            let conversion = converter.convert(&StagedSeries::local(dir));
            let fatal = matches!(conversion.report.outcome, UnitOutcome::Fatal(_));
            summary.record(conversion.report);
            if fatal {
                error!("aborting local conversion");
                break;
            }
        }
        Ok(self.finish(Operation::Convert, summary, started, sink))
    }

    /// Moves (`Move`) or copies (`Copy`) local case folders into the layout.
    pub fn relocate(
        &self,
        mode: RelocationMode,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineResult, StageError> {
        let started = Instant::now();
        let case_dirs = discover_case_dirs(&self.config.source_path)?;
        sink.event(ProgressEvent {
            message: format!("phase=Relocate; {} case folders ({mode:?})", case_dirs.len()),
            elapsed: Some(started.elapsed()),
        });
        let relocator = SafeRelocator::new(&self.layout, &self.issues, mode);
        let report = relocator.run(&case_dirs)?;
        let operation = match mode {
            RelocationMode::Move => Operation::Relocate,
            RelocationMode::Copy => Operation::Organize,
        };
        let mut result = self.finish(operation, report.summary, started, sink);
        result.stranded = report.stranded;
        Ok(result)
    }

    /// Rebuilds volumes from per-case raster slice folders.
    pub fn reconstruct(&self, sink: &dyn ProgressSink) -> Result<PipelineResult, StageError> {
        let started = Instant::now();
        let case_dirs: Vec<_> = discover_case_dirs(&self.config.source_path)?
            .into_iter()
            .filter(|dir| dir.join(&self.config.image_subdir).as_std_path().is_dir())
            .collect();
        sink.event(ProgressEvent {
            message: format!("phase=Assemble; {} case folders", case_dirs.len()),
            elapsed: Some(started.elapsed()),
        });
        let assembler = SliceAssembler::new(
            &self.raster,
            &self.codec,
            &self.layout,
            &self.issues,
            &self.config.image_subdir,
            &self.config.mask_subdir,
        );
        let summary = assembler.run(&case_dirs)?;
        Ok(self.finish(Operation::Reconstruct, summary, started, sink))
    }

    /// Read-only integrity scan of everything under the destination.
    pub fn verify(&self, sink: &dyn ProgressSink) -> Result<IntegrityReport, StageError> {
        let started = Instant::now();
        let verifier = IntegrityVerifier::new(&self.codec, &self.config.file_ending);
        let report = verifier.verify_tree(self.layout.root())?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Verify; {} files checked, {} issues",
                report.checked,
                report.issue_count()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }

    /// Rewrites `dataset.json` from the records currently on disk.
    pub fn write_manifest(&self, sink: &dyn ProgressSink) -> Result<DatasetManifest, StageError> {
        let manifest = ManifestWriter::new(&self.layout, &self.config.dataset).write()?;
        sink.event(ProgressEvent {
            message: format!("phase=Manifest; {} training cases", manifest.num_training),
            elapsed: None,
        });
        Ok(manifest)
    }

    fn finish(
        &self,
        operation: Operation,
        summary: RunSummary,
        started: Instant,
        sink: &dyn ProgressSink,
    ) -> PipelineResult {
        let writer = ManifestWriter::new(&self.layout, &self.config.dataset);
        let manifest = match writer.write_if_processed(summary.processed) {
            Ok(manifest) => manifest,
            Err(err) => {
                self.issues.note(
                    "manifest",
                    self.layout.manifest_path().as_str(),
                    IssueClass::Fatal,
                    &format!("manifest not written: {err}"),
                );
                None
            }
        };
        let elapsed = started.elapsed();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; processed={} skipped={}",
                summary.processed, summary.skipped
            ),
            elapsed: Some(elapsed),
        });
        info!(
            ?operation,
            processed = summary.processed,
            skipped = summary.skipped,
            aborted = summary.is_aborted(),
            "run finished"
        );
        PipelineResult {
            operation,
            destination: self.layout.root().to_path_buf(),
            summary,
            acquisition: None,
            stranded: Vec::new(),
            manifest,
            issue_log: self.issues.path().to_path_buf(),
            elapsed_ms: elapsed.as_millis(),
        }
    }
}
