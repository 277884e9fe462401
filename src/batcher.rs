use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::archive::ArchiveClient;
use crate::codec::VolumeCodec;
use crate::config::PipelineConfig;
use crate::converter::{SeriesConverter, StagedSeries};
use crate::domain::{RunSummary, SeriesId, UnitOutcome, UnitReport};
use crate::error::StageError;
use crate::issues::{IssueClass, IssueLog};
use crate::ledger::Ledger;
use crate::reclaim::StagingReclaimer;
use crate::store::DatasetLayout;

const COMPONENT: &str = "batcher";

#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionReport {
    pub listed: usize,
    pub already_complete: usize,
    pub pending: usize,
    pub chunks: usize,
    pub committed: usize,
    pub summary: RunSummary,
}

/// Lists remote series, skips ledger-complete ones and processes the rest in chunks.
///
/// Per chunk: download into staging, convert each series, reclaim staging,
/// then append the converted identifiers to the ledger. A failed download
/// skips the chunk; a fatal conversion error aborts before the commit.
pub struct AcquisitionBatcher<'a, A: ArchiveClient, C: VolumeCodec> {
    archive: &'a A,
    codec: &'a C,
    config: &'a PipelineConfig,
    layout: &'a DatasetLayout,
    issues: &'a IssueLog,
    reclaimer: StagingReclaimer,
}

impl<'a, A: ArchiveClient, C: VolumeCodec> AcquisitionBatcher<'a, A, C> {
    pub fn new(
        archive: &'a A,
        codec: &'a C,
        config: &'a PipelineConfig,
        layout: &'a DatasetLayout,
        issues: &'a IssueLog,
    ) -> Self {
        Self {
            archive,
            codec,
            config,
            layout,
            issues,
            reclaimer: StagingReclaimer,
        }
    }

    pub fn run(
        &self,
        ledger: &mut Ledger,
        sink: &dyn ProgressSink,
    ) -> Result<AcquisitionReport, StageError> {
        let all = self
            .archive
            .list_series(&self.config.collection, &self.config.modality)?;
        let pending = ledger.pending(&all);
        let mut report = AcquisitionReport {
            listed: all.len(),
            already_complete: all.iter().filter(|id| ledger.is_complete(id)).count(),
            pending: pending.len(),
            ..AcquisitionReport::default()
        };
        info!(
            collection = %self.config.collection,
            listed = report.listed,
            pending = report.pending,
            "series listing resolved"
        );
        if pending.is_empty() {
            return Ok(report);
        }

        self.layout.ensure_dirs()?;
        let staging = &self.config.staging_path;
        fs::create_dir_all(staging.as_std_path())
            .map_err(|err| StageError::io(format!("create {staging}"), err))?;
        // Leftovers belong to a batch that never committed.
        self.reclaimer.reclaim(staging)?;

        let mut converter = SeriesConverter::new(self.codec, self.layout, self.issues);
        let chunks: Vec<&[SeriesId]> = pending.chunks(self.config.batch_size).collect();
        report.chunks = chunks.len();

        for (index, chunk) in chunks.iter().enumerate() {
            let unit = format!("chunk {}/{}", index + 1, report.chunks);
            sink.event(ProgressEvent {
                message: format!("phase=Download; {unit} ({} series)", chunk.len()),
                elapsed: None,
            });

            if let Err(err) = self.archive.download(chunk, staging) {
                let reason = format!("download failed: {err}");
                let fatal = err.is_fatal();
                let class = if fatal { IssueClass::Fatal } else { IssueClass::Skip };
                self.issues.note(COMPONENT, &unit, class, &reason);
                for id in chunk.iter() {
                    self.issues
                        .note(COMPONENT, id.as_str(), IssueClass::Skip, "download failed");
                }
                let outcome = if fatal {
                    UnitOutcome::Fatal(reason)
                } else {
                    UnitOutcome::Skipped(reason)
                };
                report.summary.record(UnitReport::new(&unit, outcome));
                if !self.reclaim_staging(staging, &unit, &mut report) || fatal {
                    break;
                }
                continue;
            }

            sink.event(ProgressEvent {
                message: format!("phase=Convert; {unit}"),
                elapsed: None,
            });
            let mut converted = Vec::new();
            let mut aborted = false;
            for id in chunk.iter() {
                let conversion = converter.convert(&StagedSeries::acquired(staging, id.clone()));
                if conversion.artifact_present {
                    converted.push(id.clone());
                }
                aborted = matches!(conversion.report.outcome, UnitOutcome::Fatal(_));
                report.summary.record(conversion.report);
                if aborted {
                    break;
                }
            }

            sink.event(ProgressEvent {
                message: format!("phase=Reclaim; {unit}"),
                elapsed: None,
            });
            if !self.reclaim_staging(staging, &unit, &mut report) {
                break;
            }
            if aborted {
                error!(%unit, "aborting: batch left uncommitted");
                break;
            }

            let written = ledger.append(&converted)?;
            report.committed += written;
            info!(%unit, committed = written, "batch committed");
        }

        Ok(report)
    }

    /// Reclaim failure stops the run: the next batch would mix with stale files.
    fn reclaim_staging(
        &self,
        staging: &Utf8Path,
        unit: &str,
        report: &mut AcquisitionReport,
    ) -> bool {
        let Err(err) = self.reclaimer.reclaim(staging) else {
            return true;
        };
        let reason = format!("staging reclaim failed: {err}");
        warn!(%unit, "{reason}");
        self.issues.note(COMPONENT, unit, IssueClass::Fatal, &reason);
        report
            .summary
            .record(UnitReport::new(unit, UnitOutcome::Fatal(reason)));
        false
    }
}
