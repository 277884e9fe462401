//! Turns one staged DICOM series into one image artifact.

use std::collections::{BTreeSet, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::codec::{PATIENT_ID_KEY, VolumeCodec, list_instances};
use crate::domain::{CaseId, CaseIdResolution, SeriesId, UnitOutcome, UnitReport};
use crate::error::StageError;
use crate::issues::{IssueClass, IssueLog};
use crate::store::{DatasetLayout, file_has_content, walk_dir};

const COMPONENT: &str = "converter";

/// A directory of raw instances sharing one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSeries {
    pub directory: Utf8PathBuf,
    pub series: Option<SeriesId>,
    /// Directory-derived case name used when the patient id cannot be read.
    pub fallback_name: Option<String>,
}

impl StagedSeries {
    /// A series downloaded into `staging/<series id>/`.
    pub fn acquired(staging_root: &Utf8Path, series: SeriesId) -> Self {
        Self {
            directory: staging_root.join(series.as_str()),
            series: Some(series),
            fallback_name: None,
        }
    }

    /// A series found in a local `<patient>/<study>/<series>/` tree.
    pub fn local(directory: Utf8PathBuf) -> Self {
        let fallback_name = directory
            .parent()
            .and_then(Utf8Path::parent)
            .and_then(Utf8Path::file_name)
            .map(str::to_string);
        Self {
            directory,
            series: None,
            fallback_name,
        }
    }

    fn unit(&self) -> String {
        match &self.series {
            Some(series) => series.to_string(),
            None => self.directory.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeriesConversion {
    pub report: UnitReport,
    pub case: Option<CaseId>,
    pub resolution: Option<CaseIdResolution>,
    /// True when a non-empty artifact for this series exists after the attempt.
    pub artifact_present: bool,
}

pub struct SeriesConverter<'a, C: VolumeCodec> {
    codec: &'a C,
    layout: &'a DatasetLayout,
    issues: &'a IssueLog,
    claimed: HashSet<CaseId>,
}

impl<'a, C: VolumeCodec> SeriesConverter<'a, C> {
    pub fn new(codec: &'a C, layout: &'a DatasetLayout, issues: &'a IssueLog) -> Self {
        Self {
            codec,
            layout,
            issues,
            claimed: HashSet::new(),
        }
    }

    pub fn resolve_case_id(&self, first_instance: &Utf8Path, fallback: Option<&str>) -> CaseIdResolution {
        match self.codec.read_metadata_tag(first_instance, PATIENT_ID_KEY) {
            Ok(value) => match value.parse::<CaseId>() {
                Ok(id) => return CaseIdResolution::Resolved(id),
                Err(err) => debug!(file = %first_instance, "patient id unusable: {err}"),
            },
            Err(err) => debug!(file = %first_instance, "patient id unreadable: {err}"),
        }
        match fallback.map(str::parse::<CaseId>) {
            Some(Ok(id)) => CaseIdResolution::Fallback(id),
            _ => CaseIdResolution::Unknown,
        }
    }

    pub fn convert(&mut self, staged: &StagedSeries) -> SeriesConversion {
        let unit = staged.unit();
        let instances = match list_instances(&staged.directory) {
            Ok(instances) => instances,
            Err(err) => return self.skipped(&unit, None, None, format!("cannot list instances: {err}")),
        };
        let Some(first) = instances.first() else {
            return self.skipped(&unit, None, None, "no instances staged".to_string());
        };

        let resolution = self.resolve_case_id(first, staged.fallback_name.as_deref());
        let case = resolution.case_id().for_series(staged.series.as_ref());
        let mut warnings = Vec::new();
        if let Some(warning) = resolution.warning() {
            self.issues.note(COMPONENT, &unit, IssueClass::Warning, &warning);
            warnings.push(warning);
        }

        if !self.claimed.insert(case.clone()) {
            return self.skipped(
                &unit,
                Some(case.clone()),
                Some(resolution),
                format!("name collision: {case} already claimed by another series in this run"),
            );
        }

        let output = self.layout.image_path(&case);
        if output.as_std_path().exists() {
            debug!(%unit, output = %output, "artifact exists; write skipped");
            let mut report = UnitReport::new(
                &unit,
                UnitOutcome::Skipped(format!("{} already exists", output)),
            );
            report.warnings = warnings;
            return SeriesConversion {
                report,
                artifact_present: file_has_content(&output),
                case: Some(case),
                resolution: Some(resolution),
            };
        }

        let written = self
            .codec
            .read_series(&staged.directory)
            .and_then(|series| self.codec.write_volume(&series.volume, &output));
        if let Err(err) = written {
            let reason = format!("conversion failed: {err}");
            if err.is_fatal() {
                self.issues.note(COMPONENT, &unit, IssueClass::Fatal, &reason);
                let mut report = UnitReport::new(&unit, UnitOutcome::Fatal(reason));
                report.warnings = warnings;
                return SeriesConversion {
                    report,
                    case: Some(case),
                    resolution: Some(resolution),
                    artifact_present: false,
                };
            }
            let mut conversion = self.skipped(&unit, Some(case), Some(resolution), reason);
            conversion.report.warnings = warnings;
            return conversion;
        }

        info!(%unit, output = %output, "series converted");
        let mut report = UnitReport::new(&unit, UnitOutcome::Success);
        report.warnings = warnings;
        report.outputs.push(output.to_string());
        SeriesConversion {
            report,
            artifact_present: file_has_content(&output),
            case: Some(case),
            resolution: Some(resolution),
        }
    }

    fn skipped(
        &self,
        unit: &str,
        case: Option<CaseId>,
        resolution: Option<CaseIdResolution>,
        reason: String,
    ) -> SeriesConversion {
        self.issues.note(COMPONENT, unit, IssueClass::Skip, &reason);
        SeriesConversion {
            report: UnitReport::new(unit, UnitOutcome::Skipped(reason)),
            case,
            resolution,
            artifact_present: false,
        }
    }
}

/// Directories under `root` that directly contain `.dcm` instances, sorted.
pub fn discover_series_dirs(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StageError> {
    if !root.as_std_path().is_dir() {
        return Err(StageError::Filesystem(format!(
            "source directory does not exist: {root}"
        )));
    }
    let mut dirs = BTreeSet::new();
    for path in walk_dir(root.as_std_path())? {
        let is_instance = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("dcm"))
            .unwrap_or(false);
        if is_instance && path.is_file() {
            if let Some(parent) = path.parent() {
                let parent = Utf8PathBuf::from_path_buf(parent.to_path_buf()).map_err(|path| {
                    StageError::Filesystem(format!("non-utf8 path {}", path.display()))
                })?;
                dirs.insert(parent);
            }
        }
    }
    Ok(dirs.into_iter().collect())
}
