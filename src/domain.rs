use std::fmt;
use std::str::FromStr;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// Opaque key of one acquirable remote series (a DICOM SeriesInstanceUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesId(String);

impl SeriesId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SeriesId {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        // One identifier per ledger line; separators would corrupt the file.
        let is_valid = !trimmed.is_empty()
            && !trimmed
                .chars()
                .any(|ch| ch.is_control() || ch == '/' || ch == '\\');
        if !is_valid {
            return Err(StageError::InvalidSeriesId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Subject identifier used to name destination artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaseId(String);

impl CaseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Image artifact name: `<case>_0000<ext>`.
    pub fn image_file_name(&self, file_ending: &str) -> String {
        format!("{}_0000{file_ending}", self.0)
    }

    /// Label artifact name: `<case><ext>`.
    pub fn label_file_name(&self, file_ending: &str) -> String {
        format!("{}{file_ending}", self.0)
    }

    /// Case key for one series: `<case>_<series>` when the series is known.
    pub fn for_series(&self, series: Option<&SeriesId>) -> CaseId {
        match series {
            Some(series) => CaseId(sanitize(&format!("{}_{}", self.0, series.as_str()))),
            None => self.clone(),
        }
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseId {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let cleaned = sanitize(value.trim());
        if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '_' || ch == '.') {
            return Err(StageError::InvalidCaseId(value.to_string()));
        }
        Ok(Self(cleaned))
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// How a case identifier was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "case", rename_all = "lowercase")]
pub enum CaseIdResolution {
    /// Read from the embedded patient identifier of the first instance.
    Resolved(CaseId),
    /// Derived from the directory layout; collisions are possible.
    Fallback(CaseId),
    /// Nothing usable; the placeholder `UNKNOWN` is used.
    Unknown,
}

impl CaseIdResolution {
    pub const UNKNOWN_CASE: &'static str = "UNKNOWN";

    pub fn case_id(&self) -> CaseId {
        match self {
            CaseIdResolution::Resolved(id) | CaseIdResolution::Fallback(id) => id.clone(),
            CaseIdResolution::Unknown => CaseId(Self::UNKNOWN_CASE.to_string()),
        }
    }

    pub fn warning(&self) -> Option<String> {
        match self {
            CaseIdResolution::Resolved(_) => None,
            CaseIdResolution::Fallback(id) => Some(format!(
                "case id {id} derived from directory name; patient id unreadable"
            )),
            CaseIdResolution::Unknown => Some(format!(
                "case id unresolved; using placeholder {}",
                Self::UNKNOWN_CASE
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum UnitOutcome {
    Success,
    Skipped(String),
    Fatal(String),
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Success)
    }
}

/// Result of one unit of work (a chunk, a series, a case).
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub outcome: UnitOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

impl UnitReport {
    pub fn new(unit: impl Into<String>, outcome: UnitOutcome) -> Self {
        Self {
            unit: unit.into(),
            outcome,
            warnings: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// Aggregated outcome of one run over many units.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub fatal: Option<String>,
    pub units: Vec<UnitReport>,
}

impl RunSummary {
    pub fn record(&mut self, report: UnitReport) {
        match &report.outcome {
            UnitOutcome::Success => self.processed += 1,
            UnitOutcome::Skipped(_) => self.skipped += 1,
            UnitOutcome::Fatal(reason) => self.fatal = Some(reason.clone()),
        }
        self.units.push(report);
    }

    pub fn is_aborted(&self) -> bool {
        self.fatal.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialMetadata {
    /// Spacing and orientation come from the source acquisition.
    Native,
    /// Rasters carry no geometry; an identity affine stands in.
    IdentityPlaceholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    Intensity,
    Label,
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub data: ArrayD<f32>,
    pub affine: [[f64; 4]; 4],
    pub spacing: [f64; 3],
    pub spatial: SpatialMetadata,
    pub kind: VolumeKind,
}

pub const IDENTITY_AFFINE: [[f64; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

impl Volume {
    pub fn native(data: ArrayD<f32>, spacing: [f64; 3], origin: [f64; 3]) -> Self {
        let mut affine = IDENTITY_AFFINE;
        for axis in 0..3 {
            affine[axis][axis] = spacing[axis];
            affine[axis][3] = origin[axis];
        }
        Self {
            data,
            affine,
            spacing,
            spatial: SpatialMetadata::Native,
            kind: VolumeKind::Intensity,
        }
    }

    pub fn with_identity_placeholder(data: ArrayD<f32>, kind: VolumeKind) -> Self {
        Self {
            data,
            affine: IDENTITY_AFFINE,
            spacing: [1.0, 1.0, 1.0],
            spatial: SpatialMetadata::IdentityPlaceholder,
            kind,
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn is_degraded(&self) -> bool {
        self.spatial == SpatialMetadata::IdentityPlaceholder
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn series_id_rejects_separators() {
        assert!("1.3.6.1.4.1.14519".parse::<SeriesId>().is_ok());
        let err = "a\nb".parse::<SeriesId>().unwrap_err();
        assert_matches!(err, StageError::InvalidSeriesId(_));
        assert!("  ".parse::<SeriesId>().is_err());
    }

    #[test]
    fn case_id_is_sanitized() {
        let id: CaseId = "TCGA B0/5083".parse().unwrap();
        assert_eq!(id.as_str(), "TCGA_B0_5083");
        assert_eq!(id.image_file_name(".nii.gz"), "TCGA_B0_5083_0000.nii.gz");
        assert_eq!(id.label_file_name(".nii.gz"), "TCGA_B0_5083.nii.gz");
    }

    #[test]
    fn case_key_includes_series() {
        let id: CaseId = "TCGA-B0-5083".parse().unwrap();
        let series: SeriesId = "1.2.3".parse().unwrap();
        assert_eq!(id.for_series(Some(&series)).as_str(), "TCGA-B0-5083_1.2.3");
        assert_eq!(id.for_series(None), id);
    }

    #[test]
    fn unknown_resolution_uses_placeholder() {
        let resolution = CaseIdResolution::Unknown;
        assert_eq!(resolution.case_id().as_str(), "UNKNOWN");
        assert!(resolution.warning().is_some());
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = RunSummary::default();
        summary.record(UnitReport::new("a", UnitOutcome::Success));
        summary.record(UnitReport::new("b", UnitOutcome::Skipped("x".into())));
        assert_eq!((summary.processed, summary.skipped), (1, 1));
        assert!(!summary.is_aborted());
        summary.record(UnitReport::new("c", UnitOutcome::Fatal("disk".into())));
        assert!(summary.is_aborted());
    }
}
