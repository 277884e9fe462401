//! Rebuilds 3D volumes from per-case stacks of 2D raster slices.

use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use ndarray::{Array2, ArrayView2, Axis};
use regex::Regex;
use tracing::info;

use crate::codec::{RasterReader, VolumeCodec};
use crate::domain::{CaseId, RunSummary, UnitOutcome, UnitReport, Volume, VolumeKind};
use crate::error::StageError;
use crate::issues::{IssueClass, IssueLog};
use crate::store::DatasetLayout;

const COMPONENT: &str = "slices";
const SLICE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
pub const DEGRADED_WARNING: &str =
    "spatial metadata degraded: identity affine placeholder (rasters carry no spacing)";

static DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("digit pattern is valid"));

/// Last integer in the file stem; `-1` when there is none.
pub fn slice_index(path: &Utf8Path) -> i64 {
    path.file_stem()
        .and_then(|stem| DIGITS.find_iter(stem).last())
        .and_then(|found| found.as_str().parse().ok())
        .unwrap_or(-1)
}

/// Sorts by slice index, ties broken by file name.
pub fn order_slices(mut paths: Vec<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    paths.sort_by(|a, b| {
        slice_index(a)
            .cmp(&slice_index(b))
            .then_with(|| a.file_name().cmp(&b.file_name()))
    });
    paths
}

/// Raster files directly inside `dir`; an absent directory yields none.
pub fn list_slices(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StageError> {
    if !dir.as_std_path().is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let entries = dir
        .read_dir_utf8()
        .map_err(|err| StageError::io(format!("read {dir}"), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| StageError::io(format!("read {dir}"), err))?;
        let path = entry.path();
        let is_raster = path
            .extension()
            .map(|ext| SLICE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
            .unwrap_or(false);
        if is_raster && path.is_file() {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

#[derive(Debug, Clone)]
pub struct AssembledCase {
    pub image: Volume,
    pub mask: Option<Volume>,
}

pub struct SliceAssembler<'a, R: RasterReader, C: VolumeCodec> {
    raster: &'a R,
    codec: &'a C,
    layout: &'a DatasetLayout,
    issues: &'a IssueLog,
    image_subdir: &'a str,
    mask_subdir: &'a str,
}

impl<'a, R: RasterReader, C: VolumeCodec> SliceAssembler<'a, R, C> {
    pub fn new(
        raster: &'a R,
        codec: &'a C,
        layout: &'a DatasetLayout,
        issues: &'a IssueLog,
        image_subdir: &'a str,
        mask_subdir: &'a str,
    ) -> Self {
        Self {
            raster,
            codec,
            layout,
            issues,
            image_subdir,
            mask_subdir,
        }
    }

    /// Reads and stacks slices into (height, width, depth) volumes.
    /// Counts are compared before any slice is decoded.
    pub fn assemble(
        &self,
        image_files: Vec<Utf8PathBuf>,
        mask_files: Vec<Utf8PathBuf>,
    ) -> Result<AssembledCase, StageError> {
        if !mask_files.is_empty() && mask_files.len() != image_files.len() {
            return Err(StageError::Codec(format!(
                "slice count mismatch: {} image slices vs {} mask slices",
                image_files.len(),
                mask_files.len()
            )));
        }
        let image = self.stack(&order_slices(image_files), VolumeKind::Intensity)?;
        let mask = if mask_files.is_empty() {
            None
        } else {
            Some(self.stack(&order_slices(mask_files), VolumeKind::Label)?)
        };
        Ok(AssembledCase { image, mask })
    }

    fn stack(&self, files: &[Utf8PathBuf], kind: VolumeKind) -> Result<Volume, StageError> {
        let slices = files
            .iter()
            .map(|path| self.raster.read_grayscale(path))
            .collect::<Result<Vec<Array2<u8>>, _>>()?;
        let Some(first) = slices.first() else {
            return Err(StageError::Codec("no slices to stack".to_string()));
        };
        let dim = first.dim();
        if let Some((index, _)) = slices.iter().enumerate().find(|(_, s)| s.dim() != dim) {
            return Err(StageError::Codec(format!(
                "slice {} has dimensions {:?}, expected {:?}",
                files[index],
                slices[index].dim(),
                dim
            )));
        }
        let views: Vec<ArrayView2<'_, u8>> = slices.iter().map(|s| s.view()).collect();
        let stacked = ndarray::stack(Axis(2), &views)
            .map_err(|err| StageError::Codec(err.to_string()))?;
        Ok(Volume::with_identity_placeholder(
            stacked.mapv(f32::from).into_dyn(),
            kind,
        ))
    }

    pub fn run(&self, case_dirs: &[Utf8PathBuf]) -> Result<RunSummary, StageError> {
        self.layout.ensure_dirs()?;
        let mut summary = RunSummary::default();
        for case_dir in case_dirs {
            let report = self.process_case(case_dir);
            let fatal = matches!(report.outcome, UnitOutcome::Fatal(_));
            summary.record(report);
            if fatal {
                break;
            }
        }
        Ok(summary)
    }

    pub fn process_case(&self, case_dir: &Utf8Path) -> UnitReport {
        let unit = case_dir.file_name().unwrap_or(case_dir.as_str()).to_string();
        match self.write_case(case_dir, &unit) {
            Ok(report) => report,
            Err(err) => {
                let (class, outcome) = if err.is_fatal() {
                    (IssueClass::Fatal, UnitOutcome::Fatal(err.to_string()))
                } else {
                    (IssueClass::Skip, UnitOutcome::Skipped(err.to_string()))
                };
                self.issues.note(COMPONENT, &unit, class, &err.to_string());
                UnitReport::new(&unit, outcome)
            }
        }
    }

    fn write_case(&self, case_dir: &Utf8Path, unit: &str) -> Result<UnitReport, StageError> {
        let case: CaseId = unit.parse()?;
        let image_files = list_slices(&case_dir.join(self.image_subdir))?;
        if image_files.is_empty() {
            return Err(StageError::Codec("no image slices".to_string()));
        }
        let mask_files = list_slices(&case_dir.join(self.mask_subdir))?;

        let image_path = self.layout.image_path(&case);
        let label_path = self.layout.label_path(&case);
        let label_done = mask_files.is_empty() || label_path.as_std_path().exists();
        if image_path.as_std_path().exists() && label_done {
            return Ok(UnitReport::new(
                unit,
                UnitOutcome::Skipped(format!("{image_path} already exists")),
            ));
        }

        let assembled = self.assemble(image_files, mask_files)?;
        let mut report = UnitReport::new(unit, UnitOutcome::Success);
        if !image_path.as_std_path().exists() {
            self.codec.write_volume(&assembled.image, &image_path)?;
        }
        report.outputs.push(image_path.to_string());
        if let Some(mask) = &assembled.mask {
            if !label_path.as_std_path().exists() {
                self.codec.write_volume(mask, &label_path)?;
            }
            report.outputs.push(label_path.to_string());
        }

        self.issues
            .note(COMPONENT, unit, IssueClass::Warning, DEGRADED_WARNING);
        report.warnings.push(DEGRADED_WARNING.to_string());
        info!(case = %case, shape = ?assembled.image.shape(), "volume reconstructed from slices");
        Ok(report)
    }
}
