use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use ndarray::{ArrayD, IxDyn};

use volstage::codec::{SeriesRead, VolumeCodec};
use volstage::converter::{SeriesConverter, StagedSeries, discover_series_dirs};
use volstage::domain::{CaseIdResolution, UnitOutcome, Volume};
use volstage::error::StageError;
use volstage::issues::IssueLog;
use volstage::store::DatasetLayout;

/// Patient id is the instance file content; writes are counted.
#[derive(Default)]
struct MockCodec {
    writes: Mutex<usize>,
    fail_with_no_space: bool,
}

impl VolumeCodec for MockCodec {
    fn read_series(&self, _directory: &Utf8Path) -> Result<SeriesRead, StageError> {
        Ok(SeriesRead {
            volume: Volume::native(ArrayD::zeros(IxDyn(&[2, 2, 2])), [0.8, 0.8, 5.0], [0.0; 3]),
            instances: vec![BTreeMap::new()],
        })
    }

    fn read_metadata_tag(&self, file: &Utf8Path, _key: &str) -> Result<String, StageError> {
        fs::read_to_string(file.as_std_path()).map_err(|err| StageError::io(file.as_str(), err))
    }

    fn write_volume(&self, _volume: &Volume, path: &Utf8Path) -> Result<(), StageError> {
        if self.fail_with_no_space {
            return Err(StageError::io(
                path.as_str(),
                std::io::Error::from_raw_os_error(28),
            ));
        }
        *self.writes.lock().unwrap() += 1;
        fs::write(path.as_std_path(), b"volume").map_err(|err| StageError::io(path.as_str(), err))
    }

    fn read_shape(&self, _path: &Utf8Path) -> Result<Vec<usize>, StageError> {
        Ok(vec![2, 2, 2])
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    source: Utf8PathBuf,
    layout: DatasetLayout,
    issues: IssueLog,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let layout = DatasetLayout::new(root.join("Dataset101_KiTS23"), ".nii.gz");
        layout.ensure_dirs().unwrap();
        Self {
            source: root.join("manifest-1"),
            issues: IssueLog::new(root.join("issues.jsonl")),
            layout,
            _temp: temp,
        }
    }

    fn series(&self, relative: &str, patient: &str) -> Utf8PathBuf {
        let dir = self.source.join(relative);
        fs::create_dir_all(dir.as_std_path()).unwrap();
        fs::write(dir.join("1-001.dcm"), patient).unwrap();
        fs::write(dir.join("1-002.DCM"), patient).unwrap();
        dir
    }
}

#[test]
fn local_series_are_discovered_sorted() {
    let fixture = Fixture::new();
    fixture.series("KiTS-2/study/1.3", "KiTS-2");
    fixture.series("KiTS-1/study/1.2", "KiTS-1");
    fs::create_dir_all(fixture.source.join("empty").as_std_path()).unwrap();

    let dirs = discover_series_dirs(&fixture.source).unwrap();

    assert_eq!(dirs.len(), 2);
    assert!(dirs[0].ends_with("KiTS-1/study/1.2"));
}

#[test]
fn second_series_for_same_case_is_rejected() {
    let fixture = Fixture::new();
    let first = fixture.series("KiTS-1/study/1.2", "KiTS-1");
    let second = fixture.series("KiTS-1/study/1.3", "KiTS-1");
    let codec = MockCodec::default();
    let mut converter = SeriesConverter::new(&codec, &fixture.layout, &fixture.issues);

    let a = converter.convert(&StagedSeries::local(first));
    let b = converter.convert(&StagedSeries::local(second));

    assert_eq!(a.report.outcome, UnitOutcome::Success);
    assert_matches!(&b.report.outcome, UnitOutcome::Skipped(reason) if reason.contains("name collision"));
    assert_eq!(*codec.writes.lock().unwrap(), 1);
    assert_eq!(fixture.issues.read_all().unwrap().len(), 1);
}

#[test]
fn unreadable_patient_id_falls_back_to_grandparent_name() {
    let fixture = Fixture::new();
    let dir = fixture.series("case_00042/study/1.9", "");
    let codec = MockCodec::default();
    let mut converter = SeriesConverter::new(&codec, &fixture.layout, &fixture.issues);

    let conversion = converter.convert(&StagedSeries::local(dir));

    assert_matches!(conversion.resolution, Some(CaseIdResolution::Fallback(_)));
    assert_eq!(conversion.report.warnings.len(), 1);
    assert!(
        fixture
            .layout
            .images_dir()
            .join("case_00042_0000.nii.gz")
            .as_std_path()
            .is_file()
    );
}

#[test]
fn acquired_series_without_patient_id_uses_unknown_placeholder() {
    let fixture = Fixture::new();
    let staging = fixture.source.join("staging");
    fixture.series("staging/1.2.840.1", "");
    let codec = MockCodec::default();
    let mut converter = SeriesConverter::new(&codec, &fixture.layout, &fixture.issues);

    let conversion =
        converter.convert(&StagedSeries::acquired(&staging, "1.2.840.1".parse().unwrap()));

    assert_matches!(conversion.resolution, Some(CaseIdResolution::Unknown));
    assert_eq!(conversion.case.unwrap().as_str(), "UNKNOWN_1.2.840.1");
    assert!(conversion.artifact_present);
}

#[test]
fn existing_artifact_is_not_rewritten() {
    let fixture = Fixture::new();
    let dir = fixture.series("KiTS-7/study/1.2", "KiTS-7");
    let existing = fixture.layout.images_dir().join("KiTS-7_0000.nii.gz");
    fs::write(existing.as_std_path(), b"earlier run").unwrap();
    let codec = MockCodec::default();
    let mut converter = SeriesConverter::new(&codec, &fixture.layout, &fixture.issues);

    let conversion = converter.convert(&StagedSeries::local(dir));

    assert_matches!(conversion.report.outcome, UnitOutcome::Skipped(_));
    assert!(conversion.artifact_present);
    assert_eq!(*codec.writes.lock().unwrap(), 0);
    assert_eq!(fs::read(existing.as_std_path()).unwrap(), b"earlier run");
}

#[test]
fn disk_full_during_write_is_fatal() {
    let fixture = Fixture::new();
    let dir = fixture.series("KiTS-8/study/1.2", "KiTS-8");
    let codec = MockCodec {
        fail_with_no_space: true,
        ..MockCodec::default()
    };
    let mut converter = SeriesConverter::new(&codec, &fixture.layout, &fixture.issues);

    let conversion = converter.convert(&StagedSeries::local(dir));

    assert_matches!(conversion.report.outcome, UnitOutcome::Fatal(_));
    assert!(!conversion.artifact_present);
}
