use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use volstage::domain::UnitOutcome;
use volstage::issues::IssueLog;
use volstage::relocate::{CaseJournal, RelocationMode, RelocationState, SafeRelocator};
use volstage::store::{DatasetLayout, write_json_atomic};

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
        let source = root.join("kits23").join("dataset");
        fs::create_dir_all(source.as_std_path()).unwrap();
        Self {
            layout: DatasetLayout::new(root.join("Dataset101_KiTS23"), ".nii.gz"),
            issues: IssueLog::new(root.join("issues.jsonl")),
            source,
            _temp: temp,
        }
    }

    fn case(&self, name: &str, files: &[&str]) -> Utf8PathBuf {
        let dir = self.source.join(name);
        fs::create_dir_all(dir.as_std_path()).unwrap();
        for file in files {
            fs::write(dir.join(file), format!("{name}/{file}")).unwrap();
        }
        dir
    }
}

#[test]
fn complete_case_moves_as_one_record_and_empties_source() {
    let fixture = Fixture::new();
    let case_dir = fixture.case("case_00000", &["imaging.nii.gz", "segmentation.nii.gz"]);
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Move);

    let report = relocator.run(&[case_dir.clone()]).unwrap();

    assert_eq!(report.summary.processed, 1);
    assert!(!case_dir.as_std_path().exists());
    let records = fixture.layout.case_records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].case_id, "case_00000");
    assert_eq!(
        fs::read_to_string(records[0].label.as_ref().unwrap().as_std_path()).unwrap(),
        "case_00000/segmentation.nii.gz"
    );
    assert!(report.stranded.is_empty());
}

#[test]
fn missing_label_leaves_source_untouched() {
    let fixture = Fixture::new();
    let broken = fixture.case("case_00001", &["imaging.nii.gz"]);
    let good = fixture.case("case_00002", &["imaging.nii.gz", "segmentation.nii.gz"]);
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Move);

    let report = relocator.run(&[broken.clone(), good]).unwrap();

    assert_eq!(report.summary.processed, 1);
    assert_eq!(report.summary.skipped, 1);
    assert_matches!(&report.summary.units[0].outcome, UnitOutcome::Skipped(reason) if reason.contains("segmentation"));
    assert!(broken.join("imaging.nii.gz").as_std_path().is_file());
    assert!(
        !fixture
            .layout
            .images_dir()
            .join("case_00001_0000.nii.gz")
            .as_std_path()
            .exists()
    );
    assert_eq!(fixture.issues.read_all().unwrap().len(), 1);
}

#[test]
fn resumes_a_case_interrupted_after_deleting_the_image() {
    let fixture = Fixture::new();
    let case_dir = fixture.case("case_00003", &["segmentation.nii.gz"]);
    fixture.layout.ensure_dirs().unwrap();
    let dest_image = fixture.layout.images_dir().join("case_00003_0000.nii.gz");
    fs::write(dest_image.as_std_path(), "case_00003/imaging.nii.gz").unwrap();
    let journal = CaseJournal {
        case_id: "case_00003".to_string(),
        state: RelocationState::SourceImageDeleted,
        source_dir: case_dir.to_string(),
        image_source: Some(case_dir.join("imaging.nii.gz").to_string()),
        label_source: Some(case_dir.join("segmentation.nii.gz").to_string()),
        updated_at: "2026-01-01T00:00:00Z".to_string(),
    };
    write_json_atomic(
        &fixture.layout.journal_dir().join("case_00003.json"),
        &journal,
    )
    .unwrap();
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Move);

    let report = relocator.run(&[case_dir.clone()]).unwrap();

    assert_eq!(report.summary.processed, 1);
    assert!(!case_dir.as_std_path().exists());
    let records = fixture.layout.case_records().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].label.is_some());
}

#[test]
fn organize_copies_and_keeps_sources() {
    let fixture = Fixture::new();
    let case_dir = fixture.case("case_00004", &["imaging.nii.gz", "segmentation.nii.gz"]);
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Copy);

    let report = relocator.run(&[case_dir.clone()]).unwrap();

    assert_eq!(report.summary.processed, 1);
    assert!(case_dir.join("imaging.nii.gz").as_std_path().is_file());
    assert!(case_dir.join("segmentation.nii.gz").as_std_path().is_file());
    assert_eq!(fixture.layout.case_records().unwrap().len(), 1);
    assert!(!fixture.layout.journal_dir().as_std_path().exists());
}

#[test]
fn alternate_file_names_are_found_by_prefix() {
    let fixture = Fixture::new();
    let case_dir = fixture.case("case_00005", &["imaging_v2.nii.gz", "segmentation_final.nii.gz"]);
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Copy);

    let report = relocator.run(&[case_dir]).unwrap();

    assert_eq!(report.summary.processed, 1);
    let records = fixture.layout.case_records().unwrap();
    assert_eq!(records[0].case_id, "case_00005");
}

#[test]
fn half_migrated_case_with_missing_source_is_stranded() {
    let fixture = Fixture::new();
    let vanished = fixture.source.join("case_00006");
    let journal = CaseJournal {
        case_id: "case_00006".to_string(),
        state: RelocationState::ImageVerified,
        source_dir: vanished.to_string(),
        image_source: None,
        label_source: None,
        updated_at: "2026-01-01T00:00:00Z".to_string(),
    };
    fixture.layout.ensure_dirs().unwrap();
    write_json_atomic(
        &fixture.layout.journal_dir().join("case_00006.json"),
        &journal,
    )
    .unwrap();
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Move);

    let report = relocator.run(&[]).unwrap();

    assert_eq!(report.stranded, vec!["case_00006".to_string()]);
}

#[test]
fn empty_segmentation_leaves_case_in_place_until_repaired() {
    let fixture = Fixture::new();
    let case_dir = fixture.case("case_00007", &["imaging.nii.gz"]);
    fs::write(case_dir.join("segmentation.nii.gz"), b"").unwrap();
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Move);

    let report = relocator.run(&[case_dir.clone()]).unwrap();

    assert_eq!(report.summary.skipped, 1);
    assert_matches!(&report.summary.units[0].outcome, UnitOutcome::Skipped(reason) if reason.contains("empty segmentation"));
    assert!(case_dir.join("imaging.nii.gz").as_std_path().is_file());
    assert!(fixture.layout.case_records().unwrap().is_empty());
    let dest_image = fixture.layout.images_dir().join("case_00007_0000.nii.gz");
    assert!(!dest_image.as_std_path().exists());

    fs::write(case_dir.join("segmentation.nii.gz"), "case_00007/segmentation.nii.gz").unwrap();
    let rerun = relocator.run(&[case_dir.clone()]).unwrap();

    assert_eq!(rerun.summary.processed, 1);
    assert!(!case_dir.as_std_path().exists());
    assert_eq!(fixture.layout.case_records().unwrap().len(), 1);
}

#[test]
fn empty_image_never_lands_as_zero_byte_destination() {
    let fixture = Fixture::new();
    let case_dir = fixture.case("case_00008", &["segmentation.nii.gz"]);
    fs::write(case_dir.join("imaging.nii.gz"), b"").unwrap();
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Copy);

    let report = relocator.run(&[case_dir.clone()]).unwrap();

    assert_eq!(report.summary.skipped, 1);
    let dest_image = fixture.layout.images_dir().join("case_00008_0000.nii.gz");
    assert!(!dest_image.as_std_path().exists());

    fs::write(case_dir.join("imaging.nii.gz"), "case_00008/imaging.nii.gz").unwrap();
    let rerun = relocator.run(&[case_dir]).unwrap();

    assert_eq!(rerun.summary.processed, 1);
    assert_eq!(
        fs::read_to_string(dest_image.as_std_path()).unwrap(),
        "case_00008/imaging.nii.gz"
    );
}

#[test]
fn empty_label_destination_is_recopied_on_resume() {
    let fixture = Fixture::new();
    let case_dir = fixture.case("case_00009", &["segmentation.nii.gz"]);
    fixture.layout.ensure_dirs().unwrap();
    let dest_image = fixture.layout.images_dir().join("case_00009_0000.nii.gz");
    let dest_label = fixture.layout.labels_dir().join("case_00009.nii.gz");
    fs::write(dest_image.as_std_path(), "case_00009/imaging.nii.gz").unwrap();
    fs::write(dest_label.as_std_path(), b"").unwrap();
    let journal = CaseJournal {
        case_id: "case_00009".to_string(),
        state: RelocationState::LabelCopied,
        source_dir: case_dir.to_string(),
        image_source: Some(case_dir.join("imaging.nii.gz").to_string()),
        label_source: Some(case_dir.join("segmentation.nii.gz").to_string()),
        updated_at: "2026-01-01T00:00:00Z".to_string(),
    };
    let journal_path = fixture.layout.journal_dir().join("case_00009.json");
    write_json_atomic(&journal_path, &journal).unwrap();
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Move);

    let first = relocator.run(&[case_dir.clone()]).unwrap();

    assert_eq!(first.summary.skipped, 1);
    assert!(!dest_label.as_std_path().exists());
    assert!(case_dir.join("segmentation.nii.gz").as_std_path().is_file());
    let rewound: CaseJournal =
        serde_json::from_str(&fs::read_to_string(journal_path.as_std_path()).unwrap()).unwrap();
    assert_eq!(rewound.state, RelocationState::SourceImageDeleted);

    let second = relocator.run(&[case_dir.clone()]).unwrap();

    assert_eq!(second.summary.processed, 1);
    assert_eq!(
        fs::read_to_string(dest_label.as_std_path()).unwrap(),
        "case_00009/segmentation.nii.gz"
    );
    assert!(!case_dir.as_std_path().exists());
}

#[cfg(target_os = "linux")]
#[test]
fn disk_full_aborts_before_later_cases() {
    let full = std::path::Path::new("/dev/full");
    if !full.exists() {
        return;
    }
    let fixture = Fixture::new();
    let first = fixture.case("case_00010", &["imaging.nii.gz", "segmentation.nii.gz"]);
    let second = fixture.case("case_00011", &["imaging.nii.gz", "segmentation.nii.gz"]);
    let journal_dir = fixture.layout.journal_dir();
    fs::create_dir_all(journal_dir.as_std_path()).unwrap();
    // Journal writes for the first case hit a full device.
    std::os::unix::fs::symlink(full, journal_dir.join("case_00010.json.tmp")).unwrap();
    let relocator = SafeRelocator::new(&fixture.layout, &fixture.issues, RelocationMode::Move);

    let report = relocator.run(&[first.clone(), second.clone()]).unwrap();

    assert!(report.summary.is_aborted());
    assert_eq!(report.summary.units.len(), 1);
    assert_matches!(report.summary.units[0].outcome, UnitOutcome::Fatal(_));
    assert!(first.join("imaging.nii.gz").as_std_path().is_file());
    for file in ["imaging.nii.gz", "segmentation.nii.gz"] {
        assert!(second.join(file).as_std_path().is_file());
    }
    assert!(
        !fixture
            .layout
            .images_dir()
            .join("case_00011_0000.nii.gz")
            .as_std_path()
            .exists()
    );
}
