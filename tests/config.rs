use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use volstage::config::{ConfigFile, ConfigLoader, ConfigOverrides, DEFAULT_BATCH_SIZE};
use volstage::error::StageError;

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

#[test]
fn config_file_values_are_read() {
    let (_temp, root) = temp_root();
    let path = root.join("volstage.json");
    fs::write(
        path.as_std_path(),
        r#"{
            "destination_path": "/data/raw/Dataset101_KiTS23",
            "staging_path": "/scratch/staging",
            "batch_size": 3,
            "collection": "CPTAC-CCRCC",
            "dataset": {
                "name": "Kidney",
                "channel_names": {"0": "CT"},
                "labels": {"background": 0, "kidney": 1}
            }
        }"#,
    )
    .unwrap();

    let config = ConfigLoader::resolve(Some(path.as_str()), ConfigOverrides::default()).unwrap();

    assert_eq!(config.batch_size, 3);
    assert_eq!(config.collection, "CPTAC-CCRCC");
    assert_eq!(config.modality, "CT");
    assert_eq!(config.staging_path, Utf8PathBuf::from("/scratch/staging"));
    assert_eq!(config.dataset.name, "Kidney");
    assert_eq!(config.dataset.labels.len(), 2);
    assert_eq!(
        config.issue_log_path,
        Utf8PathBuf::from("/data/raw/volstage-issues.jsonl")
    );
}

#[test]
fn overrides_win_over_file() {
    let file = ConfigFile {
        destination_path: Some(Utf8PathBuf::from("/data/raw/a")),
        staging_path: Some(Utf8PathBuf::from("/tmp/s")),
        batch_size: Some(8),
        ..ConfigFile::default()
    };
    let overrides = ConfigOverrides {
        destination_path: Some(Utf8PathBuf::from("/data/raw/b")),
        batch_size: Some(2),
        modality: Some("MR".to_string()),
        ..ConfigOverrides::default()
    };

    let config = ConfigLoader::resolve_config(file, overrides).unwrap();

    assert_eq!(config.destination_path, Utf8PathBuf::from("/data/raw/b"));
    assert_eq!(config.batch_size, 2);
    assert_eq!(config.modality, "MR");
}

#[test]
fn zero_batch_size_is_rejected() {
    let file = ConfigFile {
        destination_path: Some(Utf8PathBuf::from("/data/raw/a")),
        staging_path: Some(Utf8PathBuf::from("/tmp/s")),
        batch_size: Some(0),
        ..ConfigFile::default()
    };
    let err = ConfigLoader::resolve_config(file, ConfigOverrides::default()).unwrap_err();
    assert_matches!(err, StageError::InvalidConfig(_));
}

#[test]
fn missing_destination_is_rejected() {
    let file = ConfigFile {
        staging_path: Some(Utf8PathBuf::from("/tmp/s")),
        ..ConfigFile::default()
    };
    let err = ConfigLoader::resolve_config(file, ConfigOverrides::default()).unwrap_err();
    assert_matches!(err, StageError::InvalidConfig(_));
}

#[test]
fn file_ending_without_dot_is_rejected() {
    let file = ConfigFile {
        destination_path: Some(Utf8PathBuf::from("/data/raw/a")),
        staging_path: Some(Utf8PathBuf::from("/tmp/s")),
        file_ending: Some("nii.gz".to_string()),
        ..ConfigFile::default()
    };
    let err = ConfigLoader::resolve_config(file, ConfigOverrides::default()).unwrap_err();
    assert_matches!(err, StageError::InvalidConfig(_));
}

#[test]
fn explicit_missing_file_is_a_read_error() {
    let (_temp, root) = temp_root();
    let path = root.join("absent.json");
    let err = ConfigLoader::resolve(Some(path.as_str()), ConfigOverrides::default()).unwrap_err();
    assert_matches!(err, StageError::ConfigRead(_));
}

#[test]
fn malformed_file_is_a_parse_error() {
    let (_temp, root) = temp_root();
    let path = root.join("volstage.json");
    fs::write(path.as_std_path(), "{ not json").unwrap();
    let err = ConfigLoader::resolve(Some(path.as_str()), ConfigOverrides::default()).unwrap_err();
    assert_matches!(err, StageError::ConfigParse(_));
}

#[test]
fn default_batch_size_is_five() {
    assert_eq!(DEFAULT_BATCH_SIZE, 5);
}
