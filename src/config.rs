use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::StageError;

pub const DEFAULT_CONFIG_FILE: &str = "volstage.json";
pub const DEFAULT_BATCH_SIZE: usize = 5;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub source_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub destination_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub staging_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub ledger_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub issue_log_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub file_ending: Option<String>,
    #[serde(default)]
    pub image_subdir: Option<String>,
    #[serde(default)]
    pub mask_subdir: Option<String>,
    #[serde(default)]
    pub dataset: Option<DatasetSchema>,
}

/// Channel/label schema of the target segmentation task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatasetSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
    pub channel_names: BTreeMap<String, String>,
    pub labels: BTreeMap<String, u16>,
}

impl Default for DatasetSchema {
    fn default() -> Self {
        Self {
            name: "KiTS23".to_string(),
            description: Some("Kidney Tumor Segmentation Challenge 2023".to_string()),
            reference: Some("KiTS23 Challenge".to_string()),
            release: Some("1.0".to_string()),
            channel_names: BTreeMap::from([("0".to_string(), "CT".to_string())]),
            labels: BTreeMap::from([
                ("background".to_string(), 0),
                ("kidney".to_string(), 1),
                ("tumor".to_string(), 2),
                ("cyst".to_string(), 3),
            ]),
        }
    }
}

/// The one configuration value handed to every component.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_path: Utf8PathBuf,
    pub destination_path: Utf8PathBuf,
    pub staging_path: Utf8PathBuf,
    pub ledger_path: Utf8PathBuf,
    pub issue_log_path: Utf8PathBuf,
    pub batch_size: usize,
    pub collection: String,
    pub modality: String,
    pub file_ending: String,
    pub image_subdir: String,
    pub mask_subdir: String,
    pub dataset: DatasetSchema,
}

/// Values supplied on the command line; they win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub source_path: Option<Utf8PathBuf>,
    pub destination_path: Option<Utf8PathBuf>,
    pub staging_path: Option<Utf8PathBuf>,
    pub batch_size: Option<usize>,
    pub collection: Option<String>,
    pub modality: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<PipelineConfig, StageError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.as_std_path().exists() {
            if overrides.destination_path.is_none() {
                return Err(StageError::MissingConfig);
            }
            ConfigFile::default()
        } else {
            Self::read(&config_path)?
        };

        Self::resolve_config(config, overrides)
    }

    pub fn read(path: &Utf8Path) -> Result<ConfigFile, StageError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| StageError::ConfigRead(path.as_std_path().to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| StageError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(
        config: ConfigFile,
        overrides: ConfigOverrides,
    ) -> Result<PipelineConfig, StageError> {
        let destination_path = overrides
            .destination_path
            .or(config.destination_path)
            .ok_or_else(|| StageError::InvalidConfig("destination_path is required".to_string()))?;
        let source_path = overrides
            .source_path
            .or(config.source_path)
            .unwrap_or_else(|| Utf8PathBuf::from("."));

        let batch_size = overrides
            .batch_size
            .or(config.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(StageError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }

        let work_root = destination_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        let staging_path = match overrides.staging_path.or(config.staging_path) {
            Some(path) => path,
            None => default_staging_path()?,
        };
        let ledger_path = config
            .ledger_path
            .unwrap_or_else(|| work_root.join("processed_series.log"));
        let issue_log_path = config
            .issue_log_path
            .unwrap_or_else(|| work_root.join("volstage-issues.jsonl"));

        let file_ending = config.file_ending.unwrap_or_else(|| ".nii.gz".to_string());
        if !file_ending.starts_with('.') {
            return Err(StageError::InvalidConfig(format!(
                "file_ending must start with '.': {file_ending}"
            )));
        }

        Ok(PipelineConfig {
            source_path,
            destination_path,
            staging_path,
            ledger_path,
            issue_log_path,
            batch_size,
            collection: overrides
                .collection
                .or(config.collection)
                .unwrap_or_else(|| "TCGA-KIRC".to_string()),
            modality: overrides
                .modality
                .or(config.modality)
                .unwrap_or_else(|| "CT".to_string()),
            file_ending,
            image_subdir: config
                .image_subdir
                .unwrap_or_else(|| "JPEGImages".to_string()),
            mask_subdir: config
                .mask_subdir
                .unwrap_or_else(|| "Annotations".to_string()),
            dataset: config.dataset.unwrap_or_default(),
        })
    }
}

fn default_staging_path() -> Result<Utf8PathBuf, StageError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.cache_dir().join("volstage").join("staging")).ok()
        })
        .ok_or_else(|| StageError::Filesystem("unable to resolve cache directory".to_string()))
}
