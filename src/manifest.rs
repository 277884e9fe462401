//! `dataset.json` describing the destination for the downstream trainer.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::config::DatasetSchema;
use crate::error::StageError;
use crate::store::{DatasetLayout, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetManifest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(rename = "tensorImageSize")]
    pub tensor_image_size: String,
    pub channel_names: BTreeMap<String, String>,
    /// Kept for trainers that read the legacy key.
    pub modality: BTreeMap<String, String>,
    #[serde(serialize_with = "labels_by_value")]
    pub labels: BTreeMap<String, u16>,
    #[serde(rename = "numTraining")]
    pub num_training: usize,
    pub file_ending: String,
}

impl DatasetManifest {
    pub fn new(schema: &DatasetSchema, num_training: usize, file_ending: &str) -> Self {
        Self {
            name: schema.name.clone(),
            description: schema.description.clone(),
            reference: schema.reference.clone(),
            release: schema.release.clone(),
            tensor_image_size: "3D".to_string(),
            channel_names: schema.channel_names.clone(),
            modality: schema.channel_names.clone(),
            labels: schema.labels.clone(),
            num_training,
            file_ending: file_ending.to_string(),
        }
    }
}

/// Label names in ascending label-value order, background first.
fn labels_by_value<S: Serializer>(
    labels: &BTreeMap<String, u16>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut ordered: Vec<(&String, &u16)> = labels.iter().collect();
    ordered.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
    serializer.collect_map(ordered)
}

pub struct ManifestWriter<'a> {
    layout: &'a DatasetLayout,
    schema: &'a DatasetSchema,
}

impl<'a> ManifestWriter<'a> {
    pub fn new(layout: &'a DatasetLayout, schema: &'a DatasetSchema) -> Self {
        Self { layout, schema }
    }

    /// Builds the manifest from the case records currently on disk.
    pub fn build(&self) -> Result<DatasetManifest, StageError> {
        let records = self.layout.case_records()?;
        Ok(DatasetManifest::new(
            self.schema,
            records.len(),
            self.layout.file_ending(),
        ))
    }

    /// Writes (replacing) `dataset.json` when the run processed at least one unit.
    pub fn write_if_processed(
        &self,
        processed: usize,
    ) -> Result<Option<DatasetManifest>, StageError> {
        if processed == 0 {
            debug!("nothing processed; manifest left untouched");
            return Ok(None);
        }
        self.write().map(Some)
    }

    pub fn write(&self) -> Result<DatasetManifest, StageError> {
        let manifest = self.build()?;
        let path = self.layout.manifest_path();
        write_json_atomic(&path, &manifest)?;
        info!(path = %path, cases = manifest.num_training, "manifest written");
        Ok(manifest)
    }
}
