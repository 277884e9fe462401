use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, open_file};
use dicom_pixeldata::PixelDecoder;
use ndarray::{Array2, ArrayView2, Axis};

use crate::domain::Volume;
use crate::error::StageError;
use crate::nifti;

/// Metadata key of the patient identifier, in `group|element` form.
pub const PATIENT_ID_KEY: &str = "0010|0020";

/// A decoded series: the volume plus one metadata map per instance, in codec order.
#[derive(Debug, Clone)]
pub struct SeriesRead {
    pub volume: Volume,
    pub instances: Vec<BTreeMap<String, String>>,
}

pub trait VolumeCodec {
    fn read_series(&self, directory: &Utf8Path) -> Result<SeriesRead, StageError>;
    fn read_metadata_tag(&self, file: &Utf8Path, key: &str) -> Result<String, StageError>;
    fn write_volume(&self, volume: &Volume, path: &Utf8Path) -> Result<(), StageError>;
    /// Array shape from the file header, without reading voxel data where possible.
    fn read_shape(&self, path: &Utf8Path) -> Result<Vec<usize>, StageError>;
}

pub trait RasterReader {
    fn read_grayscale(&self, path: &Utf8Path) -> Result<Array2<u8>, StageError>;
}

/// Instance files (`*.dcm`) directly inside `directory`, sorted by name.
pub fn list_instances(directory: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StageError> {
    let mut files = Vec::new();
    let entries = directory
        .read_dir_utf8()
        .map_err(|err| StageError::io(format!("read {directory}"), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| StageError::io(format!("read {directory}"), err))?;
        let path = entry.path();
        let is_instance = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("dcm"))
            .unwrap_or(false);
        if is_instance && path.is_file() {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Reads DICOM series and writes NIfTI volumes.
#[derive(Debug, Clone, Default)]
pub struct DicomNiftiCodec;

impl DicomNiftiCodec {
    pub fn new() -> Self {
        Self
    }
}

struct Instance {
    number: Option<i32>,
    pixels: Array2<f32>,
    metadata: BTreeMap<String, String>,
    spacing: Option<(f64, f64)>,
    thickness: Option<f64>,
    position: Option<[f64; 3]>,
}

fn open_instance(path: &Utf8Path) -> Result<DefaultDicomObject, StageError> {
    open_file(path.as_std_path()).map_err(|err| StageError::Codec(format!("{path}: {err}")))
}

fn element_str(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|elem| elem.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn element_floats(obj: &DefaultDicomObject, tag: Tag) -> Option<Vec<f64>> {
    obj.element(tag)
        .ok()
        .and_then(|elem| elem.to_multi_float64().ok())
}

fn read_instance(path: &Utf8Path) -> Result<Instance, StageError> {
    let obj = open_instance(path)?;
    let decoded = obj
        .decode_pixel_data()
        .map_err(|err| StageError::Codec(format!("{path}: {err}")))?;
    let rows = decoded.rows() as usize;
    let columns = decoded.columns() as usize;
    let values = decoded
        .to_vec::<f32>()
        .map_err(|err| StageError::Codec(format!("{path}: {err}")))?;
    if values.len() != rows * columns {
        return Err(StageError::Codec(format!(
            "{path}: multi-frame or multi-sample instances are not supported"
        )));
    }
    let pixels = Array2::from_shape_vec((rows, columns), values)
        .map_err(|err| StageError::Codec(format!("{path}: {err}")))?;

    let mut metadata = BTreeMap::new();
    for (key, tag) in [
        (PATIENT_ID_KEY, tags::PATIENT_ID),
        ("0020|000e", tags::SERIES_INSTANCE_UID),
        ("0008|0018", tags::SOP_INSTANCE_UID),
        ("0020|0013", tags::INSTANCE_NUMBER),
    ] {
        if let Some(value) = element_str(&obj, tag) {
            metadata.insert(key.to_string(), value);
        }
    }

    Ok(Instance {
        number: obj
            .element(tags::INSTANCE_NUMBER)
            .ok()
            .and_then(|elem| elem.to_int::<i32>().ok()),
        pixels,
        metadata,
        spacing: element_floats(&obj, tags::PIXEL_SPACING)
            .filter(|values| values.len() >= 2)
            .map(|values| (values[0], values[1])),
        thickness: element_floats(&obj, tags::SPACING_BETWEEN_SLICES)
            .or_else(|| element_floats(&obj, tags::SLICE_THICKNESS))
            .and_then(|values| values.first().copied()),
        position: element_floats(&obj, tags::IMAGE_POSITION_PATIENT)
            .filter(|values| values.len() >= 3)
            .map(|values| [values[0], values[1], values[2]]),
    })
}

impl VolumeCodec for DicomNiftiCodec {
    fn read_series(&self, directory: &Utf8Path) -> Result<SeriesRead, StageError> {
        let files = list_instances(directory)?;
        if files.is_empty() {
            return Err(StageError::Codec(format!("{directory}: no instances")));
        }
        let mut instances = files
            .iter()
            .map(|path| read_instance(path))
            .collect::<Result<Vec<_>, _>>()?;
        // Stable: equal or missing instance numbers keep file-name order.
        instances.sort_by_key(|instance| instance.number.unwrap_or(i32::MAX));

        let shape = instances[0].pixels.dim();
        if let Some(odd) = instances.iter().find(|i| i.pixels.dim() != shape) {
            return Err(StageError::Codec(format!(
                "{directory}: inconsistent slice shapes {:?} and {:?}",
                shape,
                odd.pixels.dim()
            )));
        }
        let views: Vec<ArrayView2<'_, f32>> = instances.iter().map(|i| i.pixels.view()).collect();
        let stacked = ndarray::stack(Axis(2), &views)
            .map_err(|err| StageError::Codec(format!("{directory}: {err}")))?;
        // (rows, columns, slices) -> (x, y, z)
        let data = stacked.permuted_axes([1, 0, 2]).into_dyn();

        let first = &instances[0];
        let (row_spacing, column_spacing) = first.spacing.unwrap_or((1.0, 1.0));
        let spacing = [column_spacing, row_spacing, first.thickness.unwrap_or(1.0)];
        let volume = Volume::native(data, spacing, first.position.unwrap_or([0.0; 3]));

        Ok(SeriesRead {
            volume,
            instances: instances.into_iter().map(|i| i.metadata).collect(),
        })
    }

    fn read_metadata_tag(&self, file: &Utf8Path, key: &str) -> Result<String, StageError> {
        let tag = parse_tag_key(key)?;
        let obj = open_instance(file)?;
        element_str(&obj, tag)
            .ok_or_else(|| StageError::Codec(format!("{file}: tag {key} missing or empty")))
    }

    fn write_volume(&self, volume: &Volume, path: &Utf8Path) -> Result<(), StageError> {
        nifti::write_volume(volume, path)
    }

    fn read_shape(&self, path: &Utf8Path) -> Result<Vec<usize>, StageError> {
        nifti::read_shape(path)
    }
}

/// Parses `gggg|eeee` (hex) into a tag.
pub fn parse_tag_key(key: &str) -> Result<Tag, StageError> {
    let (group, element) = key
        .split_once('|')
        .ok_or_else(|| StageError::Codec(format!("invalid tag key {key}")))?;
    let parse = |part: &str| {
        u16::from_str_radix(part.trim(), 16)
            .map_err(|_| StageError::Codec(format!("invalid tag key {key}")))
    };
    Ok(Tag(parse(group)?, parse(element)?))
}

/// Decodes PNG/JPEG slices to 8-bit grayscale.
#[derive(Debug, Clone, Default)]
pub struct ImageRasterReader;

impl RasterReader for ImageRasterReader {
    fn read_grayscale(&self, path: &Utf8Path) -> Result<Array2<u8>, StageError> {
        let bytes =
            fs::read(path.as_std_path()).map_err(|err| StageError::io(format!("read {path}"), err))?;
        let image = image::load_from_memory(&bytes).map_err(|err| StageError::Raster {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        Array2::from_shape_vec((height as usize, width as usize), gray.into_raw()).map_err(|err| {
            StageError::Raster {
                path: path.to_string(),
                message: err.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_patient_id_key() {
        let tag = parse_tag_key(PATIENT_ID_KEY).unwrap();
        assert_eq!(tag, tags::PATIENT_ID);
        assert!(parse_tag_key("0010-0020").is_err());
    }

    #[test]
    fn lists_only_dcm_files() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::write(dir.join("1-002.dcm"), b"x").unwrap();
        fs::write(dir.join("1-001.DCM"), b"x").unwrap();
        fs::write(dir.join("LICENSE"), b"x").unwrap();

        let files = list_instances(&dir).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.file_name().unwrap()).collect();
        assert_eq!(names, vec!["1-001.DCM", "1-002.dcm"]);
    }

    #[test]
    fn reads_png_as_grayscale() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("slice_1.png")).unwrap();
        let img = image::GrayImage::from_fn(3, 2, |x, y| image::Luma([(x + 10 * y) as u8]));
        img.save(path.as_std_path()).unwrap();

        let array = ImageRasterReader.read_grayscale(&path).unwrap();
        assert_eq!(array.dim(), (2, 3));
        assert_eq!(array[[1, 2]], 12);
    }
}
