//! Minimal NIfTI-1 support: header-only shape reads and single-file writes.
//!
//! Files ending in `.gz` are gzip streams; everything else is read and
//! written uncompressed.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};

use camino::Utf8Path;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tempfile::Builder;

use crate::domain::{Volume, VolumeKind};
use crate::error::StageError;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const DT_UINT8: i16 = 2;
const DT_FLOAT32: i16 = 16;
const UNITS_MM: u8 = 2;
const DEGRADED_DESCRIP: &str = "identity placeholder spacing";

mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const XYZT_UNITS: usize = 123;
    pub const DESCRIP: usize = 148;
    pub const QFORM_CODE: usize = 252;
    pub const SFORM_CODE: usize = 254;
    pub const SROW_X: usize = 280;
    pub const MAGIC: usize = 344;
}

fn is_gzip(path: &Utf8Path) -> bool {
    path.as_str().ends_with(".gz")
}

/// Reads only the header and returns the array shape (`dim[1..=dim[0]]`).
pub fn read_shape(path: &Utf8Path) -> Result<Vec<usize>, StageError> {
    let file =
        File::open(path.as_std_path()).map_err(|err| StageError::io(format!("open {path}"), err))?;
    let mut reader: Box<dyn Read> = if is_gzip(path) {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .map_err(|err| StageError::Codec(format!("{path}: truncated header: {err}")))?;
    parse_shape(&header).map_err(|message| StageError::Codec(format!("{path}: {message}")))
}

fn parse_shape(header: &[u8; HEADER_SIZE]) -> Result<Vec<usize>, String> {
    let sizeof_hdr = i32::from_le_bytes(read4(header, offsets::SIZEOF_HDR));
    let little_endian = match sizeof_hdr {
        348 => true,
        _ if i32::from_be_bytes(read4(header, offsets::SIZEOF_HDR)) == 348 => false,
        other => return Err(format!("not a NIfTI-1 header (sizeof_hdr={other})")),
    };
    let dim = |index: usize| {
        let bytes = [header[offsets::DIM + 2 * index], header[offsets::DIM + 2 * index + 1]];
        if little_endian {
            i16::from_le_bytes(bytes)
        } else {
            i16::from_be_bytes(bytes)
        }
    };
    let rank = dim(0);
    if !(1..=7).contains(&rank) {
        return Err(format!("invalid dimension count {rank}"));
    }
    (1..=rank as usize)
        .map(|index| {
            let value = dim(index);
            usize::try_from(value).map_err(|_| format!("negative dimension {value}"))
        })
        .collect()
}

fn read4(header: &[u8], offset: usize) -> [u8; 4] {
    [
        header[offset],
        header[offset + 1],
        header[offset + 2],
        header[offset + 3],
    ]
}

fn build_header(volume: &Volume) -> Result<Vec<u8>, StageError> {
    let shape = volume.shape();
    if shape.is_empty() || shape.len() > 7 {
        return Err(StageError::Codec(format!(
            "cannot encode array of rank {}",
            shape.len()
        )));
    }
    let mut header = vec![0u8; VOX_OFFSET];
    put(&mut header, offsets::SIZEOF_HDR, &(HEADER_SIZE as i32).to_le_bytes());

    let mut dims = [1i16; 8];
    dims[0] = shape.len() as i16;
    for (axis, &len) in shape.iter().enumerate() {
        dims[axis + 1] = i16::try_from(len)
            .map_err(|_| StageError::Codec(format!("axis {axis} too long for NIfTI-1: {len}")))?;
    }
    for (index, value) in dims.iter().enumerate() {
        put(&mut header, offsets::DIM + 2 * index, &value.to_le_bytes());
    }

    let (datatype, bitpix) = match volume.kind {
        VolumeKind::Intensity => (DT_FLOAT32, 32i16),
        VolumeKind::Label => (DT_UINT8, 8i16),
    };
    put(&mut header, offsets::DATATYPE, &datatype.to_le_bytes());
    put(&mut header, offsets::BITPIX, &bitpix.to_le_bytes());

    let mut pixdim = [1.0f32; 8];
    for axis in 0..3 {
        pixdim[axis + 1] = volume.spacing[axis] as f32;
    }
    for (index, value) in pixdim.iter().enumerate() {
        put(&mut header, offsets::PIXDIM + 4 * index, &value.to_le_bytes());
    }
    put(&mut header, offsets::VOX_OFFSET, &(VOX_OFFSET as f32).to_le_bytes());
    put(&mut header, offsets::SCL_SLOPE, &1.0f32.to_le_bytes());
    header[offsets::XYZT_UNITS] = UNITS_MM;

    // A degraded volume declares no coordinate system at all.
    let xform_code: i16 = if volume.is_degraded() {
        put(&mut header, offsets::DESCRIP, DEGRADED_DESCRIP.as_bytes());
        0
    } else {
        1
    };
    put(&mut header, offsets::QFORM_CODE, &0i16.to_le_bytes());
    put(&mut header, offsets::SFORM_CODE, &xform_code.to_le_bytes());
    for (row, values) in volume.affine.iter().take(3).enumerate() {
        for (col, value) in values.iter().enumerate() {
            let offset = offsets::SROW_X + 16 * row + 4 * col;
            put(&mut header, offset, &(*value as f32).to_le_bytes());
        }
    }
    put(&mut header, offsets::MAGIC, b"n+1\0");
    Ok(header)
}

fn put(buffer: &mut [u8], offset: usize, bytes: &[u8]) {
    buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn write_payload<W: Write>(writer: &mut W, volume: &Volume) -> std::io::Result<()> {
    writer.write_all(&build_header(volume).map_err(std::io::Error::other)?)?;
    // NIfTI stores the first axis fastest; the transposed view iterates in that order.
    match volume.kind {
        VolumeKind::Intensity => {
            for value in volume.data.t().iter() {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        VolumeKind::Label => {
            for value in volume.data.t().iter() {
                writer.write_all(&[value.round().clamp(0.0, 255.0) as u8])?;
            }
        }
    }
    Ok(())
}

/// Writes `volume` to `path` via a temp file; an existing `path` is never replaced.
pub fn write_volume(volume: &Volume, path: &Utf8Path) -> Result<(), StageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StageError::Filesystem(format!("invalid output path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| StageError::io(format!("create {parent}"), err))?;
    let temp = Builder::new()
        .prefix(".volstage-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| StageError::io(format!("temp file in {parent}"), err))?;

    let result = if is_gzip(path) {
        let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
        write_payload(&mut encoder, volume)
            .and_then(|_| encoder.finish())
            .and_then(|mut inner| inner.flush())
    } else {
        let mut writer = BufWriter::new(temp.as_file());
        write_payload(&mut writer, volume).and_then(|_| writer.flush())
    };
    result.map_err(|err| StageError::io(format!("write {path}"), err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| StageError::io(format!("sync {path}"), err))?;

    temp.persist_noclobber(path.as_std_path())
        .map_err(|err| StageError::io(format!("persist {path}"), err.error))?;
    Ok(())
}
