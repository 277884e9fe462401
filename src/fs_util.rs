use std::fs;
use std::io;
use std::path::Path;

use zip::ZipArchive;

use crate::error::StageError;

/// Extracts a downloaded series archive, rejecting entries that escape `target_dir`.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<usize, StageError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| StageError::io(format!("open zip {}", zip_path.display()), err))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| StageError::Filesystem(err.to_string()))?;

    let mut extracted = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| StageError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(StageError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| StageError::io(format!("create {}", entry_path.display()), err))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StageError::io(format!("create {}", parent.display()), err))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| StageError::io(format!("create {}", entry_path.display()), err))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| StageError::io(format!("extract {}", entry_path.display()), err))?;
        extracted += 1;
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    #[test]
    fn extracts_series_archive() {
        let temp = tempfile::tempdir().unwrap();
        let zip_path = temp.path().join("series.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("1-001.dcm", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"DICM").unwrap();
            writer
                .start_file("1-002.dcm", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"DICM").unwrap();
            writer.finish().unwrap();
        }

        let out = temp.path().join("out");
        let count = extract_zip(&zip_path, &out).unwrap();
        assert_eq!(count, 2);
        assert!(out.join("1-002.dcm").exists());
    }
}
