//! Crash-safe JSON snapshots.
//!
//! A snapshot is written to `<path>.tmp`, fsynced, then renamed over `<path>`. A
//! crash at any point leaves either the previous file or the new one, never a
//! partially written file.

use crate::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Path of the scratch file used while writing `path`.
pub fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp", path.display()))
}

/// Atomically replace `path` with the JSON encoding of `value`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp = tmp_path(path);
    let written = (|| -> Result<(), StoreError> {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();

    if let Err(err) = written.and_then(|()| fs::rename(&tmp, path).map_err(StoreError::from)) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    sync_parent_dir(path);
    Ok(())
}

/// Read a JSON snapshot. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_reader(BufReader::new(file))?;
    Ok(Some(value))
}

// Persist the rename itself. Not every platform lets a directory be opened for sync.
fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    match File::open(parent) {
        Ok(dir) => {
            if let Err(err) = dir.sync_all() {
                tracing::debug!(dir = %parent.display(), error = %err, "directory fsync failed");
            }
        }
        Err(err) => {
            tracing::debug!(dir = %parent.display(), error = %err, "could not open directory for fsync");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<BTreeMap<String, u32>> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn write_replaces_previous_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        write_json_atomic(&path, &vec![4]).unwrap();

        let loaded: Option<Vec<u32>> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![4]));
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn crash_before_rename_keeps_previous_file_loadable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let mut original = BTreeMap::new();
        original.insert("artist:1".to_string(), vec!["rock".to_string()]);
        write_json_atomic(&path, &original).unwrap();

        // A writer killed mid-serialization leaves a truncated scratch file behind.
        fs::write(tmp_path(&path), b"{\"artist:1\": [\"ro").unwrap();

        let loaded: Option<BTreeMap<String, Vec<String>>> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(original.clone()));

        // The next successful write overwrites the stale scratch file.
        original.insert("artist:2".to_string(), vec!["jazz".to_string()]);
        write_json_atomic(&path, &original).unwrap();
        let loaded: Option<BTreeMap<String, Vec<String>>> = read_json(&path).unwrap();
        assert_eq!(loaded.map(|m| m.len()), Some(2));
    }

    #[test]
    fn corrupt_file_is_a_serde_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"not json").unwrap();

        let err = read_json::<Vec<u32>>(&path).unwrap_err();
        assert!(matches!(err, StoreError::Serde(_)));
    }
}
