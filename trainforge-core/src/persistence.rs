//! Atomic file persistence shared by checkpoints, tracking logs and reports.
//!
//! Every writer goes through [`atomic_write`]: the payload lands in a sibling
//! temp file which is then renamed over the target, so a crash mid-write never
//! leaves a truncated checkpoint behind.

use crate::error::{CoreError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Atomically write raw bytes to `path`, creating parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(path);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomically write `data` as pretty-printed JSON.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(data)?;
    atomic_write(path, &json)
}

/// Read a whole file. A missing file is reported as [`CoreError::NotFound`].
pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::not_found(path)),
        Err(e) => Err(e.into()),
    }
}

/// Load and deserialize JSON. Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Creation time of a file, falling back to its modification time on
/// filesystems that do not record birth times.
pub fn created_time(path: &Path) -> Result<SystemTime> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.created().or_else(|_| meta.modified())?)
}

/// Regular files directly inside `dir` whose extension equals `extension`.
/// A missing directory yields an empty list.
pub fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("file"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let data = Report {
            name: "resnet".into(),
            count: 3,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Report> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs_and_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("last.ckpt");

        atomic_write(&path, b"weights").unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("a/b/last.ckpt.tmp").exists());
    }

    #[test]
    fn test_read_bytes_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = read_bytes(&dir.path().join("nope.ckpt")).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn test_list_files_filters_extension() {
        let dir = TempDir::new().unwrap();
        atomic_write(&dir.path().join("step_1.ckpt"), b"1").unwrap();
        atomic_write(&dir.path().join("step_2.ckpt"), b"2").unwrap();
        atomic_write(&dir.path().join("notes.json"), b"{}").unwrap();

        let files = list_files(dir.path(), "ckpt").unwrap();
        assert_eq!(files.len(), 2);
        assert!(list_files(&dir.path().join("missing"), "ckpt").unwrap().is_empty());
    }
}
