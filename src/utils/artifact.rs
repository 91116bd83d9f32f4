//! Saving received files to disk.
//!
//! Each artifact is written to a `.part` file next to its final location and
//! renamed into place, so an interrupted write never leaves a truncated file
//! under the real name. An existing file is never overwritten: a numbered
//! variant of the name is chosen instead.

use crate::core::pipeline::receiver::ReceivedFile;
use crate::utils::formatters::{sanitize_file_name, unique_path};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Write `content` to `path` via a temporary file and rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".part");
    let tmp_path = PathBuf::from(tmp_name);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "artifact_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "artifact_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

/// Save `file` into `dir` under its sanitized name. Returns the final path.
pub fn save_artifact(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    let path = unique_path(dir, &sanitize_file_name(&file.name));
    atomic_write(&path, &file.data)?;
    info!(
        event = "artifact_saved",
        file = %file.name,
        path = %path.display(),
        bytes = file.size(),
        "Received file saved"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn received(name: &str, data: &'static [u8]) -> ReceivedFile {
        ReceivedFile {
            name: name.into(),
            mime_type: "application/octet-stream".into(),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_atomic_write_no_temp_file_remains() {
        let dir = std::env::temp_dir().join("roomdrop_test").join("atomic");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("data.bin");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!dir.join("data.bin.part").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_artifact_sanitizes_and_never_overwrites() {
        let dir = std::env::temp_dir().join("roomdrop_test").join("artifacts");
        let _ = std::fs::remove_dir_all(&dir);

        let first = save_artifact(&dir, &received("../secret.txt", b"one")).unwrap();
        assert_eq!(first, dir.join("secret.txt"));

        let second = save_artifact(&dir, &received("secret.txt", b"two")).unwrap();
        assert_eq!(second, dir.join("secret (1).txt"));
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
