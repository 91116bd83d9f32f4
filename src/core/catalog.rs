//! File catalogs and the catalog exchange.
//!
//! Each session holds two catalogs: the files we offer (`Origin::Local`) and
//! the files the peer announced (`Origin::Remote`). Names are unique within a
//! catalog; inserting a record with an existing name replaces it in place, so
//! announcement order is preserved.
//!
//! The exchange itself is two operations:
//! - [`Catalog::announcement`]: the full local catalog as one `file-list`
//!   message (metadata only, never content).
//! - [`Catalog::apply_announcement`]: wholesale latest-wins replacement of the
//!   remote catalog. Entries whose metadata did not change keep their progress,
//!   so re-sending an unchanged catalog is observably a no-op.

use crate::core::protocol::{ControlMessage, FileMeta};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Handle to the bytes of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Content already in memory.
    Memory(Bytes),
    /// Content read lazily from disk, sequentially, while streaming.
    Path(PathBuf),
}

/// A file selected locally for sharing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub source: FileSource,
}

impl LocalFile {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime_type: mime_type.into(),
            source: FileSource::Memory(data),
        }
    }

    /// Describe a file on disk. The name is the final path component.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)
            .with_context(|| format!("cannot stat {}", path.display()))?;
        if !meta.is_file() {
            return Err(anyhow!("{} is not a regular file", path.display()));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?
            .to_string();

        Ok(Self {
            name,
            size: meta.len(),
            mime_type: detect_mime_type(path),
            source: FileSource::Path(path.to_path_buf()),
        })
    }
}

/// One entry of a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub origin: Origin,
    /// Per-file download progress, 0–100. Only meaningful for remote records.
    pub progress: u8,
    /// Content handle. Always `Some` for local records, `None` for remote ones.
    pub content: Option<FileSource>,
}

impl FileRecord {
    pub fn meta(&self) -> FileMeta {
        FileMeta {
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
        }
    }

    fn remote(meta: FileMeta) -> Self {
        Self {
            name: meta.name,
            size: meta.size,
            mime_type: meta.mime_type,
            origin: Origin::Remote,
            progress: 0,
            content: None,
        }
    }

    fn same_meta(&self, meta: &FileMeta) -> bool {
        self.name == meta.name && self.size == meta.size && self.mime_type == meta.mime_type
    }
}

impl From<LocalFile> for FileRecord {
    fn from(file: LocalFile) -> Self {
        Self {
            name: file.name,
            size: file.size,
            mime_type: file.mime_type,
            origin: Origin::Local,
            progress: 0,
            content: Some(file.source),
        }
    }
}

/// Name-keyed, insertion-ordered set of file records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    origin: Origin,
    records: Vec<FileRecord>,
}

impl Catalog {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            records: Vec::new(),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Insert or replace by name. Returns `true` if a record was replaced.
    pub fn insert(&mut self, record: FileRecord) -> bool {
        match self.records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                self.records.push(record);
                false
            }
        }
    }

    /// Update the progress marker of one record. Progress never goes
    /// backwards through this call.
    pub fn set_progress(&mut self, name: &str, progress: u8) {
        if let Some(record) = self.records.iter_mut().find(|r| r.name == name) {
            record.progress = record.progress.max(progress.min(100));
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn metas(&self) -> Vec<FileMeta> {
        self.records.iter().map(FileRecord::meta).collect()
    }

    /// The `file-list` message describing this catalog.
    pub fn announcement(&self) -> ControlMessage {
        ControlMessage::FileList(self.metas())
    }

    /// Replace this (remote) catalog with a freshly received announcement.
    ///
    /// Latest wins: the result contains exactly the announced names, in
    /// announced order, with a later duplicate replacing an earlier one.
    /// Records whose name, size and type are unchanged keep their progress;
    /// everything else starts at 0.
    pub fn apply_announcement(&mut self, list: Vec<FileMeta>) {
        let previous = std::mem::take(&mut self.records);
        let mut next = Catalog::new(self.origin);

        for meta in list {
            let mut record = FileRecord::remote(meta.clone());
            if let Some(old) = previous.iter().find(|r| r.same_meta(&meta)) {
                record.progress = old.progress;
            }
            next.insert(record);
        }

        self.records = next.records;
    }
}

/// Guess a MIME type from magic bytes, falling back to the extension.
pub fn detect_mime_type(path: &Path) -> String {
    if let Some(kind) = infer::get_from_path(path).ok().flatten() {
        return kind.mime_type().to_string();
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let mime = match extension.as_str() {
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/x-yaml",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, size: u64) -> FileMeta {
        FileMeta {
            name: name.into(),
            size,
            mime_type: "application/octet-stream".into(),
        }
    }

    #[test]
    fn insert_replaces_same_name_in_place() {
        let mut catalog = Catalog::new(Origin::Local);
        catalog.insert(LocalFile::from_bytes("a", "text/plain", Bytes::from_static(b"1")).into());
        catalog.insert(LocalFile::from_bytes("b", "text/plain", Bytes::from_static(b"22")).into());
        let replaced =
            catalog.insert(LocalFile::from_bytes("a", "text/plain", Bytes::from_static(b"333")).into());

        assert!(replaced);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.records()[0].name, "a");
        assert_eq!(catalog.records()[0].size, 3);
    }

    #[test]
    fn announcement_carries_metadata_only() {
        let mut catalog = Catalog::new(Origin::Local);
        catalog.insert(LocalFile::from_bytes("a.txt", "text/plain", Bytes::from_static(b"abc")).into());

        let json = catalog.announcement().encode().unwrap();
        assert!(json.contains("\"a.txt\""));
        assert!(!json.contains("abc\""));
        assert_eq!(catalog.announcement(), ControlMessage::FileList(vec![FileMeta {
            name: "a.txt".into(),
            size: 3,
            mime_type: "text/plain".into(),
        }]));
    }

    #[test]
    fn announcement_replaces_wholesale() {
        let mut remote = Catalog::new(Origin::Remote);
        remote.apply_announcement(vec![meta("a", 1), meta("b", 2)]);
        remote.apply_announcement(vec![meta("c", 3)]);

        assert_eq!(remote.len(), 1);
        assert_eq!(remote.origin(), Origin::Remote);
        assert!(remote.get("a").is_none());
        assert_eq!(remote.get("c").unwrap().origin, Origin::Remote);
        assert_eq!(remote.get("c").unwrap().progress, 0);
    }

    #[test]
    fn duplicate_names_in_one_announcement_keep_the_later() {
        let mut remote = Catalog::new(Origin::Remote);
        remote.apply_announcement(vec![meta("a", 1), meta("b", 2), meta("a", 9)]);

        assert_eq!(remote.len(), 2);
        assert_eq!(remote.get("a").unwrap().size, 9);
    }

    #[test]
    fn reannouncing_unchanged_catalog_is_idempotent() {
        let mut remote = Catalog::new(Origin::Remote);
        remote.apply_announcement(vec![meta("a", 10), meta("b", 20)]);
        remote.set_progress("a", 40);
        let before = remote.clone();

        remote.apply_announcement(vec![meta("a", 10), meta("b", 20)]);
        assert_eq!(remote, before);
    }

    #[test]
    fn changed_entry_resets_progress() {
        let mut remote = Catalog::new(Origin::Remote);
        remote.apply_announcement(vec![meta("a", 10)]);
        remote.set_progress("a", 70);

        remote.apply_announcement(vec![meta("a", 11)]);
        assert_eq!(remote.get("a").unwrap().progress, 0);
    }

    #[test]
    fn progress_never_decreases() {
        let mut remote = Catalog::new(Origin::Remote);
        remote.apply_announcement(vec![meta("a", 10)]);
        remote.set_progress("a", 50);
        remote.set_progress("a", 20);
        assert_eq!(remote.get("a").unwrap().progress, 50);
        remote.set_progress("a", 250);
        assert_eq!(remote.get("a").unwrap().progress, 100);
    }

    #[test]
    fn local_file_from_path() {
        let dir = std::env::temp_dir().join("roomdrop_test").join("catalog");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let file = LocalFile::from_path(&path).unwrap();
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.size, 5);
        assert_eq!(file.mime_type, "text/plain");
        assert_eq!(file.source, FileSource::Path(path.clone()));

        assert!(LocalFile::from_path(&dir).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
