use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Kind of filesystem entry, determined without following symlinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Device, socket, fifo
    Other,
}

impl EntryKind {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink => "link",
            EntryKind::Other => "other",
        }
    }
}

/// Metadata for a single path, as returned by `FilesystemGateway::stat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStat {
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Last modified timestamp (milliseconds since epoch)
    pub modified_at: Option<i64>,
    pub is_readonly: bool,
}

impl PathStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let kind = EntryKind::from_metadata(meta);
        Self {
            kind,
            size: if kind == EntryKind::Directory { 0 } else { meta.len() },
            modified_at: millis(meta.modified().ok()),
            is_readonly: meta.permissions().readonly(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Represents a single file or directory entry in a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// File or directory name
    pub name: String,
    /// Absolute path
    pub path: PathBuf,
    pub kind: EntryKind,
    /// File size in bytes (0 for directories)
    pub size: u64,
    /// Last modified timestamp (milliseconds since epoch)
    pub modified_at: Option<i64>,
    /// File extension (without dot), None for directories
    pub extension: Option<String>,
    /// MIME type guess based on extension
    pub mime_type: Option<String>,
    /// Whether the name starts with a dot
    pub is_hidden: bool,
}

impl FileEntry {
    /// Create a FileEntry from a path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::symlink_metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let stat = PathStat::from_metadata(&metadata);

        let extension = if stat.kind == EntryKind::File {
            path.extension().map(|e| e.to_string_lossy().to_string())
        } else {
            None
        };

        let mime_type = extension
            .as_ref()
            .and_then(|ext| mime_guess::from_ext(ext).first().map(|m| m.to_string()));

        let is_hidden = name.starts_with('.');

        Ok(Self {
            name,
            path: path.to_path_buf(),
            kind: stat.kind,
            size: stat.size,
            modified_at: stat.modified_at,
            extension,
            mime_type,
            is_hidden,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

fn millis(time: Option<std::time::SystemTime>) -> Option<i64> {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}
