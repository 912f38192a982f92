//! Filesystem Gateway
//!
//! The only layer allowed to touch real storage. Everything above it works
//! with [`FilesystemGateway`] so tests can substitute a fault-injecting
//! implementation.
//!
//! ## Modules
//! - `local`: `std::fs` implementation with cross-device move fallback
//! - `holding`: recoverable trash for deletes and overwrites
//! - `io`: crash-safe write and copy helpers

pub mod holding;
pub mod io;
pub mod local;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::file::{FileEntry, PathStat};

pub use holding::{HoldingArea, HoldingEntry};
pub use local::LocalFs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GatewayErrorKind {
    PathNotFound,
    AlreadyExists,
    PermissionDenied,
    CrossDevice,
    Io,
}

impl GatewayErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayErrorKind::PathNotFound => "path_not_found",
            GatewayErrorKind::AlreadyExists => "already_exists",
            GatewayErrorKind::PermissionDenied => "permission_denied",
            GatewayErrorKind::CrossDevice => "cross_device",
            GatewayErrorKind::Io => "io",
        }
    }
}

/// Error from a single gateway call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} ({})", .path.display())]
#[serde(rename_all = "camelCase")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub path: PathBuf,
    pub message: String,
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(unix)]
const EXDEV: i32 = 18;
#[cfg(windows)]
const EXDEV: i32 = 17; // ERROR_NOT_SAME_DEVICE

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, path: &Path, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    pub fn not_found(path: &Path) -> Self {
        Self::new(GatewayErrorKind::PathNotFound, path, "path does not exist")
    }

    pub fn already_exists(path: &Path) -> Self {
        Self::new(GatewayErrorKind::AlreadyExists, path, "path already exists")
    }

    /// Classify an `io::Error` raised while operating on `path`
    pub fn from_io(err: std::io::Error, path: &Path) -> Self {
        let kind = if err.raw_os_error() == Some(EXDEV) {
            GatewayErrorKind::CrossDevice
        } else {
            match err.kind() {
                std::io::ErrorKind::NotFound => GatewayErrorKind::PathNotFound,
                std::io::ErrorKind::AlreadyExists => GatewayErrorKind::AlreadyExists,
                std::io::ErrorKind::PermissionDenied => GatewayErrorKind::PermissionDenied,
                _ => GatewayErrorKind::Io,
            }
        };
        Self::new(kind, path, err.to_string())
    }

    pub fn is_cross_device(&self) -> bool {
        self.kind == GatewayErrorKind::CrossDevice
    }
}

/// Side-effecting filesystem access.
///
/// Mutations never succeed silently: creating something that exists fails
/// with `AlreadyExists`, removing something missing fails with
/// `PathNotFound`. Implementations do not retry.
pub trait FilesystemGateway: Send + Sync {
    /// Entries of a directory, directories first then by name
    fn list(&self, path: &Path) -> GatewayResult<Vec<FileEntry>>;

    /// Metadata without following symlinks; `None` when the path is absent
    fn stat(&self, path: &Path) -> GatewayResult<Option<PathStat>>;

    /// Move `from` to `to`; `to` must not exist
    fn move_path(&self, from: &Path, to: &Path) -> GatewayResult<()>;

    /// Copy a file or directory tree; `to` must not exist
    fn copy(&self, from: &Path, to: &Path) -> GatewayResult<()>;

    /// Remove a file, or a directory (non-empty only when `recursive`)
    fn delete(&self, path: &Path, recursive: bool) -> GatewayResult<()>;

    fn create_directory(&self, path: &Path) -> GatewayResult<()>;

    /// Create an empty file
    fn create_file(&self, path: &Path) -> GatewayResult<()>;

    fn exists(&self, path: &Path) -> GatewayResult<bool> {
        Ok(self.stat(path)?.is_some())
    }
}
