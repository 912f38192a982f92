//! Safe I/O helpers used by the gateway, holding area and ledger journal
//!
//! Provides:
//! - Atomic writes with fsync
//! - Directory synchronization
//! - Symlink detection
//! - Tree copies that skip symlinks and keep modification times

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use filetime::FileTime;
use walkdir::WalkDir;

use super::{GatewayError, GatewayErrorKind, GatewayResult};

/// Write data to a file atomically with fsync
///
/// 1. Writes data to a temporary file in the same directory
/// 2. Calls fsync on the file
/// 3. Renames the temp file over the target
/// 4. Syncs the directory so the rename is durable
///
/// The temporary file is removed if any step fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> GatewayResult<()> {
    let parent = path.parent().ok_or_else(|| {
        GatewayError::new(
            GatewayErrorKind::Io,
            path,
            "cannot determine parent directory",
        )
    })?;

    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| GatewayError::from_io(e, parent))?;
    }

    let temp_name = format!(
        ".{}.tmp.{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string()),
        std::process::id()
    );
    let temp_path = parent.join(&temp_name);

    let write_result = (|| -> GatewayResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| GatewayError::from_io(e, &temp_path))?;
        file.write_all(data)
            .map_err(|e| GatewayError::from_io(e, &temp_path))?;
        file.sync_all()
            .map_err(|e| GatewayError::from_io(e, &temp_path))?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(GatewayError::from_io(e, path));
    }

    sync_directory(parent)
}

/// Sync a directory so metadata changes (renames, creates) are durable.
/// No-op on Windows, where NTFS renames are already atomic.
pub fn sync_directory(path: &Path) -> GatewayResult<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path).map_err(|e| GatewayError::from_io(e, path))?;
        dir.sync_all().map_err(|e| GatewayError::from_io(e, path))?;
    }

    #[cfg(windows)]
    {
        let _ = path;
    }

    Ok(())
}

/// Sync the parent of `path`, logging instead of failing
pub fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = sync_directory(parent) {
            tracing::debug!(path = %parent.display(), error = %e, "directory sync skipped");
        }
    }
}

/// Check if a path is a symlink without following it
pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.is_symlink())
        .unwrap_or(false)
}

/// Copy one file and carry over its modification time
pub fn copy_file_preserving(src: &Path, dst: &Path) -> GatewayResult<u64> {
    let bytes = fs::copy(src, dst).map_err(|e| GatewayError::from_io(e, src))?;
    if let Ok(meta) = fs::metadata(src) {
        let mtime = FileTime::from_last_modification_time(&meta);
        if let Err(e) = filetime::set_file_mtime(dst, mtime) {
            tracing::debug!(path = %dst.display(), error = %e, "could not preserve mtime");
        }
    }
    Ok(bytes)
}

/// Copy a directory tree, skipping symlinks with a warning
///
/// `dst` must not exist. Returns the number of files copied. On failure the
/// partially copied tree is left for the caller to clean up.
pub fn copy_dir_safe(src: &Path, dst: &Path) -> GatewayResult<usize> {
    if is_symlink(src) {
        return Err(GatewayError::new(
            GatewayErrorKind::Io,
            src,
            "refusing to copy a symlinked directory",
        ));
    }

    fs::create_dir(dst).map_err(|e| GatewayError::from_io(e, dst))?;

    let mut copied = 0;
    let mut directories = Vec::new();

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            match e.into_io_error() {
                Some(io) => GatewayError::from_io(io, &path),
                None => GatewayError::new(GatewayErrorKind::Io, &path, "directory walk failed"),
            }
        })?;

        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| GatewayError::new(GatewayErrorKind::Io, entry.path(), "escaped copy root"))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            tracing::warn!(path = %entry.path().display(), "Skipping symlink during copy");
            continue;
        }

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(|e| GatewayError::from_io(e, &target))?;
            directories.push((entry.path().to_path_buf(), target));
        } else {
            copy_file_preserving(entry.path(), &target)?;
            copied += 1;
        }
    }

    // Directory mtimes change as children are written, so set them last
    directories.push((src.to_path_buf(), dst.to_path_buf()));
    for (from, to) in directories.iter().rev() {
        if let Ok(meta) = fs::metadata(from) {
            let _ = filetime::set_file_mtime(to, FileTime::from_last_modification_time(&meta));
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry.json");

        atomic_write(&path, b"{\"a\":1}").unwrap();
        atomic_write(&path, b"{\"a\":2}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("dir").join("test.txt");

        atomic_write(&path, b"nested").unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_copy_file_preserves_mtime() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        fs::write(&src, "content").unwrap();
        let old = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&src, old).unwrap();

        copy_file_preserving(&src, &dst).unwrap();

        let meta = fs::metadata(&dst).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), old);
    }

    #[test]
    fn test_copy_dir_safe() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("file1.txt"), "content1").unwrap();
        fs::write(src.join("sub").join("file2.txt"), "content2").unwrap();

        #[cfg(unix)]
        std::os::unix::fs::symlink(src.join("file1.txt"), src.join("link.txt")).unwrap();

        let count = copy_dir_safe(&src, &dst).unwrap();

        assert_eq!(count, 2);
        assert_eq!(fs::read_to_string(dst.join("file1.txt")).unwrap(), "content1");
        assert!(dst.join("sub").join("file2.txt").exists());
        assert!(!dst.join("link.txt").exists());
    }

    #[test]
    fn test_copy_dir_safe_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();

        let err = copy_dir_safe(&src, &dst).unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::AlreadyExists);
    }
}
