use std::fs::{self, OpenOptions};
use std::path::Path;

use super::io::{copy_dir_safe, copy_file_preserving, sync_parent};
use super::{FilesystemGateway, GatewayError, GatewayErrorKind, GatewayResult};
use crate::models::file::{EntryKind, FileEntry, PathStat};

/// Gateway over the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }

    fn require_absent(path: &Path) -> GatewayResult<()> {
        match fs::symlink_metadata(path) {
            Ok(_) => Err(GatewayError::already_exists(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::from_io(e, path)),
        }
    }

    fn require_present(path: &Path) -> GatewayResult<fs::Metadata> {
        fs::symlink_metadata(path).map_err(|e| GatewayError::from_io(e, path))
    }

    fn copy_any(from: &Path, to: &Path, meta: &fs::Metadata) -> GatewayResult<()> {
        let result = if meta.is_dir() {
            copy_dir_safe(from, to).map(|_| ())
        } else {
            copy_file_preserving(from, to).map(|_| ())
        };

        if let Err(e) = result {
            remove_partial(to);
            return Err(e);
        }
        Ok(())
    }

    /// Copy then delete, used when `rename` crosses filesystems
    pub(crate) fn move_by_copy(&self, from: &Path, to: &Path) -> GatewayResult<()> {
        let meta = Self::require_present(from)?;
        Self::copy_any(from, to, &meta).map_err(|e| {
            GatewayError::new(
                GatewayErrorKind::CrossDevice,
                from,
                format!("cross-device move to {} failed: {}", to.display(), e.message),
            )
        })?;

        let removed = if meta.is_dir() {
            fs::remove_dir_all(from)
        } else {
            fs::remove_file(from)
        };
        if let Err(e) = removed {
            if meta.is_dir() {
                // remove_dir_all may have deleted part of the source; the copy is the only full tree
                tracing::warn!(from = %from.display(), to = %to.display(), "source partially removed, keeping copy");
            } else {
                remove_partial(to);
            }
            return Err(GatewayError::new(
                GatewayErrorKind::CrossDevice,
                from,
                format!("cross-device move could not remove source: {}", e),
            ));
        }

        sync_parent(to);
        Ok(())
    }
}

fn remove_partial(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "Failed to clean up partial copy");
    }
}

impl FilesystemGateway for LocalFs {
    fn list(&self, path: &Path) -> GatewayResult<Vec<FileEntry>> {
        let read = fs::read_dir(path).map_err(|e| GatewayError::from_io(e, path))?;
        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| GatewayError::from_io(e, path))?;
            match FileEntry::from_path(&entry.path()) {
                Ok(file) => entries.push(file),
                // Entry vanished between readdir and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(GatewayError::from_io(e, &entry.path())),
            }
        }
        entries.sort_by(|a, b| {
            b.is_dir()
                .cmp(&a.is_dir())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> GatewayResult<Option<PathStat>> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(PathStat::from_metadata(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatewayError::from_io(e, path)),
        }
    }

    fn move_path(&self, from: &Path, to: &Path) -> GatewayResult<()> {
        Self::require_present(from)?;
        Self::require_absent(to)?;

        match fs::rename(from, to) {
            Ok(()) => {
                sync_parent(to);
                Ok(())
            }
            Err(e) => {
                let err = GatewayError::from_io(e, from);
                if err.is_cross_device() {
                    tracing::debug!(from = %from.display(), to = %to.display(), "rename crossed devices, copying");
                    self.move_by_copy(from, to)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn copy(&self, from: &Path, to: &Path) -> GatewayResult<()> {
        let meta = Self::require_present(from)?;
        Self::require_absent(to)?;
        Self::copy_any(from, to, &meta)?;
        sync_parent(to);
        Ok(())
    }

    fn delete(&self, path: &Path, recursive: bool) -> GatewayResult<()> {
        let meta = Self::require_present(path)?;
        let result = if EntryKind::from_metadata(&meta) == EntryKind::Directory {
            if recursive {
                fs::remove_dir_all(path)
            } else {
                fs::remove_dir(path)
            }
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| GatewayError::from_io(e, path))?;
        sync_parent(path);
        Ok(())
    }

    fn create_directory(&self, path: &Path) -> GatewayResult<()> {
        fs::create_dir(path).map_err(|e| GatewayError::from_io(e, path))?;
        sync_parent(path);
        Ok(())
    }

    fn create_file(&self, path: &Path) -> GatewayResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| GatewayError::from_io(e, path))?;
        sync_parent(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_list_sorts_directories_first() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("A.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("zeta")).unwrap();

        let names: Vec<String> = LocalFs::new()
            .list(dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["zeta", "A.txt", "b.txt"]);
    }

    #[test]
    fn test_stat_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(LocalFs::new().stat(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn test_move_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let err = LocalFs::new().move_path(&a, &b).unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&b).unwrap(), "b");
    }

    #[test]
    fn test_move_missing_source() {
        let dir = tempdir().unwrap();
        let err = LocalFs::new()
            .move_path(&dir.path().join("gone"), &dir.path().join("x"))
            .unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::PathNotFound);
    }

    #[test]
    fn test_move_by_copy_moves_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("project");
        fs::create_dir_all(src.join("docs")).unwrap();
        fs::write(src.join("docs").join("readme.md"), "hi").unwrap();
        let dst = dir.path().join("moved");

        LocalFs::new().move_by_copy(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(dst.join("docs").join("readme.md")).unwrap(), "hi");
    }

    #[test]
    fn test_copy_directory_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("photos");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("cat.jpg"), "meow").unwrap();

        let gateway = LocalFs::new();
        gateway.copy(&src, &dir.path().join("backup")).unwrap();

        assert!(src.join("cat.jpg").exists());
        assert!(dir.path().join("backup").join("cat.jpg").exists());
    }

    #[test]
    fn test_delete_non_empty_requires_recursive() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("full");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("x"), "x").unwrap();

        let gateway = LocalFs::new();
        assert!(gateway.delete(&sub, false).is_err());
        assert!(sub.exists());
        gateway.delete(&sub, true).unwrap();
        assert!(!sub.exists());
    }

    #[test]
    fn test_create_is_never_a_silent_noop() {
        let dir = tempdir().unwrap();
        let gateway = LocalFs::new();
        let sub = dir.path().join("archive");

        gateway.create_directory(&sub).unwrap();
        let err = gateway.create_directory(&sub).unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::AlreadyExists);

        let file = sub.join("notes.txt");
        gateway.create_file(&file).unwrap();
        assert_eq!(
            gateway.create_file(&file).unwrap_err().kind,
            GatewayErrorKind::AlreadyExists
        );

        let err = gateway.delete(&dir.path().join("missing"), false).unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::PathNotFound);
    }
}
