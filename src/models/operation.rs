//! Typed filesystem operations.
//!
//! An [`Operation`] is built once (by the intent parser or by a redo) and
//! never mutated afterwards. Constructors enforce the shape rules of each
//! kind, so every `Operation` in a plan is structurally sound even before
//! validation looks at the filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Move,
    Copy,
    Rename,
    Delete,
    CreateDirectory,
    CreateFile,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Move => "move",
            OperationKind::Copy => "copy",
            OperationKind::Rename => "rename",
            OperationKind::Delete => "delete",
            OperationKind::CreateDirectory => "create_directory",
            OperationKind::CreateFile => "create_file",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationFlags {
    /// Replace an existing destination (the old one goes to the holding area)
    pub overwrite: bool,
    /// Allow deleting a non-empty directory
    pub recursive: bool,
    /// Skip the holding area; cannot be undone
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    kind: OperationKind,
    sources: Vec<PathBuf>,
    destination: Option<PathBuf>,
    flags: OperationFlags,
}

impl Operation {
    /// Move one or more sources. With several sources `destination` is the
    /// directory they land in.
    pub fn move_paths(sources: Vec<PathBuf>, destination: PathBuf, overwrite: bool) -> Result<Self> {
        Self::transfer(OperationKind::Move, sources, destination, overwrite)
    }

    pub fn copy_paths(sources: Vec<PathBuf>, destination: PathBuf, overwrite: bool) -> Result<Self> {
        Self::transfer(OperationKind::Copy, sources, destination, overwrite)
    }

    fn transfer(
        kind: OperationKind,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        overwrite: bool,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "{} needs at least one source",
                kind.as_str()
            )));
        }
        Ok(Self {
            kind,
            sources,
            destination: Some(destination),
            flags: OperationFlags {
                overwrite,
                ..Default::default()
            },
        })
    }

    /// Rename within the same parent directory
    pub fn rename(source: PathBuf, destination: PathBuf, overwrite: bool) -> Result<Self> {
        if source.parent() != destination.parent() {
            return Err(Error::InvalidOperation(format!(
                "rename must stay in {}; use move for {}",
                display_parent(&source),
                destination.display()
            )));
        }
        Ok(Self {
            kind: OperationKind::Rename,
            sources: vec![source],
            destination: Some(destination),
            flags: OperationFlags {
                overwrite,
                ..Default::default()
            },
        })
    }

    pub fn delete(sources: Vec<PathBuf>, recursive: bool, permanent: bool) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvalidOperation(
                "delete needs at least one path".to_string(),
            ));
        }
        Ok(Self {
            kind: OperationKind::Delete,
            sources,
            destination: None,
            flags: OperationFlags {
                recursive,
                permanent,
                overwrite: false,
            },
        })
    }

    pub fn create_directory(path: PathBuf) -> Self {
        Self {
            kind: OperationKind::CreateDirectory,
            sources: Vec::new(),
            destination: Some(path),
            flags: OperationFlags::default(),
        }
    }

    pub fn create_file(path: PathBuf) -> Self {
        Self {
            kind: OperationKind::CreateFile,
            sources: Vec::new(),
            destination: Some(path),
            flags: OperationFlags::default(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    pub fn flags(&self) -> OperationFlags {
        self.flags
    }

    /// (source, final target) pairs for Move, Copy and Rename
    pub fn transfers(&self) -> Vec<(PathBuf, PathBuf)> {
        let Some(destination) = &self.destination else {
            return Vec::new();
        };
        match self.kind {
            OperationKind::Move | OperationKind::Copy if self.sources.len() > 1 => self
                .sources
                .iter()
                .map(|src| {
                    let name = src.file_name().map(PathBuf::from).unwrap_or_default();
                    (src.clone(), destination.join(name))
                })
                .collect(),
            OperationKind::Move | OperationKind::Copy | OperationKind::Rename => self
                .sources
                .first()
                .map(|src| vec![(src.clone(), destination.clone())])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Paths that no longer exist at their old location afterwards
    pub fn removed_paths(&self) -> Vec<PathBuf> {
        match self.kind {
            OperationKind::Delete | OperationKind::Move | OperationKind::Rename => {
                self.sources.clone()
            }
            _ => Vec::new(),
        }
    }

    /// Paths this operation creates or replaces
    pub fn written_paths(&self) -> Vec<PathBuf> {
        match self.kind {
            OperationKind::CreateDirectory | OperationKind::CreateFile => {
                self.destination.iter().cloned().collect()
            }
            OperationKind::Delete => Vec::new(),
            _ => self.transfers().into_iter().map(|(_, dst)| dst).collect(),
        }
    }

    /// Every path read or written, used for locking and inventories
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.sources.clone();
        for written in self.written_paths() {
            if !paths.contains(&written) {
                paths.push(written);
            }
        }
        paths
    }

    /// Whether the operation can destroy data that exists before the plan runs
    pub fn is_destructive(&self) -> bool {
        match self.kind {
            OperationKind::Delete => true,
            OperationKind::Move | OperationKind::Copy | OperationKind::Rename => {
                self.flags.overwrite
            }
            _ => false,
        }
    }

    pub fn is_permanent_delete(&self) -> bool {
        self.kind == OperationKind::Delete && self.flags.permanent
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources = self
            .sources
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        match (self.kind, &self.destination) {
            (OperationKind::Delete, _) => {
                write!(f, "delete {}", sources)?;
                if self.flags.permanent {
                    write!(f, " (permanent)")?;
                }
                Ok(())
            }
            (OperationKind::CreateDirectory, Some(dst)) => write!(f, "create directory {}", dst.display()),
            (OperationKind::CreateFile, Some(dst)) => write!(f, "create file {}", dst.display()),
            (kind, Some(dst)) => {
                write!(f, "{} {} -> {}", kind.as_str(), sources, dst.display())?;
                if self.flags.overwrite {
                    write!(f, " (overwrite)")?;
                }
                Ok(())
            }
            (kind, None) => write!(f, "{} {}", kind.as_str(), sources),
        }
    }
}

fn display_parent(path: &Path) -> String {
    path.parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string())
}
