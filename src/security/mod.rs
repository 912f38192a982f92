//! Path policy: the permitted root, protected system paths, and resolution of
//! untrusted path strings coming from the language model.
//!
//! Resolution is lexical. `canonicalize()` is avoided because it fails on
//! paths that do not exist yet (destinations) and behaves oddly with some
//! special characters on macOS. Symbolic links are handled separately: no
//! existing directory between the root and a path may be a link, since a
//! link can point anywhere.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::gateway::FilesystemGateway;
use crate::models::file::EntryKind;

/// Characters rejected in new file names
const RESERVED_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

const MAX_NAME_LEN: usize = 255;

/// Why an untrusted path string was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRejection {
    Empty,
    OutsideRoot(PathBuf),
    /// Inside the root but owned by the core (holding area, ledger)
    Reserved(PathBuf),
    /// Reached through a symbolic link below the root
    ThroughLink { path: PathBuf, link: PathBuf },
}

impl std::fmt::Display for PathRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathRejection::Empty => write!(f, "empty path"),
            PathRejection::OutsideRoot(path) => {
                write!(f, "{} is outside the permitted root", path.display())
            }
            PathRejection::Reserved(path) => {
                write!(f, "{} is reserved for the assistant's own state", path.display())
            }
            PathRejection::ThroughLink { path, link } => write!(
                f,
                "{} goes through the symbolic link {}, which may lead outside the permitted root",
                path.display(),
                link.display()
            ),
        }
    }
}

/// Security boundary for every path the core touches
#[derive(Debug, Clone)]
pub struct PathPolicy {
    root: PathBuf,
    protected: Vec<PathBuf>,
    reserved: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn new(root: &Path) -> Result<Self> {
        if !root.is_absolute() {
            return Err(Error::Config(format!(
                "root must be an absolute path: {}",
                root.display()
            )));
        }
        let mut protected: Vec<PathBuf> = [
            "/",
            "/System",
            "/usr",
            "/bin",
            "/sbin",
            "/etc",
            "/Library",
            "/Applications",
            "/private",
            "/var",
            "C:\\Windows",
            "C:\\Program Files",
            "C:\\Program Files (x86)",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();
        if let Some(home) = dirs::home_dir() {
            protected.push(home);
        }
        Ok(Self {
            root: normalize_path(root),
            protected,
            reserved: Vec::new(),
        })
    }

    /// Fence off `path` and everything under it
    pub fn reserve(mut self, path: &Path) -> Self {
        self.reserved.push(normalize_path(path));
        self
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        let normalized = normalize_path(path);
        self.reserved.iter().any(|r| normalized.starts_with(r))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_within_root(&self, path: &Path) -> bool {
        let normalized = normalize_path(path);
        normalized.starts_with(&self.root)
    }

    /// Whether a path must never be moved, renamed or deleted.
    ///
    /// The root itself, system directories and their direct children, and
    /// the home directory are protected. Subdirectories of the home
    /// directory are not.
    pub fn is_protected(&self, path: &Path) -> bool {
        let check = normalize_path(path);
        if check == self.root || self.is_reserved(&check) {
            return true;
        }
        let home = dirs::home_dir();

        for protected in &self.protected {
            if check == *protected {
                return true;
            }
            if protected.parent().is_none() {
                // "/" only protects itself; its children are listed explicitly
                continue;
            }
            if check.starts_with(protected) {
                if let Some(home) = &home {
                    if check.starts_with(home) {
                        continue;
                    }
                }
                if check.parent() == Some(protected.as_path()) {
                    return true;
                }
            }
        }
        false
    }

    /// First directory between the root and `path` (both excluded) that is a
    /// symbolic link. `kind_of` reports what exists at a path without
    /// following links; the walk stops at the first missing component.
    /// `path` itself may be a link: operations act on the link, not its target.
    pub fn linked_ancestor<F>(&self, path: &Path, mut kind_of: F) -> Option<PathBuf>
    where
        F: FnMut(&Path) -> Option<EntryKind>,
    {
        let normalized = normalize_path(path);
        let relative = normalized.strip_prefix(&self.root).ok()?;
        let mut components = relative.components().peekable();
        let mut current = self.root.clone();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            current.push(component);
            match kind_of(&current) {
                Some(EntryKind::Symlink) => return Some(current),
                Some(_) => {}
                None => break,
            }
        }
        None
    }

    /// [`Self::linked_ancestor`] against live state
    pub fn check_links(
        &self,
        path: &Path,
        gateway: &dyn FilesystemGateway,
    ) -> std::result::Result<(), PathRejection> {
        let link = self.linked_ancestor(path, |p| gateway.stat(p).ok().flatten().map(|s| s.kind));
        match link {
            Some(link) => Err(PathRejection::ThroughLink {
                path: normalize_path(path),
                link,
            }),
            None => Ok(()),
        }
    }

    /// Resolve a path string from an untrusted source.
    ///
    /// `~` expands to the home directory, relative paths join `cwd`, and the
    /// result is normalized and must stay inside the root.
    pub fn resolve(&self, raw: &str, cwd: &Path) -> std::result::Result<PathBuf, PathRejection> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathRejection::Empty);
        }
        let expanded = expand_home(trimmed);
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            cwd.join(expanded)
        };
        let normalized = normalize_path(&absolute);
        if !normalized.starts_with(&self.root) {
            return Err(PathRejection::OutsideRoot(normalized));
        }
        if self.is_reserved(&normalized) {
            return Err(PathRejection::Reserved(normalized));
        }
        Ok(normalized)
    }
}

/// Normalize a path lexically without filesystem access.
/// `..` never climbs above the filesystem root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(name) => normalized.push(name),
        }
    }
    normalized
}

/// Expand a leading `~` or `~/` to the home directory
pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Validate a single file name for rename and create operations
pub fn validate_file_name(name: &str) -> std::result::Result<(), String> {
    if name.trim().is_empty() {
        return Err("file name is empty".to_string());
    }
    if name == "." || name == ".." {
        return Err(format!("'{}' is not a valid file name", name));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_NAME_CHARS.contains(c)) {
        return Err(format!("file name '{}' contains '{}'", name, c));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(format!("file name '{}' contains control characters", name.escape_debug()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("file name exceeds {} bytes", MAX_NAME_LEN));
    }
    Ok(())
}
