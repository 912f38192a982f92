//! Shadow filesystem for validating plans without touching real storage.
//!
//! The snapshot is taken once, at the start of validation: every path a
//! plan references, their ancestors, and the contents of directories that
//! are moved, copied or deleted. Operations are then simulated against it so
//! later operations see the effects of earlier ones.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::gateway::FilesystemGateway;
use crate::models::file::EntryKind;
use crate::models::operation::OperationKind;
use crate::models::plan::Plan;

/// Default cap on entries captured from directory walks
pub const MAX_SNAPSHOT_ENTRIES: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowNode {
    pub kind: EntryKind,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ShadowFs {
    nodes: BTreeMap<PathBuf, ShadowNode>,
    truncated: bool,
}

impl ShadowFs {
    /// Snapshot everything `plan` can observe
    pub fn capture(gateway: &dyn FilesystemGateway, plan: &Plan, root: &Path, max_entries: usize) -> Self {
        let mut shadow = Self::default();
        let mut budget = max_entries;

        let mut referenced: Vec<PathBuf> = Vec::new();
        let mut walk: Vec<PathBuf> = Vec::new();
        for op in plan.operations() {
            for path in op.touched_paths() {
                referenced.push(path);
            }
            if let Some(dest) = op.destination() {
                referenced.push(dest.to_path_buf());
            }
            if matches!(
                op.kind(),
                OperationKind::Move | OperationKind::Copy | OperationKind::Rename | OperationKind::Delete
            ) {
                walk.extend(op.sources().iter().cloned());
            }
        }

        for path in &referenced {
            shadow.stat_into(gateway, path);
            let mut ancestor = path.parent();
            while let Some(dir) = ancestor {
                if shadow.nodes.contains_key(dir) {
                    break;
                }
                shadow.stat_into(gateway, dir);
                if dir == root {
                    break;
                }
                ancestor = dir.parent();
            }
        }

        for dir in &walk {
            if shadow.is_dir(dir) {
                shadow.walk_into(gateway, dir, &mut budget);
            }
        }

        shadow
    }

    fn stat_into(&mut self, gateway: &dyn FilesystemGateway, path: &Path) {
        match gateway.stat(path) {
            Ok(Some(stat)) => {
                self.nodes.insert(
                    path.to_path_buf(),
                    ShadowNode {
                        kind: stat.kind,
                        readonly: stat.is_readonly,
                    },
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "snapshot stat failed"),
        }
    }

    fn walk_into(&mut self, gateway: &dyn FilesystemGateway, dir: &Path, budget: &mut usize) {
        let entries = match gateway.list(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "snapshot listing failed");
                return;
            }
        };
        for entry in entries {
            if *budget == 0 {
                self.truncated = true;
                return;
            }
            *budget -= 1;
            self.nodes.insert(
                entry.path.clone(),
                ShadowNode {
                    kind: entry.kind,
                    readonly: false,
                },
            );
            if entry.kind == EntryKind::Directory {
                self.walk_into(gateway, &entry.path, budget);
            }
        }
    }

    /// Whether a walk hit the entry cap
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn get(&self, path: &Path) -> Option<ShadowNode> {
        self.nodes.get(path).copied()
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn is_dir(&self, path: &Path) -> bool {
        self.get(path).map(|n| n.kind == EntryKind::Directory).unwrap_or(false)
    }

    fn subtree(&self, path: &Path) -> Vec<PathBuf> {
        self.nodes
            .range(path.to_path_buf()..)
            .take_while(|(p, _)| p.starts_with(path))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Whether anything is known to live under `path`
    pub fn has_children(&self, path: &Path) -> bool {
        self.subtree(path).len() > 1
    }

    pub fn remove(&mut self, path: &Path) {
        for p in self.subtree(path) {
            self.nodes.remove(&p);
        }
    }

    pub fn insert(&mut self, path: &Path, kind: EntryKind) {
        self.nodes.insert(
            path.to_path_buf(),
            ShadowNode {
                kind,
                readonly: false,
            },
        );
    }

    pub fn copy(&mut self, from: &Path, to: &Path) {
        for p in self.subtree(from) {
            let Ok(relative) = p.strip_prefix(from) else {
                continue;
            };
            if let Some(node) = self.get(&p) {
                let target = if relative.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(relative)
                };
                self.nodes.insert(target, ShadowNode { readonly: false, ..node });
            }
        }
    }

    pub fn rename(&mut self, from: &Path, to: &Path) {
        self.copy(from, to);
        self.remove(from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::LocalFs;
    use crate::models::operation::Operation;
    use crate::models::plan::{PlanId, Provenance};
    use chrono::Utc;
    use std::fs;
    use tempfile::tempdir;

    fn plan(ops: Vec<Operation>) -> Plan {
        Plan::new(
            PlanId(1),
            ops,
            Provenance {
                utterance: String::new(),
                raw_response: String::new(),
                model: "scripted".to_string(),
                generated_at: Utc::now(),
                working_directory: PathBuf::from("/"),
                replay_of: None,
            },
        )
    }

    #[test]
    fn test_capture_walks_moved_directories() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("project/src")).unwrap();
        fs::write(root.join("project/src/main.rs"), "fn main() {}").unwrap();

        let plan = plan(vec![Operation::move_paths(
            vec![root.join("project")],
            root.join("archive"),
            false,
        )
        .unwrap()]);
        let mut shadow = ShadowFs::capture(&LocalFs::new(), &plan, root, MAX_SNAPSHOT_ENTRIES);

        assert!(shadow.is_dir(&root.join("project")));
        assert!(shadow.exists(&root.join("project/src/main.rs")));
        assert!(!shadow.exists(&root.join("archive")));
        assert!(shadow.is_dir(root));

        shadow.rename(&root.join("project"), &root.join("archive"));
        assert!(shadow.exists(&root.join("archive/src/main.rs")));
        assert!(!shadow.exists(&root.join("project")));
    }

    #[test]
    fn test_subtree_does_not_include_siblings_with_shared_prefix() {
        let mut shadow = ShadowFs::default();
        shadow.insert(Path::new("/r/a"), EntryKind::Directory);
        shadow.insert(Path::new("/r/a/x"), EntryKind::File);
        shadow.insert(Path::new("/r/a b"), EntryKind::File);
        shadow.insert(Path::new("/r/ab"), EntryKind::File);

        assert!(shadow.has_children(Path::new("/r/a")));
        shadow.remove(Path::new("/r/a"));
        assert!(shadow.exists(Path::new("/r/a b")));
        assert!(shadow.exists(Path::new("/r/ab")));
        assert!(!shadow.exists(Path::new("/r/a/x")));
    }

    #[test]
    fn test_walk_budget_marks_truncation() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("many")).unwrap();
        for i in 0..5 {
            fs::write(root.join("many").join(format!("{}.txt", i)), "x").unwrap();
        }
        let plan = plan(vec![Operation::delete(vec![root.join("many")], true, false).unwrap()]);
        let shadow = ShadowFs::capture(&LocalFs::new(), &plan, root, 3);
        assert!(shadow.is_truncated());
    }
}
