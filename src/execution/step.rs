//! Primitive filesystem steps.
//!
//! Operations expand into steps against live state right before they run.
//! Every step except [`Step::Erase`] has an inverse step, computed before the
//! step executes; undo and rollback are just more steps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::gateway::{FilesystemGateway, GatewayResult, HoldingArea};
use crate::models::file::EntryKind;
use crate::models::operation::{Operation, OperationKind};
use crate::models::plan::PlanId;
use crate::security::PathPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "step")]
pub enum Step {
    Move { from: PathBuf, to: PathBuf },
    Copy { from: PathBuf, to: PathBuf },
    CreateDirectory { path: PathBuf },
    CreateFile { path: PathBuf },
    /// Remove a directory only if nothing was put in it since
    RemoveDirIfEmpty { path: PathBuf },
    /// Move into the holding area under `entry`
    Stash { path: PathBuf, entry: String },
    /// Move a holding entry back
    Restore { entry: String, to: PathBuf },
    /// Permanent removal
    Erase { path: PathBuf, recursive: bool },
}

/// How to revert an executed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Inverse {
    /// Steps to run in order
    Steps { steps: Vec<Step> },
    Irreversible { reason: String },
}

impl Inverse {
    pub fn steps(&self) -> Option<&[Step]> {
        match self {
            Inverse::Steps { steps } => Some(steps),
            Inverse::Irreversible { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEffect {
    Applied,
    /// Nothing to do, e.g. a directory that is no longer empty
    Skipped,
}

/// Everything a step needs to run
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub policy: &'a PathPolicy,
    pub gateway: &'a dyn FilesystemGateway,
    pub holding: &'a HoldingArea,
    pub plan_id: Option<PlanId>,
}

impl Step {
    /// The step that reverts this one, `None` when it cannot be reverted
    pub fn inverse(&self) -> Option<Step> {
        match self {
            Step::Move { from, to } => Some(Step::Move {
                from: to.clone(),
                to: from.clone(),
            }),
            Step::Copy { to, .. } => Some(Step::Stash {
                path: to.clone(),
                entry: HoldingArea::new_entry_id(),
            }),
            Step::CreateDirectory { path } => Some(Step::RemoveDirIfEmpty { path: path.clone() }),
            Step::CreateFile { path } => Some(Step::Stash {
                path: path.clone(),
                entry: HoldingArea::new_entry_id(),
            }),
            Step::RemoveDirIfEmpty { path } => Some(Step::CreateDirectory { path: path.clone() }),
            Step::Stash { path, entry } => Some(Step::Restore {
                entry: entry.clone(),
                to: path.clone(),
            }),
            Step::Restore { entry, to } => Some(Step::Stash {
                path: to.clone(),
                entry: entry.clone(),
            }),
            Step::Erase { .. } => None,
        }
    }

    /// Re-check live state right before running; `Err` describes the drift
    pub fn precheck(&self, ctx: &StepContext<'_>) -> Result<(), String> {
        let gw = ctx.gateway;
        for path in self.live_paths() {
            ctx.policy.check_links(&path, gw).map_err(|e| e.to_string())?;
        }
        match self {
            Step::Move { from, to } | Step::Copy { from, to } => {
                require_present(gw, from)?;
                require_absent(gw, to)?;
                require_parent(gw, to)
            }
            Step::CreateDirectory { path } | Step::CreateFile { path } => {
                require_absent(gw, path)?;
                require_parent(gw, path)
            }
            Step::RemoveDirIfEmpty { path } => match stat_kind(gw, path)? {
                Some(EntryKind::Directory) => Ok(()),
                Some(_) => Err(format!("{} is no longer a directory", path.display())),
                None => Err(format!("{} no longer exists", path.display())),
            },
            Step::Stash { path, entry } => {
                require_present(gw, path)?;
                if ctx.holding.contains(entry) {
                    return Err(format!("holding entry {} is already in use", entry));
                }
                Ok(())
            }
            Step::Restore { entry, to } => {
                if !ctx.holding.contains(entry) {
                    return Err(format!(
                        "holding entry for {} was purged",
                        to.display()
                    ));
                }
                require_absent(gw, to)?;
                require_parent(gw, to)
            }
            Step::Erase { path, .. } => require_present(gw, path),
        }
    }

    pub fn apply(&self, ctx: &StepContext<'_>) -> GatewayResult<StepEffect> {
        let gw = ctx.gateway;
        match self {
            Step::Move { from, to } => gw.move_path(from, to)?,
            Step::Copy { from, to } => gw.copy(from, to)?,
            Step::CreateDirectory { path } => gw.create_directory(path)?,
            Step::CreateFile { path } => gw.create_file(path)?,
            Step::RemoveDirIfEmpty { path } => {
                if !gw.list(path)?.is_empty() {
                    tracing::debug!(path = %path.display(), "directory not empty, left in place");
                    return Ok(StepEffect::Skipped);
                }
                gw.delete(path, false)?
            }
            Step::Stash { path, entry } => {
                ctx.holding.stash(gw, path, entry, ctx.plan_id)?;
            }
            Step::Restore { entry, to } => ctx.holding.restore(gw, entry, to)?,
            Step::Erase { path, recursive } => gw.delete(path, *recursive)?,
        }
        Ok(StepEffect::Applied)
    }

    /// Paths inside the user's tree (holding payloads excluded)
    pub fn live_paths(&self) -> Vec<PathBuf> {
        match self {
            Step::Move { from, to } | Step::Copy { from, to } => vec![from.clone(), to.clone()],
            Step::CreateDirectory { path }
            | Step::CreateFile { path }
            | Step::RemoveDirIfEmpty { path }
            | Step::Stash { path, .. }
            | Step::Erase { path, .. } => vec![path.clone()],
            Step::Restore { to, .. } => vec![to.clone()],
        }
    }

    /// Path that must exist before the step runs
    pub fn requires(&self) -> Option<&Path> {
        match self {
            Step::Move { from, .. } | Step::Copy { from, .. } => Some(from),
            Step::RemoveDirIfEmpty { path } | Step::Stash { path, .. } | Step::Erase { path, .. } => {
                Some(path)
            }
            Step::CreateDirectory { .. } | Step::CreateFile { .. } | Step::Restore { .. } => None,
        }
    }

    /// Path that must be free before the step runs
    pub fn occupies(&self) -> Option<&Path> {
        match self {
            Step::Move { to, .. } | Step::Copy { to, .. } | Step::Restore { to, .. } => Some(to),
            Step::CreateDirectory { path } | Step::CreateFile { path } => Some(path),
            Step::RemoveDirIfEmpty { .. } | Step::Stash { .. } | Step::Erase { .. } => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Move { from, to } => write!(f, "move {} -> {}", from.display(), to.display()),
            Step::Copy { from, to } => write!(f, "copy {} -> {}", from.display(), to.display()),
            Step::CreateDirectory { path } => write!(f, "create directory {}", path.display()),
            Step::CreateFile { path } => write!(f, "create file {}", path.display()),
            Step::RemoveDirIfEmpty { path } => write!(f, "remove empty directory {}", path.display()),
            Step::Stash { path, .. } => write!(f, "hold {}", path.display()),
            Step::Restore { to, .. } => write!(f, "restore {}", to.display()),
            Step::Erase { path, .. } => write!(f, "erase {}", path.display()),
        }
    }
}

/// Expand an operation into steps against the current filesystem.
///
/// `Err` is a drift description: the filesystem no longer matches what the
/// validator saw.
pub fn expand(op: &Operation, gateway: &dyn FilesystemGateway) -> Result<Vec<Step>, String> {
    let flags = op.flags();
    let mut steps = Vec::new();
    match op.kind() {
        OperationKind::Move | OperationKind::Rename | OperationKind::Copy => {
            for (from, to) in op.transfers() {
                if flags.overwrite && stat_kind(gateway, &to)?.is_some() {
                    steps.push(Step::Stash {
                        path: to.clone(),
                        entry: HoldingArea::new_entry_id(),
                    });
                }
                if op.kind() == OperationKind::Copy {
                    steps.push(Step::Copy { from, to });
                } else {
                    steps.push(Step::Move { from, to });
                }
            }
        }
        OperationKind::Delete => {
            for path in op.sources() {
                if !flags.recursive && stat_kind(gateway, path)? == Some(EntryKind::Directory) {
                    let empty = gateway
                        .list(path)
                        .map_err(|e| e.to_string())?
                        .is_empty();
                    if !empty {
                        return Err(format!(
                            "{} is no longer empty and recursive delete was not requested",
                            path.display()
                        ));
                    }
                }
                if flags.permanent {
                    steps.push(Step::Erase {
                        path: path.clone(),
                        recursive: flags.recursive,
                    });
                } else {
                    steps.push(Step::Stash {
                        path: path.clone(),
                        entry: HoldingArea::new_entry_id(),
                    });
                }
            }
        }
        OperationKind::CreateDirectory => {
            if let Some(path) = op.destination() {
                steps.push(Step::CreateDirectory {
                    path: path.to_path_buf(),
                });
            }
        }
        OperationKind::CreateFile => {
            if let Some(path) = op.destination() {
                steps.push(Step::CreateFile {
                    path: path.to_path_buf(),
                });
            }
        }
    }
    Ok(steps)
}

fn stat_kind(gw: &dyn FilesystemGateway, path: &Path) -> Result<Option<EntryKind>, String> {
    gw.stat(path)
        .map(|stat| stat.map(|s| s.kind))
        .map_err(|e| e.to_string())
}

fn require_present(gw: &dyn FilesystemGateway, path: &Path) -> Result<(), String> {
    match stat_kind(gw, path)? {
        Some(_) => Ok(()),
        None => Err(format!("{} vanished", path.display())),
    }
}

fn require_absent(gw: &dyn FilesystemGateway, path: &Path) -> Result<(), String> {
    match stat_kind(gw, path)? {
        Some(_) => Err(format!("{} now exists", path.display())),
        None => Ok(()),
    }
}

fn require_parent(gw: &dyn FilesystemGateway, path: &Path) -> Result<(), String> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    match stat_kind(gw, parent)? {
        Some(EntryKind::Directory) => Ok(()),
        Some(_) => Err(format!("{} is not a directory", parent.display())),
        None => Err(format!("{} is missing", parent.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::LocalFs;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_inverse_pairs() {
        let mv = Step::Move {
            from: "/r/a".into(),
            to: "/r/b".into(),
        };
        assert_eq!(
            mv.inverse(),
            Some(Step::Move {
                from: "/r/b".into(),
                to: "/r/a".into()
            })
        );

        let stash = Step::Stash {
            path: "/r/a".into(),
            entry: "e1".into(),
        };
        let restore = stash.inverse().unwrap();
        assert_eq!(
            restore,
            Step::Restore {
                entry: "e1".into(),
                to: "/r/a".into()
            }
        );
        assert_eq!(restore.inverse(), Some(stash));

        let erase = Step::Erase {
            path: "/r/a".into(),
            recursive: false,
        };
        assert!(erase.inverse().is_none());
    }

    #[test]
    fn test_precheck_detects_drift() {
        let dir = tempdir().unwrap();
        let holding = HoldingArea::new(dir.path().join(".holding"), 30);
        let gateway = LocalFs::new();
        let policy = PathPolicy::new(dir.path()).unwrap();
        let ctx = StepContext {
            policy: &policy,
            gateway: &gateway,
            holding: &holding,
            plan_id: None,
        };

        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let step = Step::Move {
            from: a.clone(),
            to: b.clone(),
        };
        assert!(step.precheck(&ctx).unwrap_err().contains("vanished"));

        fs::write(&a, "a").unwrap();
        step.precheck(&ctx).unwrap();

        fs::write(&b, "b").unwrap();
        assert!(step.precheck(&ctx).unwrap_err().contains("now exists"));
    }

    #[cfg(unix)]
    #[test]
    fn test_precheck_refuses_linked_folder() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let holding = HoldingArea::new(dir.path().join(".holding"), 30);
        let gateway = LocalFs::new();
        let policy = PathPolicy::new(&root).unwrap();
        let ctx = StepContext {
            policy: &policy,
            gateway: &gateway,
            holding: &holding,
            plan_id: None,
        };

        let step = Step::Stash {
            path: root.join("link/secret.txt"),
            entry: HoldingArea::new_entry_id(),
        };
        assert!(step.precheck(&ctx).unwrap_err().contains("symbolic link"));

        let unlink = Step::Stash {
            path: root.join("link"),
            entry: HoldingArea::new_entry_id(),
        };
        unlink.precheck(&ctx).unwrap();
    }

    #[test]
    fn test_remove_dir_if_empty_skips_non_empty() {
        let dir = tempdir().unwrap();
        let holding = HoldingArea::new(dir.path().join(".holding"), 30);
        let gateway = LocalFs::new();
        let policy = PathPolicy::new(dir.path()).unwrap();
        let ctx = StepContext {
            policy: &policy,
            gateway: &gateway,
            holding: &holding,
            plan_id: None,
        };
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        fs::write(archive.join("keep.txt"), "k").unwrap();

        let step = Step::RemoveDirIfEmpty {
            path: archive.clone(),
        };
        assert_eq!(step.apply(&ctx).unwrap(), StepEffect::Skipped);
        assert!(archive.exists());

        fs::remove_file(archive.join("keep.txt")).unwrap();
        assert_eq!(step.apply(&ctx).unwrap(), StepEffect::Applied);
        assert!(!archive.exists());
    }

    #[test]
    fn test_expand_overwrite_stashes_destination_first() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let op = Operation::move_paths(vec![a.clone()], b.clone(), true).unwrap();
        let steps = expand(&op, &LocalFs::new()).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(matches!(&steps[0], Step::Stash { path, .. } if *path == b));
        assert_eq!(steps[1], Step::Move { from: a, to: b });
    }

    #[test]
    fn test_expand_delete_variants() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, "a").unwrap();
        let gateway = LocalFs::new();

        let soft = Operation::delete(vec![a.clone()], false, false).unwrap();
        assert!(matches!(&expand(&soft, &gateway).unwrap()[0], Step::Stash { .. }));

        let hard = Operation::delete(vec![a.clone()], false, true).unwrap();
        assert_eq!(
            expand(&hard, &gateway).unwrap(),
            vec![Step::Erase {
                path: a,
                recursive: false
            }]
        );

        let full = dir.path().join("full");
        fs::create_dir(&full).unwrap();
        fs::write(full.join("x"), "x").unwrap();
        let shallow = Operation::delete(vec![full], false, false).unwrap();
        assert!(expand(&shallow, &gateway).is_err());
    }
}
