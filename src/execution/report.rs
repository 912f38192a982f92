use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::step::Step;
use crate::gateway::{FilesystemGateway, GatewayErrorKind};
use crate::models::file::EntryKind;
use crate::models::operation::Operation;
use crate::models::plan::PlanId;

/// What went wrong with the failing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "kind")]
pub enum FailureKind {
    Gateway(GatewayErrorKind),
    /// Live state no longer matched the validated plan
    StateDrift,
    Cancelled,
    /// The ledger could not record the operation
    Ledger,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Gateway(kind) => kind.as_str(),
            FailureKind::StateDrift => "state_drift",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Ledger => "ledger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum RollbackOutcome {
    Reverted,
    /// Nothing to undo, e.g. a directory that now has other contents
    Skipped,
    Failed { reason: String },
    Irreversible { reason: String },
}

/// One attempted inverse during rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackStep {
    pub operation_index: usize,
    pub step: Option<Step>,
    pub outcome: RollbackOutcome,
}

impl RollbackStep {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RollbackOutcome::Reverted | RollbackOutcome::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEntry {
    pub path: PathBuf,
    pub before: Option<EntryKind>,
    pub after: Option<EntryKind>,
}

impl InventoryEntry {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Before/after view of every path a plan touches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInventory {
    pub entries: Vec<InventoryEntry>,
}

impl PathInventory {
    /// Record the current kind of each path as its "before" state
    pub fn capture(gateway: &dyn FilesystemGateway, paths: &[PathBuf]) -> Self {
        let entries = paths
            .iter()
            .map(|path| {
                let kind = current_kind(gateway, path);
                InventoryEntry {
                    path: path.clone(),
                    before: kind,
                    after: kind,
                }
            })
            .collect();
        Self { entries }
    }

    /// Fill in "after" from the current filesystem
    pub fn refresh(&mut self, gateway: &dyn FilesystemGateway) {
        for entry in &mut self.entries {
            entry.after = current_kind(gateway, &entry.path);
        }
    }

    pub fn changed(&self) -> impl Iterator<Item = &InventoryEntry> {
        self.entries.iter().filter(|e| e.changed())
    }
}

fn current_kind(gateway: &dyn FilesystemGateway, path: &Path) -> Option<EntryKind> {
    match gateway.stat(path) {
        Ok(stat) => stat.map(|s| s.kind),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "inventory stat failed");
            None
        }
    }
}

/// Full account of a failed execution, undo or redo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub plan_id: PlanId,
    pub failed_index: usize,
    pub failed_operation: Option<Operation>,
    pub kind: FailureKind,
    pub reason: String,
    /// Operations that had fully completed before the failure
    pub completed: Vec<usize>,
    pub rollback: Vec<RollbackStep>,
    pub inventory: PathInventory,
}

impl FailureReport {
    pub fn rollback_complete(&self) -> bool {
        self.rollback.iter().all(|s| s.succeeded())
    }

    /// Operations whose inverse steps all succeeded
    pub fn reverted(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.rollback.iter().map(|s| s.operation_index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .filter(|index| {
                self.rollback
                    .iter()
                    .filter(|s| s.operation_index == *index)
                    .all(|s| s.succeeded())
            })
            .collect()
    }

    pub fn failed_rollbacks(&self) -> impl Iterator<Item = &RollbackStep> {
        self.rollback.iter().filter(|s| !s.succeeded())
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plan {} failed at operation {} [{}]: {}",
            self.plan_id,
            self.failed_index + 1,
            self.kind.as_str(),
            self.reason
        )?;
        let failed = self.failed_rollbacks().count();
        if failed > 0 {
            write!(f, "; {} inverse step(s) could not be applied", failed)?;
        } else if !self.rollback.is_empty() {
            write!(f, "; all changes were reverted")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(rollback: Vec<RollbackStep>) -> FailureReport {
        FailureReport {
            plan_id: PlanId(3),
            failed_index: 1,
            failed_operation: None,
            kind: FailureKind::Gateway(GatewayErrorKind::PermissionDenied),
            reason: "denied".to_string(),
            completed: vec![0],
            rollback,
            inventory: PathInventory::default(),
        }
    }

    #[test]
    fn test_reverted_requires_every_step() {
        let report = report(vec![
            RollbackStep {
                operation_index: 0,
                step: None,
                outcome: RollbackOutcome::Reverted,
            },
            RollbackStep {
                operation_index: 2,
                step: None,
                outcome: RollbackOutcome::Reverted,
            },
            RollbackStep {
                operation_index: 2,
                step: None,
                outcome: RollbackOutcome::Failed {
                    reason: "busy".to_string(),
                },
            },
        ]);
        assert_eq!(report.reverted(), vec![0]);
        assert!(!report.rollback_complete());
        assert!(report.to_string().contains("1 inverse step(s) could not be applied"));
    }

    #[test]
    fn test_display_complete_rollback() {
        let report = report(vec![RollbackStep {
            operation_index: 0,
            step: None,
            outcome: RollbackOutcome::Skipped,
        }]);
        assert!(report.rollback_complete());
        assert_eq!(
            report.to_string(),
            "plan #3 failed at operation 2 [permission_denied]: denied; all changes were reverted"
        );
    }
}
