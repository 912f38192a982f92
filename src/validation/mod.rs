//! Plan Validator
//!
//! Static checks of a plan against a single filesystem snapshot and the
//! path policy, before anything is mutated. [`PlanValidator::validate`] is a
//! pure function of the plan and the current state, so validating twice
//! against unchanged state yields the same report. Applying the report to
//! the plan is a separate step.
//!
//! ## Modules
//! - `snapshot`: shadow filesystem the operations are simulated against
//! - `confirmation`: signed confirmation tokens for destructive operations

pub mod confirmation;
pub mod snapshot;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gateway::FilesystemGateway;
use crate::models::file::EntryKind;
use crate::models::issue::{IssueCode, ValidationIssue};
use crate::models::operation::{Operation, OperationKind};
use crate::models::plan::{Plan, PlanStatus};
use crate::security::{validate_file_name, PathPolicy};

use confirmation::{ConfirmationAuthority, ConfirmationChallenge};
use snapshot::{ShadowFs, MAX_SNAPSHOT_ENTRIES};

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Skip the confirmation gate (redo of a plan the user already approved)
    pub assume_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    /// Validated, AwaitingConfirmation or Failed
    pub verdict: PlanStatus,
    pub challenge: Option<ConfirmationChallenge>,
}

impl ValidationReport {
    pub fn blocking(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }
}

pub struct PlanValidator {
    policy: PathPolicy,
    gateway: Arc<dyn FilesystemGateway>,
    authority: Arc<ConfirmationAuthority>,
    max_snapshot_entries: usize,
}

/// Per-plan bookkeeping while simulating
struct Simulation {
    shadow: ShadowFs,
    /// Paths removed by earlier operations (delete targets, move sources)
    removed: Vec<(PathBuf, usize)>,
    /// Destinations written by earlier operations
    written: Vec<(PathBuf, usize)>,
    issues: Vec<ValidationIssue>,
}

impl Simulation {
    fn block(&mut self, code: IssueCode, index: usize, reason: String) {
        self.issues.push(ValidationIssue::blocking(code, Some(index), reason));
    }

    fn warn(&mut self, code: IssueCode, index: usize, reason: String) {
        self.issues.push(ValidationIssue::warning(code, Some(index), reason));
    }

    fn removed_by(&self, path: &Path) -> Option<usize> {
        self.removed
            .iter()
            .find(|(removed, _)| path.starts_with(removed))
            .map(|(_, index)| *index)
    }

    /// An earlier destination at or below `path`
    fn written_under(&self, path: &Path) -> Option<(PathBuf, usize)> {
        self.written
            .iter()
            .find(|(written, _)| written.starts_with(path))
            .cloned()
    }

    fn written_by(&self, path: &Path) -> Option<usize> {
        self.written
            .iter()
            .find(|(written, _)| written == path)
            .map(|(_, index)| *index)
    }
}

impl PlanValidator {
    pub fn new(
        policy: PathPolicy,
        gateway: Arc<dyn FilesystemGateway>,
        authority: Arc<ConfirmationAuthority>,
    ) -> Self {
        Self {
            policy,
            gateway,
            authority,
            max_snapshot_entries: MAX_SNAPSHOT_ENTRIES,
        }
    }

    pub fn with_snapshot_limit(mut self, max_entries: usize) -> Self {
        self.max_snapshot_entries = max_entries;
        self
    }

    pub fn validate(&self, plan: &Plan, options: ValidateOptions) -> ValidationReport {
        let shadow = ShadowFs::capture(
            self.gateway.as_ref(),
            plan,
            self.policy.root(),
            self.max_snapshot_entries,
        );
        let mut sim = Simulation {
            shadow,
            removed: Vec::new(),
            written: Vec::new(),
            issues: Vec::new(),
        };

        let already_flagged = plan.parse_issues.iter().any(|i| i.code == IssueCode::EmptyPlan);
        if plan.operations().is_empty() && !already_flagged {
            sim.issues.push(ValidationIssue::warning(
                IssueCode::EmptyPlan,
                None,
                "the plan has no operations",
            ));
        }

        for (index, op) in plan.operations().iter().enumerate() {
            match op.kind() {
                OperationKind::Move | OperationKind::Copy | OperationKind::Rename => {
                    self.check_transfer(&mut sim, index, op)
                }
                OperationKind::Delete => self.check_delete(&mut sim, index, op),
                OperationKind::CreateDirectory | OperationKind::CreateFile => {
                    self.check_create(&mut sim, index, op)
                }
            }
        }

        if sim.shadow.is_truncated() {
            sim.issues.push(ValidationIssue::warning(
                IssueCode::ListingTruncated,
                None,
                "some directories were too large to inspect completely",
            ));
        }

        let destructive = plan.destructive_indices();
        let mut challenge = None;
        if !destructive.is_empty() && !options.assume_confirmed && !self.authority.verify(plan) {
            for index in &destructive {
                let reason = match plan.operations().get(*index) {
                    Some(op) => format!("'{}' needs confirmation", op),
                    None => "operation needs confirmation".to_string(),
                };
                sim.block(IssueCode::DestructiveWithoutConfirmation, *index, reason);
            }
            challenge = Some(ConfirmationChallenge::for_plan(plan));
        }

        let verdict = verdict_for(&sim.issues);
        if verdict != PlanStatus::AwaitingConfirmation {
            challenge = None;
        }

        tracing::debug!(
            plan_id = plan.id.0,
            issues = sim.issues.len(),
            verdict = %verdict,
            "Plan validated"
        );

        ValidationReport {
            issues: sim.issues,
            verdict,
            challenge,
        }
    }

    /// Validate and move the plan to the verdict's status
    pub fn validate_and_apply(&self, plan: &mut Plan, options: ValidateOptions) -> Result<ValidationReport> {
        let report = self.validate(plan, options);
        apply(plan, &report)?;
        Ok(report)
    }

    fn check_in_root(&self, sim: &mut Simulation, index: usize, path: &Path) -> bool {
        if self.policy.is_reserved(path) {
            sim.block(
                IssueCode::ProtectedPath,
                index,
                format!("{} is reserved", path.display()),
            );
            false
        } else if self.policy.is_within_root(path) {
            let link = self
                .policy
                .linked_ancestor(path, |p| sim.shadow.get(p).map(|node| node.kind));
            match link {
                Some(link) => {
                    sim.block(
                        IssueCode::PathOutsideRoot,
                        index,
                        format!("{} goes through the symbolic link {}", path.display(), link.display()),
                    );
                    false
                }
                None => true,
            }
        } else {
            sim.block(
                IssueCode::PathOutsideRoot,
                index,
                format!("{} is outside {}", path.display(), self.policy.root().display()),
            );
            false
        }
    }

    fn check_parent(&self, sim: &mut Simulation, index: usize, path: &Path) -> bool {
        let Some(parent) = path.parent() else {
            sim.block(IssueCode::InvalidOperation, index, format!("{} has no parent", path.display()));
            return false;
        };
        match sim.shadow.get(parent) {
            None => {
                sim.block(
                    IssueCode::PathNotFound,
                    index,
                    format!("folder {} does not exist", parent.display()),
                );
                false
            }
            Some(node) if node.kind != EntryKind::Directory => {
                sim.block(
                    IssueCode::InvalidOperation,
                    index,
                    format!("{} is not a folder", parent.display()),
                );
                false
            }
            Some(node) if node.readonly => {
                sim.block(
                    IssueCode::PermissionDenied,
                    index,
                    format!("folder {} is read-only", parent.display()),
                );
                false
            }
            Some(_) => true,
        }
    }

    fn check_removable_parent(&self, sim: &mut Simulation, index: usize, path: &Path) -> bool {
        let readonly = path
            .parent()
            .and_then(|p| sim.shadow.get(p))
            .map(|n| n.readonly)
            .unwrap_or(false);
        if readonly {
            sim.block(
                IssueCode::PermissionDenied,
                index,
                format!("cannot remove {} from a read-only folder", path.display()),
            );
        }
        !readonly
    }

    fn check_conflict(&self, sim: &mut Simulation, index: usize, path: &Path) -> bool {
        if let Some(earlier) = sim.removed_by(path) {
            sim.block(
                IssueCode::IntraPlanConflict,
                index,
                format!("{} was already removed by operation {}", path.display(), earlier + 1),
            );
            return false;
        }
        true
    }

    fn check_new_name(&self, sim: &mut Simulation, index: usize, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match validate_file_name(&name) {
            Ok(()) => true,
            Err(reason) => {
                sim.block(IssueCode::InvalidOperation, index, reason);
                false
            }
        }
    }

    fn check_transfer(&self, sim: &mut Simulation, index: usize, op: &Operation) {
        let kind = op.kind();
        let overwrite = op.flags().overwrite;
        let verb = kind.as_str();

        for (src, dst) in op.transfers() {
            let in_root = self.check_in_root(sim, index, &src) & self.check_in_root(sim, index, &dst);
            if !in_root {
                continue;
            }
            if kind != OperationKind::Copy && self.policy.is_protected(&src) {
                sim.block(
                    IssueCode::ProtectedPath,
                    index,
                    format!("{} is protected", src.display()),
                );
                continue;
            }
            if self.policy.is_protected(&dst) {
                sim.block(
                    IssueCode::ProtectedPath,
                    index,
                    format!("{} is protected", dst.display()),
                );
                continue;
            }
            if !(self.check_conflict(sim, index, &src) && self.check_conflict(sim, index, &dst)) {
                continue;
            }
            if let Some(earlier) = sim.written_by(&dst) {
                sim.block(
                    IssueCode::IntraPlanConflict,
                    index,
                    format!("operation {} already writes {}", earlier + 1, dst.display()),
                );
                continue;
            }
            if kind == OperationKind::Rename && src.parent() != dst.parent() {
                sim.block(
                    IssueCode::InvalidOperation,
                    index,
                    format!("rename cannot move {} to another folder", src.display()),
                );
                continue;
            }

            let Some(node) = sim.shadow.get(&src) else {
                sim.block(
                    IssueCode::PathNotFound,
                    index,
                    format!("{} does not exist", src.display()),
                );
                continue;
            };
            if src == dst {
                sim.block(
                    IssueCode::InvalidOperation,
                    index,
                    format!("cannot {} {} onto itself", verb, src.display()),
                );
                continue;
            }
            if dst.starts_with(&src) {
                sim.block(
                    IssueCode::InvalidOperation,
                    index,
                    format!("cannot {} {} into itself", verb, src.display()),
                );
                continue;
            }
            if node.kind == EntryKind::Symlink {
                sim.warn(
                    IssueCode::SymlinkSource,
                    index,
                    format!("{} is a symbolic link; the link itself is {}d", src.display(), verb),
                );
            }
            if !self.check_new_name(sim, index, &dst) || !self.check_parent(sim, index, &dst) {
                continue;
            }
            if kind != OperationKind::Copy && !self.check_removable_parent(sim, index, &src) {
                continue;
            }

            if sim.shadow.exists(&dst) {
                if !overwrite {
                    sim.block(
                        IssueCode::DestinationExists,
                        index,
                        format!("{} already exists", dst.display()),
                    );
                    continue;
                }
                if src.starts_with(&dst) {
                    sim.block(
                        IssueCode::InvalidOperation,
                        index,
                        format!("cannot replace {} with something inside it", dst.display()),
                    );
                    continue;
                }
                sim.warn(
                    IssueCode::OverwriteEnabled,
                    index,
                    format!("{} will be replaced (the old one is kept in the holding area)", dst.display()),
                );
                sim.shadow.remove(&dst);
            }

            if kind == OperationKind::Copy {
                sim.shadow.copy(&src, &dst);
            } else {
                sim.shadow.rename(&src, &dst);
                sim.removed.push((src.clone(), index));
            }
            sim.written.push((dst, index));
        }
    }

    fn check_delete(&self, sim: &mut Simulation, index: usize, op: &Operation) {
        let flags = op.flags();
        for src in op.sources() {
            if !self.check_in_root(sim, index, src) {
                continue;
            }
            if self.policy.is_protected(src) {
                sim.block(
                    IssueCode::ProtectedPath,
                    index,
                    format!("{} is protected", src.display()),
                );
                continue;
            }
            if !self.check_conflict(sim, index, src) {
                continue;
            }
            let Some(node) = sim.shadow.get(src) else {
                sim.block(
                    IssueCode::PathNotFound,
                    index,
                    format!("{} does not exist", src.display()),
                );
                continue;
            };
            if node.kind == EntryKind::Directory && !flags.recursive && sim.shadow.has_children(src) {
                sim.block(
                    IssueCode::InvalidOperation,
                    index,
                    format!("folder {} is not empty", src.display()),
                );
                continue;
            }
            if !self.check_removable_parent(sim, index, src) {
                continue;
            }
            if let Some((written, earlier)) = sim.written_under(src) {
                sim.warn(
                    IssueCode::IntraPlanConflict,
                    index,
                    format!(
                        "deleting {} discards {}, written by operation {}",
                        src.display(),
                        written.display(),
                        earlier + 1
                    ),
                );
            }
            sim.shadow.remove(src);
            sim.removed.push((src.clone(), index));
        }

        if flags.permanent {
            sim.warn(
                IssueCode::IrreversibleDelete,
                index,
                "permanent delete skips the holding area and cannot be undone".to_string(),
            );
        }
    }

    fn check_create(&self, sim: &mut Simulation, index: usize, op: &Operation) {
        let Some(path) = op.destination() else {
            sim.block(IssueCode::MissingField, index, "no path to create".to_string());
            return;
        };
        if !self.check_in_root(sim, index, path) || !self.check_conflict(sim, index, path) {
            return;
        }
        if let Some(earlier) = sim.written_by(path) {
            sim.block(
                IssueCode::IntraPlanConflict,
                index,
                format!("operation {} already writes {}", earlier + 1, path.display()),
            );
            return;
        }
        if sim.shadow.exists(path) {
            sim.block(
                IssueCode::DestinationExists,
                index,
                format!("{} already exists", path.display()),
            );
            return;
        }
        if !self.check_new_name(sim, index, path) || !self.check_parent(sim, index, path) {
            return;
        }
        let kind = if op.kind() == OperationKind::CreateDirectory {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        sim.shadow.insert(path, kind);
        sim.written.push((path.to_path_buf(), index));
    }
}

fn verdict_for(issues: &[ValidationIssue]) -> PlanStatus {
    let mut blocking = issues.iter().filter(|i| i.is_blocking()).peekable();
    if blocking.peek().is_none() {
        return PlanStatus::Validated;
    }
    if blocking.all(|i| i.code == IssueCode::DestructiveWithoutConfirmation) {
        PlanStatus::AwaitingConfirmation
    } else {
        PlanStatus::Failed
    }
}

/// Record a report on the plan and move it to the verdict's status
pub fn apply(plan: &mut Plan, report: &ValidationReport) -> Result<()> {
    if !matches!(
        plan.status(),
        PlanStatus::Draft | PlanStatus::AwaitingConfirmation
    ) {
        return Err(Error::InvalidState(format!(
            "plan {} is {} and cannot be validated again",
            plan.id,
            plan.status()
        )));
    }
    plan.validation_issues = report.issues.clone();
    plan.transition(report.verdict)
}
