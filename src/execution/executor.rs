//! Execution Engine
//!
//! Runs a validated plan operation by operation, in list order. Each
//! operation expands into primitive steps; every step is re-checked against
//! live state and has its inverse computed before it runs. A record is
//! handed to the ledger as soon as an operation completes.
//!
//! On failure the completed steps of the failing operation, then the earlier
//! operations, are reverted in reverse order. Rollback is best effort: every
//! inverse is attempted and its outcome reported.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::report::{
    FailureKind, FailureReport, PathInventory, RollbackOutcome, RollbackStep,
};
use super::step::{expand, Inverse, Step, StepContext, StepEffect};
use super::RecordSink;
use crate::error::{Error, Result};
use crate::gateway::{FilesystemGateway, HoldingArea};
use crate::models::operation::Operation;
use crate::models::plan::{Plan, PlanId, PlanStatus};
use crate::models::record::{ExecutionRecord, RecordOutcome};
use crate::security::PathPolicy;
use crate::validation::confirmation::{ConfirmationAuthority, ConfirmationChallenge};

/// Result of a completed plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub plan_id: PlanId,
    pub status: PlanStatus,
    pub records: Vec<ExecutionRecord>,
}

/// A step that ran, with the step that reverts it
#[derive(Debug, Clone)]
struct Completed {
    operation_index: usize,
    step: Step,
    inverse: Option<Step>,
}

#[derive(Debug)]
struct StepFailure {
    kind: FailureKind,
    reason: String,
}

pub struct ExecutionEngine {
    policy: PathPolicy,
    gateway: Arc<dyn FilesystemGateway>,
    holding: Arc<HoldingArea>,
    authority: Arc<ConfirmationAuthority>,
}

impl ExecutionEngine {
    pub fn new(
        policy: PathPolicy,
        gateway: Arc<dyn FilesystemGateway>,
        holding: Arc<HoldingArea>,
        authority: Arc<ConfirmationAuthority>,
    ) -> Self {
        Self {
            policy,
            gateway,
            holding,
            authority,
        }
    }

    pub fn gateway(&self) -> &dyn FilesystemGateway {
        self.gateway.as_ref()
    }

    pub fn holding(&self) -> &HoldingArea {
        &self.holding
    }

    fn context(&self, plan_id: PlanId) -> StepContext<'_> {
        StepContext {
            policy: &self.policy,
            gateway: self.gateway.as_ref(),
            holding: &self.holding,
            plan_id: Some(plan_id),
        }
    }

    /// Execute a validated plan.
    ///
    /// Cancellation is honoured between operations and triggers rollback.
    pub fn execute(
        &self,
        plan: &mut Plan,
        sink: &dyn RecordSink,
        cancel: &CancellationToken,
    ) -> Result<ExecutionSummary> {
        if plan.status() != PlanStatus::Validated {
            return Err(Error::InvalidState(format!(
                "plan {} is {}, only validated plans can run",
                plan.id,
                plan.status()
            )));
        }
        if !plan.destructive_indices().is_empty() && !self.authority.verify(plan) {
            return Err(Error::ConfirmationRequired {
                plan_id: plan.id,
                challenge: ConfirmationChallenge::for_plan(plan),
            });
        }

        plan.transition(PlanStatus::Executing)?;
        if let Err(e) = sink.plan_started(plan) {
            plan.transition(PlanStatus::Failed)?;
            return Err(e);
        }

        tracing::info!(plan_id = plan.id.0, operations = plan.operations().len(), "Executing plan");

        let ctx = self.context(plan.id);
        let mut inventory = PathInventory::capture(self.gateway(), &plan.touched_paths());
        let mut records: Vec<ExecutionRecord> = Vec::new();
        let operations = plan.operations().to_vec();

        for (index, op) in operations.iter().enumerate() {
            if cancel.is_cancelled() {
                let failure = StepFailure {
                    kind: FailureKind::Cancelled,
                    reason: "cancelled before the operation started".to_string(),
                };
                return self.fail(plan, sink, index, op, failure, Vec::new(), records, inventory);
            }

            let steps = match expand(op, self.gateway()) {
                Ok(steps) => steps,
                Err(reason) => {
                    let failure = StepFailure {
                        kind: FailureKind::StateDrift,
                        reason,
                    };
                    return self.fail(plan, sink, index, op, failure, Vec::new(), records, inventory);
                }
            };

            let mut done = Vec::new();
            if let Err(failure) = run_forward(&ctx, index, &steps, &mut done) {
                return self.fail(plan, sink, index, op, failure, done, records, inventory);
            }

            let record = ExecutionRecord {
                plan_id: plan.id,
                operation_index: index,
                operation: op.clone(),
                steps: done.iter().map(|c| c.step.clone()).collect(),
                inverse: inverse_of(&done),
                outcome: RecordOutcome::Success,
                executed_at: Utc::now(),
            };
            if let Err(e) = sink.record_appended(&record) {
                let failure = StepFailure {
                    kind: FailureKind::Ledger,
                    reason: e.to_string(),
                };
                return self.fail(plan, sink, index, op, failure, done, records, inventory);
            }
            tracing::debug!(plan_id = plan.id.0, op_index = index, "{}", op);
            records.push(record);
        }

        plan.transition(PlanStatus::Completed)?;
        if let Err(e) = sink.plan_finished(plan.id, PlanStatus::Completed) {
            tracing::error!(plan_id = plan.id.0, error = %e, "Failed to record plan completion");
        }
        inventory.refresh(self.gateway());
        tracing::info!(
            plan_id = plan.id.0,
            changed = inventory.changed().count(),
            "Plan completed"
        );

        Ok(ExecutionSummary {
            plan_id: plan.id,
            status: PlanStatus::Completed,
            records,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &self,
        plan: &mut Plan,
        sink: &dyn RecordSink,
        index: usize,
        op: &Operation,
        failure: StepFailure,
        partial: Vec<Completed>,
        records: Vec<ExecutionRecord>,
        mut inventory: PathInventory,
    ) -> Result<ExecutionSummary> {
        tracing::warn!(
            plan_id = plan.id.0,
            op_index = index,
            kind = failure.kind.as_str(),
            reason = %failure.reason,
            "Operation failed, rolling back"
        );

        let failed_record = ExecutionRecord {
            plan_id: plan.id,
            operation_index: index,
            operation: op.clone(),
            steps: partial.iter().map(|c| c.step.clone()).collect(),
            inverse: inverse_of(&partial),
            outcome: RecordOutcome::Failed {
                kind: failure.kind.as_str().to_string(),
                reason: failure.reason.clone(),
            },
            executed_at: Utc::now(),
        };
        if let Err(e) = sink.record_appended(&failed_record) {
            tracing::error!(plan_id = plan.id.0, error = %e, "Failed to record failed operation");
        }

        let ctx = self.context(plan.id);
        let mut rollback = revert_completed(&ctx, &partial);
        for record in records.iter().rev() {
            rollback.extend(revert_record(&ctx, record));
        }

        inventory.refresh(self.gateway());
        let report = FailureReport {
            plan_id: plan.id,
            failed_index: index,
            failed_operation: Some(op.clone()),
            kind: failure.kind,
            reason: failure.reason,
            completed: records.iter().map(|r| r.operation_index).collect(),
            rollback,
            inventory,
        };

        let status = if report.rollback_complete() {
            PlanStatus::RolledBack
        } else {
            PlanStatus::Failed
        };
        plan.transition(status)?;
        if let Err(e) = sink.plan_finished(plan.id, status) {
            tracing::error!(plan_id = plan.id.0, error = %e, "Failed to record plan outcome");
        }

        if status == PlanStatus::RolledBack {
            tracing::info!(plan_id = plan.id.0, "Rollback complete");
            Err(Error::Execution(Box::new(report)))
        } else {
            tracing::error!(
                plan_id = plan.id.0,
                failed = report.failed_rollbacks().count(),
                "Rollback incomplete"
            );
            Err(Error::RollbackIncomplete(Box::new(report)))
        }
    }

    /// Run a bare step sequence (undo, redo bookkeeping) with the same
    /// drift checks and rollback as plan execution.
    ///
    /// `affected` is used for the before/after inventory on failure.
    pub fn run_steps(&self, plan_id: PlanId, steps: &[Step], affected: &[PathBuf]) -> Result<Vec<Step>> {
        let ctx = self.context(plan_id);
        let mut inventory = PathInventory::capture(self.gateway(), affected);
        let mut done = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            if let Err(failure) = run_forward(&ctx, index, std::slice::from_ref(step), &mut done) {
                tracing::warn!(plan_id = plan_id.0, step = %step, reason = %failure.reason, "Step failed, reverting");
                let rollback = revert_completed(&ctx, &done);
                inventory.refresh(self.gateway());
                let report = FailureReport {
                    plan_id,
                    failed_index: index,
                    failed_operation: None,
                    kind: failure.kind,
                    reason: format!("{}: {}", step, failure.reason),
                    completed: done.iter().map(|c| c.operation_index).collect(),
                    rollback,
                    inventory,
                };
                return if report.rollback_complete() {
                    Err(Error::Execution(Box::new(report)))
                } else {
                    Err(Error::RollbackIncomplete(Box::new(report)))
                };
            }
        }

        Ok(done.into_iter().map(|c| c.step).collect())
    }
}

fn run_forward(
    ctx: &StepContext<'_>,
    operation_index: usize,
    steps: &[Step],
    done: &mut Vec<Completed>,
) -> std::result::Result<(), StepFailure> {
    for step in steps {
        step.precheck(ctx).map_err(|reason| StepFailure {
            kind: FailureKind::StateDrift,
            reason,
        })?;
        let inverse = step.inverse();
        match step.apply(ctx) {
            Ok(StepEffect::Applied) => done.push(Completed {
                operation_index,
                step: step.clone(),
                inverse,
            }),
            Ok(StepEffect::Skipped) => {}
            Err(e) => {
                return Err(StepFailure {
                    kind: FailureKind::Gateway(e.kind),
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn inverse_of(done: &[Completed]) -> Inverse {
    let mut steps = Vec::with_capacity(done.len());
    for completed in done.iter().rev() {
        match &completed.inverse {
            Some(inverse) => steps.push(inverse.clone()),
            None => {
                return Inverse::Irreversible {
                    reason: format!("{} cannot be undone", completed.step),
                }
            }
        }
    }
    Inverse::Steps { steps }
}

fn apply_inverse(ctx: &StepContext<'_>, operation_index: usize, step: &Step) -> RollbackStep {
    let outcome = match step.precheck(ctx) {
        Err(reason) => RollbackOutcome::Failed { reason },
        Ok(()) => match step.apply(ctx) {
            Ok(StepEffect::Applied) => RollbackOutcome::Reverted,
            Ok(StepEffect::Skipped) => RollbackOutcome::Skipped,
            Err(e) => RollbackOutcome::Failed {
                reason: e.to_string(),
            },
        },
    };
    if let RollbackOutcome::Failed { reason } = &outcome {
        tracing::error!(step = %step, reason = %reason, "Inverse step failed");
    }
    RollbackStep {
        operation_index,
        step: Some(step.clone()),
        outcome,
    }
}

fn revert_completed(ctx: &StepContext<'_>, done: &[Completed]) -> Vec<RollbackStep> {
    done.iter()
        .rev()
        .map(|completed| match &completed.inverse {
            Some(inverse) => apply_inverse(ctx, completed.operation_index, inverse),
            None => RollbackStep {
                operation_index: completed.operation_index,
                step: None,
                outcome: RollbackOutcome::Irreversible {
                    reason: format!("{} cannot be undone", completed.step),
                },
            },
        })
        .collect()
}

fn revert_record(ctx: &StepContext<'_>, record: &ExecutionRecord) -> Vec<RollbackStep> {
    match &record.inverse {
        Inverse::Steps { steps } => steps
            .iter()
            .map(|step| apply_inverse(ctx, record.operation_index, step))
            .collect(),
        Inverse::Irreversible { reason } => vec![RollbackStep {
            operation_index: record.operation_index,
            step: None,
            outcome: RollbackOutcome::Irreversible {
                reason: reason.clone(),
            },
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::MemorySink;
    use crate::gateway::LocalFs;
    use crate::models::plan::Provenance;
    use crate::validation::confirmation::TokenScope;
    use std::fs;
    use tempfile::tempdir;

    struct Fixture {
        dir: tempfile::TempDir,
        engine: ExecutionEngine,
        authority: Arc<ConfirmationAuthority>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("root")).unwrap();
        let holding = Arc::new(HoldingArea::new(dir.path().join("holding"), 30));
        holding.open().unwrap();
        let authority = Arc::new(ConfirmationAuthority::new());
        let engine = ExecutionEngine::new(
            PathPolicy::new(&dir.path().join("root")).unwrap(),
            Arc::new(LocalFs::new()),
            holding,
            Arc::clone(&authority),
        );
        Fixture {
            dir,
            engine,
            authority,
        }
    }

    fn validated(id: u64, ops: Vec<Operation>) -> Plan {
        let mut plan = Plan::new(
            PlanId(id),
            ops,
            Provenance {
                utterance: "test".to_string(),
                raw_response: String::new(),
                model: "scripted".to_string(),
                generated_at: Utc::now(),
                working_directory: PathBuf::from("/"),
                replay_of: None,
            },
        );
        plan.transition(PlanStatus::Validated).unwrap();
        plan
    }

    #[test]
    fn test_execute_create_and_move() {
        let fx = fixture();
        let root = fx.dir.path().join("root");
        fs::write(root.join("a.txt"), "a").unwrap();

        let mut plan = validated(
            1,
            vec![
                Operation::create_directory(root.join("archive")),
                Operation::move_paths(vec![root.join("a.txt")], root.join("archive/a.txt"), false)
                    .unwrap(),
            ],
        );
        let sink = MemorySink::default();
        let summary = fx
            .engine
            .execute(&mut plan, &sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.status, PlanStatus::Completed);
        assert_eq!(summary.records.len(), 2);
        assert_eq!(sink.records().len(), 2);
        assert!(root.join("archive/a.txt").exists());
        assert_eq!(plan.status(), PlanStatus::Completed);
    }

    #[test]
    fn test_destructive_plan_needs_token() {
        let fx = fixture();
        let root = fx.dir.path().join("root");
        fs::write(root.join("report.txt"), "r").unwrap();

        let mut plan = validated(
            2,
            vec![Operation::delete(vec![root.join("report.txt")], false, false).unwrap()],
        );
        let err = fx
            .engine
            .execute(&mut plan, &MemorySink::default(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::ConfirmationRequired { .. }));
        assert!(root.join("report.txt").exists());
        assert_eq!(plan.status(), PlanStatus::Validated);

        let challenge = ConfirmationChallenge::for_plan(&plan);
        plan.confirmation = Some(fx.authority.grant(&challenge, TokenScope::Standard));
        fx.engine
            .execute(&mut plan, &MemorySink::default(), &CancellationToken::new())
            .unwrap();
        assert!(!root.join("report.txt").exists());
        assert_eq!(fx.engine.holding().entries().unwrap().len(), 1);
    }

    #[test]
    fn test_drift_rolls_back_earlier_operations() {
        let fx = fixture();
        let root = fx.dir.path().join("root");
        fs::write(root.join("a.txt"), "a").unwrap();

        // Second op's source never existed: drift detected at run time
        let mut plan = validated(
            3,
            vec![
                Operation::move_paths(vec![root.join("a.txt")], root.join("b.txt"), false).unwrap(),
                Operation::move_paths(vec![root.join("ghost.txt")], root.join("c.txt"), false)
                    .unwrap(),
            ],
        );
        let sink = MemorySink::default();
        let err = fx
            .engine
            .execute(&mut plan, &sink, &CancellationToken::new())
            .unwrap_err();

        let report = err.report().unwrap();
        assert_eq!(report.kind, FailureKind::StateDrift);
        assert_eq!(report.failed_index, 1);
        assert_eq!(report.reverted(), vec![0]);
        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(plan.status(), PlanStatus::RolledBack);
        assert!(root.join("a.txt").exists());
        assert!(!root.join("b.txt").exists());
        assert_eq!(sink.finished(), vec![(PlanId(3), PlanStatus::RolledBack)]);
    }

    #[test]
    fn test_cancellation_between_operations() {
        let fx = fixture();
        let root = fx.dir.path().join("root");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut plan = validated(4, vec![Operation::create_directory(root.join("new"))]);
        let err = fx
            .engine
            .execute(&mut plan, &MemorySink::default(), &cancel)
            .unwrap_err();
        assert_eq!(err.report().unwrap().kind, FailureKind::Cancelled);
        assert!(!root.join("new").exists());
    }

    #[test]
    fn test_permanent_delete_makes_rollback_incomplete() {
        let fx = fixture();
        let root = fx.dir.path().join("root");
        fs::write(root.join("junk.bin"), "j").unwrap();

        let mut plan = validated(
            5,
            vec![
                Operation::delete(vec![root.join("junk.bin")], false, true).unwrap(),
                Operation::move_paths(vec![root.join("missing")], root.join("x"), false).unwrap(),
            ],
        );
        let challenge = ConfirmationChallenge::for_plan(&plan);
        plan.confirmation = Some(fx.authority.grant(&challenge, TokenScope::Permanent));

        let err = fx
            .engine
            .execute(&mut plan, &MemorySink::default(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::RollbackIncomplete(_)));
        assert_eq!(plan.status(), PlanStatus::Failed);
        let report = err.report().unwrap();
        assert!(matches!(
            report.rollback[0].outcome,
            RollbackOutcome::Irreversible { .. }
        ));
        let entry = report
            .inventory
            .entries
            .iter()
            .find(|e| e.path == root.join("junk.bin"))
            .unwrap();
        assert!(entry.before.is_some());
        assert!(entry.after.is_none());
    }

    #[test]
    fn test_run_steps_reverts_on_failure() {
        let fx = fixture();
        let root = fx.dir.path().join("root");
        fs::write(root.join("a.txt"), "a").unwrap();

        let steps = vec![
            Step::Move {
                from: root.join("a.txt"),
                to: root.join("b.txt"),
            },
            Step::Move {
                from: root.join("nope"),
                to: root.join("c"),
            },
        ];
        let err = fx
            .engine
            .run_steps(PlanId(6), &steps, &[root.join("a.txt"), root.join("b.txt")])
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert!(root.join("a.txt").exists());
        assert!(!root.join("b.txt").exists());
    }
}
