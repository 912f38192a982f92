use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

use super::issue::ValidationIssue;
use super::operation::Operation;
use crate::error::{Error, Result};
use crate::validation::confirmation::ConfirmationToken;

/// Monotonically increasing plan identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub u64);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a plan. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanStatus {
    Draft,
    Validated,
    AwaitingConfirmation,
    Executing,
    Completed,
    Failed,
    RolledBack,
}

impl PlanStatus {
    pub fn can_transition_to(self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Draft, Validated)
                | (Draft, AwaitingConfirmation)
                | (Draft, Failed)
                | (AwaitingConfirmation, Validated)
                | (AwaitingConfirmation, Failed)
                | (Validated, Executing)
                | (Validated, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::RolledBack
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Validated => "validated",
            PlanStatus::AwaitingConfirmation => "awaiting confirmation",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::RolledBack => "rolled back",
        };
        f.write_str(label)
    }
}

/// Where a plan came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub utterance: String,
    /// Raw model output, kept for auditing
    pub raw_response: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
    pub working_directory: PathBuf,
    /// Set when this plan replays an undone plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<PlanId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanId,
    operations: Vec<Operation>,
    pub provenance: Provenance,
    status: PlanStatus,
    /// Issues attached while turning the model response into operations
    pub parse_issues: Vec<ValidationIssue>,
    /// Issues from the most recent validation pass
    pub validation_issues: Vec<ValidationIssue>,
    pub confirmation: Option<ConfirmationToken>,
}

impl Plan {
    pub fn new(id: PlanId, operations: Vec<Operation>, provenance: Provenance) -> Self {
        Self {
            id,
            operations,
            provenance,
            status: PlanStatus::Draft,
            parse_issues: Vec::new(),
            validation_issues: Vec::new(),
            confirmation: None,
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    /// Move to `next`, refusing backwards or skipped transitions
    pub fn transition(&mut self, next: PlanStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "plan {} cannot go from {} to {}",
                self.id, self.status, next
            )));
        }
        tracing::debug!(plan_id = self.id.0, from = %self.status, to = %next, "plan status changed");
        self.status = next;
        Ok(())
    }

    pub fn issues(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.parse_issues.iter().chain(self.validation_issues.iter())
    }

    pub fn has_blocking_issues(&self) -> bool {
        self.issues().any(|i| i.is_blocking())
    }

    /// Hex SHA-256 over the serialized operation list
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for op in &self.operations {
            // Operation serialization cannot fail: only paths, enums and bools
            let bytes = serde_json::to_vec(op).unwrap_or_default();
            hasher.update(&bytes);
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Paths touched by any operation, deduplicated, in plan order
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for op in &self.operations {
            for path in op.touched_paths() {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    pub fn destructive_indices(&self) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.is_destructive())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn needs_permanent_scope(&self) -> bool {
        self.operations.iter().any(|op| op.is_permanent_delete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance() -> Provenance {
        Provenance {
            utterance: "tidy up".to_string(),
            raw_response: "{}".to_string(),
            model: "scripted".to_string(),
            generated_at: Utc::now(),
            working_directory: PathBuf::from("/r"),
            replay_of: None,
        }
    }

    #[test]
    fn test_forward_transitions_only() {
        let mut plan = Plan::new(PlanId(1), vec![], provenance());
        plan.transition(PlanStatus::AwaitingConfirmation).unwrap();
        plan.transition(PlanStatus::Validated).unwrap();
        plan.transition(PlanStatus::Executing).unwrap();
        assert!(plan.transition(PlanStatus::Draft).is_err());
        assert!(plan.transition(PlanStatus::Validated).is_err());
        plan.transition(PlanStatus::Completed).unwrap();
        assert!(plan.status().is_terminal());
        assert!(plan.transition(PlanStatus::RolledBack).is_err());
    }

    #[test]
    fn test_digest_tracks_operations() {
        let a = Plan::new(
            PlanId(1),
            vec![Operation::create_directory("/r/a".into())],
            provenance(),
        );
        let b = Plan::new(
            PlanId(1),
            vec![Operation::create_directory("/r/b".into())],
            provenance(),
        );
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_touched_paths_deduplicated() {
        let plan = Plan::new(
            PlanId(2),
            vec![
                Operation::create_directory("/r/archive".into()),
                Operation::move_paths(vec!["/r/a.txt".into()], "/r/archive/a.txt".into(), false)
                    .unwrap(),
                Operation::delete(vec!["/r/archive/a.txt".into()], false, false).unwrap(),
            ],
            provenance(),
        );
        assert_eq!(
            plan.touched_paths(),
            vec![
                PathBuf::from("/r/archive"),
                PathBuf::from("/r/a.txt"),
                PathBuf::from("/r/archive/a.txt"),
            ]
        );
        assert_eq!(plan.destructive_indices(), vec![2]);
    }
}
