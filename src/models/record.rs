use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::operation::Operation;
use super::plan::PlanId;
use crate::execution::step::{Inverse, Step};

/// Outcome of one executed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum RecordOutcome {
    Success,
    Failed { kind: String, reason: String },
}

/// Audit record for one operation, owned by the ledger once appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub plan_id: PlanId,
    pub operation_index: usize,
    pub operation: Operation,
    /// Primitive steps that completed
    pub steps: Vec<Step>,
    /// Computed before each step ran; applying it reverts `steps`
    pub inverse: Inverse,
    pub outcome: RecordOutcome,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == RecordOutcome::Success
    }

    pub fn is_reversible(&self) -> bool {
        matches!(self.inverse, Inverse::Steps { .. })
    }

    /// Paths the operation and its inverse touch
    pub fn affected_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.operation.touched_paths();
        for step in &self.steps {
            for path in step.live_paths() {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }
}
