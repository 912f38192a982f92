//! Execution layer: primitive steps, the engine, path locks and failure
//! reports.
//!
//! ## Modules
//! - `step`: primitive steps and their inverses
//! - `executor`: plan execution with rollback
//! - `lock`: advisory path-subtree locks
//! - `report`: failure reports and path inventories

pub mod executor;
pub mod lock;
pub mod report;
pub mod step;

use std::sync::Mutex;

use crate::error::Result;
use crate::models::plan::{Plan, PlanId, PlanStatus};
use crate::models::record::ExecutionRecord;

pub use executor::{ExecutionEngine, ExecutionSummary};
pub use lock::{LockPolicy, PathLockGuard, PathLockTable};
pub use report::{FailureKind, FailureReport, PathInventory, RollbackOutcome};
pub use step::{Inverse, Step};

/// Receives execution events as they happen
pub trait RecordSink: Send + Sync {
    fn plan_started(&self, plan: &Plan) -> Result<()>;

    /// Called once per operation, before the next one starts
    fn record_appended(&self, record: &ExecutionRecord) -> Result<()>;

    fn plan_finished(&self, plan_id: PlanId, status: PlanStatus) -> Result<()>;
}

/// Sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ExecutionRecord>>,
    finished: Mutex<Vec<(PlanId, PlanStatus)>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn finished(&self) -> Vec<(PlanId, PlanStatus)> {
        self.finished
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

impl RecordSink for MemorySink {
    fn plan_started(&self, _plan: &Plan) -> Result<()> {
        Ok(())
    }

    fn record_appended(&self, record: &ExecutionRecord) -> Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }

    fn plan_finished(&self, plan_id: PlanId, status: PlanStatus) -> Result<()> {
        if let Ok(mut finished) = self.finished.lock() {
            finished.push((plan_id, status));
        }
        Ok(())
    }
}
