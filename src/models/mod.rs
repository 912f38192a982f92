//! Data model shared by the parser, validator, engine and ledger.

pub mod file;
pub mod issue;
pub mod operation;
pub mod plan;
pub mod record;

pub use file::{EntryKind, FileEntry, PathStat};
pub use issue::{IssueCode, Severity, ValidationIssue};
pub use operation::{Operation, OperationFlags, OperationKind};
pub use plan::{Plan, PlanId, PlanStatus, Provenance};
pub use record::{ExecutionRecord, RecordOutcome};
