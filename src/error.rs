//! Crate-wide error type.
//!
//! Every fallible public operation returns [`Result`]. Variants map onto the
//! stages a request passes through: a plan that fails to parse or validate
//! never reaches the filesystem, while execution failures always carry a
//! [`FailureReport`] describing what was reverted.

use thiserror::Error;

use crate::execution::report::FailureReport;
use crate::gateway::{GatewayError, GatewayErrorKind};
use crate::models::issue::ValidationIssue;
use crate::models::plan::PlanId;
use crate::validation::confirmation::ConfirmationChallenge;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// The model response could not be turned into a usable plan.
    #[error("plan {plan_id} could not be parsed: {}", summarize(.issues))]
    Parse {
        plan_id: PlanId,
        issues: Vec<ValidationIssue>,
    },

    /// Blocking validation issues; nothing was executed.
    #[error("plan {plan_id} failed validation: {}", summarize(.issues))]
    Validation {
        plan_id: PlanId,
        issues: Vec<ValidationIssue>,
    },

    /// Destructive operations need an explicit confirmation token.
    #[error("plan {plan_id} requires confirmation before it can run")]
    ConfirmationRequired {
        plan_id: PlanId,
        challenge: ConfirmationChallenge,
    },

    /// An operation failed and every completed change was reverted.
    #[error("{0}")]
    Execution(Box<FailureReport>),

    /// An operation failed and at least one change could not be reverted.
    #[error("rollback incomplete: {0}")]
    RollbackIncomplete(Box<FailureReport>),

    #[error("cannot redo plan {plan_id}: {reason}")]
    RedoStateStale { plan_id: PlanId, reason: String },

    #[error("nothing to undo: {0}")]
    UndoUnavailable(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("language model error: {0}")]
    Model(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("paths are locked by another plan: {0}")]
    Locked(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Issues attached to parse and validation failures.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Error::Parse { issues, .. } | Error::Validation { issues, .. } => issues,
            _ => &[],
        }
    }

    /// Failure report for execution errors, if any.
    pub fn report(&self) -> Option<&FailureReport> {
        match self {
            Error::Execution(report) | Error::RollbackIncomplete(report) => Some(report),
            _ => None,
        }
    }
}

impl From<GatewayError> for Error {
    fn from(err: GatewayError) -> Self {
        let kind = match err.kind {
            GatewayErrorKind::PathNotFound => std::io::ErrorKind::NotFound,
            GatewayErrorKind::AlreadyExists => std::io::ErrorKind::AlreadyExists,
            GatewayErrorKind::PermissionDenied => std::io::ErrorKind::PermissionDenied,
            GatewayErrorKind::CrossDevice | GatewayErrorKind::Io => std::io::ErrorKind::Other,
        };
        Error::Io(std::io::Error::new(kind, err.to_string()))
    }
}

fn summarize(issues: &[ValidationIssue]) -> String {
    let blocking: Vec<String> = issues
        .iter()
        .filter(|i| i.is_blocking())
        .map(|i| i.to_string())
        .collect();
    if blocking.is_empty() {
        "no blocking issues".to_string()
    } else {
        blocking.join("; ")
    }
}
