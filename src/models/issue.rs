use serde::{Deserialize, Serialize};
use std::fmt;

/// How serious a validation issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    /// Prevents the plan from executing
    Blocking,
    /// Surfaced to the user, does not block
    Warning,
}

/// Machine-readable reason code for a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueCode {
    PathNotFound,
    DestinationExists,
    PermissionDenied,
    DestructiveWithoutConfirmation,
    PathOutsideRoot,
    ProtectedPath,
    IntraPlanConflict,
    InvalidOperation,
    UnknownOperationKind,
    MissingField,
    MalformedResponse,
    Ambiguous,
    OverwriteEnabled,
    IrreversibleDelete,
    SymlinkSource,
    EmptyPlan,
    ListingTruncated,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::PathNotFound => "path_not_found",
            IssueCode::DestinationExists => "destination_exists",
            IssueCode::PermissionDenied => "permission_denied",
            IssueCode::DestructiveWithoutConfirmation => "destructive_without_confirmation",
            IssueCode::PathOutsideRoot => "path_outside_root",
            IssueCode::ProtectedPath => "protected_path",
            IssueCode::IntraPlanConflict => "intra_plan_conflict",
            IssueCode::InvalidOperation => "invalid_operation",
            IssueCode::UnknownOperationKind => "unknown_operation_kind",
            IssueCode::MissingField => "missing_field",
            IssueCode::MalformedResponse => "malformed_response",
            IssueCode::Ambiguous => "ambiguous",
            IssueCode::OverwriteEnabled => "overwrite_enabled",
            IssueCode::IrreversibleDelete => "irreversible_delete",
            IssueCode::SymlinkSource => "symlink_source",
            IssueCode::EmptyPlan => "empty_plan",
            IssueCode::ListingTruncated => "listing_truncated",
        }
    }
}

/// A problem found while parsing or validating a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Index of the affected operation, None for plan-wide issues
    pub operation_index: Option<usize>,
    pub code: IssueCode,
    pub reason: String,
}

impl ValidationIssue {
    pub fn blocking(code: IssueCode, operation_index: Option<usize>, reason: impl Into<String>) -> Self {
        Self {
            severity: Severity::Blocking,
            operation_index,
            code,
            reason: reason.into(),
        }
    }

    pub fn warning(code: IssueCode, operation_index: Option<usize>, reason: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            operation_index,
            code,
            reason: reason.into(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation_index {
            Some(index) => write!(f, "[{}] op {}: {}", self.code.as_str(), index + 1, self.reason),
            None => write!(f, "[{}] {}", self.code.as_str(), self.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_uses_one_based_index() {
        let issue = ValidationIssue::blocking(IssueCode::PathNotFound, Some(0), "a.txt does not exist");
        assert_eq!(issue.to_string(), "[path_not_found] op 1: a.txt does not exist");

        let plan_wide = ValidationIssue::warning(IssueCode::EmptyPlan, None, "nothing to do");
        assert_eq!(plan_wide.to_string(), "[empty_plan] nothing to do");
        assert!(!plan_wide.is_blocking());
    }

    #[test]
    fn test_serializes_camel_case() {
        let issue = ValidationIssue::blocking(IssueCode::IntraPlanConflict, None, "x");
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["code"], "intraPlanConflict");
        assert_eq!(json["severity"], "blocking");
        assert!(json["operationIndex"].is_null());
    }
}
