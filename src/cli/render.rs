//! Plain-text rendering for the terminal front end.

use std::fmt::Write;
use std::path::Path;

use automanager::ai::ModelStatus;
use automanager::execution::report::{FailureReport, RollbackOutcome};
use automanager::execution::ExecutionSummary;
use automanager::gateway::HoldingEntry;
use automanager::ledger::{RedoSummary, UndoState, UndoSummary};
use automanager::models::{FileEntry, Severity, ValidationIssue};
use automanager::utils::{display_relative, format_millis, format_size};
use automanager::{Error, PlanSummary, Proposal};

pub fn proposal(p: &Proposal, root: &Path) -> String {
    let mut out = String::new();
    let plan = &p.plan;
    if plan.operations().is_empty() {
        let _ = writeln!(out, "Nothing to do.");
    } else {
        let _ = writeln!(out, "Plan {} ({} operation(s)):", plan.id, plan.operations().len());
        for (i, op) in plan.operations().iter().enumerate() {
            let marker = if op.is_destructive() { "!" } else { " " };
            let _ = writeln!(out, " {}{:>2}. {}", marker, i + 1, relativize(&op.to_string(), root));
        }
    }
    let issues: Vec<&ValidationIssue> = plan.issues().collect();
    if !issues.is_empty() {
        out.push_str(&issues_block(issues.into_iter(), root));
    }
    if let Some(notes) = p.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        let _ = writeln!(out, "Note: {}", notes.trim());
    }
    if !p.alternatives.is_empty() {
        let _ = writeln!(out, "Did you mean:");
        for alt in &p.alternatives {
            let _ = writeln!(out, "  - {}", alt);
        }
    }
    if let Some(challenge) = &p.challenge {
        let scope = if challenge.requires_permanent { " PERMANENTLY" } else { "" };
        let _ = writeln!(
            out,
            "{} operation(s) need confirmation{}:",
            challenge.destructive_operations.len(),
            scope
        );
        for line in &challenge.summary {
            let _ = writeln!(out, "  {}", relativize(line, root));
        }
    }
    out
}

fn issues_block<'a>(issues: impl Iterator<Item = &'a ValidationIssue>, root: &Path) -> String {
    let mut out = String::new();
    for issue in issues {
        let label = match issue.severity {
            Severity::Blocking => "error",
            Severity::Warning => "warning",
        };
        let _ = writeln!(out, "  {}: {}", label, relativize(&issue.to_string(), root));
    }
    out
}

pub fn execution(summary: &ExecutionSummary) -> String {
    format!(
        "Plan {} {}: {} operation(s) done.",
        summary.plan_id,
        summary.status,
        summary.records.len()
    )
}

pub fn undo(summary: &UndoSummary) -> String {
    format!(
        "Undid plan {} ({} step(s) reverted).",
        summary.plan_id,
        summary.reverted_steps.len()
    )
}

pub fn redo(summary: &RedoSummary) -> String {
    format!(
        "Redid plan {} as plan {}: {} operation(s) done.",
        summary.original,
        summary.execution.plan_id,
        summary.execution.records.len()
    )
}

fn failure(report: &FailureReport, root: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", relativize(&report.to_string(), root));
    if let Some(op) = &report.failed_operation {
        let _ = writeln!(out, "  failed: {}", relativize(&op.to_string(), root));
    }
    for step in &report.rollback {
        let what = step
            .step
            .as_ref()
            .map(|s| relativize(&s.to_string(), root))
            .unwrap_or_else(|| format!("operation {}", step.operation_index + 1));
        let status = match &step.outcome {
            RollbackOutcome::Reverted => "reverted".to_string(),
            RollbackOutcome::Skipped => "skipped".to_string(),
            RollbackOutcome::Failed { reason } => format!("FAILED ({})", reason),
            RollbackOutcome::Irreversible { reason } => format!("IRREVERSIBLE ({})", reason),
        };
        let _ = writeln!(out, "  rollback: {} ... {}", what, status);
    }
    if !report.rollback_complete() {
        let _ = writeln!(out, "  paths now differing from before:");
        for entry in report.inventory.changed() {
            let kind = |k: Option<automanager::models::EntryKind>| k.map(|k| k.label()).unwrap_or("absent");
            let _ = writeln!(
                out,
                "    {}: {} -> {}",
                display_relative(&entry.path, root),
                kind(entry.before),
                kind(entry.after)
            );
        }
    }
    out
}

pub fn error(err: &Error, root: &Path) -> String {
    match err {
        Error::Parse { .. } | Error::Validation { .. } => {
            let mut out = format!("{}\n", relativize(&err.to_string(), root));
            out.push_str(&issues_block(err.issues().iter(), root));
            out
        }
        Error::Execution(report) | Error::RollbackIncomplete(report) => failure(report, root),
        other => format!("{}\n", relativize(&other.to_string(), root)),
    }
}

pub fn listing(entries: &[FileEntry]) -> String {
    if entries.is_empty() {
        return "(empty)\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let name = if entry.is_dir() {
            format!("{}/", entry.name)
        } else {
            entry.name.clone()
        };
        let size = if entry.is_dir() {
            "-".to_string()
        } else {
            format_size(entry.size)
        };
        let _ = writeln!(out, "{:>8}  {}  {}", size, format_millis(entry.modified_at), name);
    }
    out
}

pub fn holding(entries: &[HoldingEntry], root: &Path) -> String {
    if entries.is_empty() {
        return "Holding area is empty.\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(
            out,
            "{}  {:>8}  {}  (plan {})",
            entry.held_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
            format_size(entry.size),
            display_relative(&entry.original_path, root),
            entry
                .plan_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    out
}

pub fn history(plans: &[PlanSummary]) -> String {
    if plans.is_empty() {
        return "No plans yet.\n".to_string();
    }
    let mut out = String::new();
    for plan in plans {
        let undo = match &plan.undo {
            UndoState::NotApplicable => String::new(),
            UndoState::Undoable => " [undoable]".to_string(),
            UndoState::Undone { .. } => " [undone]".to_string(),
            UndoState::Replayed { replayed_as } => format!(" [redone as {}]", replayed_as),
            UndoState::Stale { reason } => format!(" [stale: {}]", reason),
        };
        let _ = writeln!(
            out,
            "{:>4}  {:<12} {} op(s)  {}{}",
            plan.plan_id.to_string(),
            plan.status.to_string(),
            plan.operations,
            plan.utterance,
            undo
        );
    }
    out
}

pub fn model_status(status: &ModelStatus) -> String {
    let mut out = format!("Model service at {}: ", status.endpoint);
    if !status.reachable {
        out.push_str("unreachable");
    } else if status.model_available {
        let _ = write!(out, "ready ({})", status.model);
    } else {
        let _ = write!(
            out,
            "model {} not installed (available: {})",
            status.model,
            if status.available_models.is_empty() {
                "none".to_string()
            } else {
                status.available_models.join(", ")
            }
        );
    }
    if let Some(detail) = &status.detail {
        let _ = write!(out, " - {}", detail);
    }
    out.push('\n');
    out
}

/// Shorten absolute paths under the root inside free text
fn relativize(text: &str, root: &Path) -> String {
    let prefix = format!("{}/", root.display());
    text.replace(&prefix, "")
}
