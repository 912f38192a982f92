//! Intent Parser: utterance + session context -> candidate plan.
//!
//! The model is called once per utterance. Its response is treated as
//! untrusted text. JSON is pulled out of whatever surrounds it, each
//! operation is checked against the closed schema on its own, and every path
//! goes through the path policy before it becomes part of an [`Operation`].
//! Nothing here mutates the filesystem.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::client::{LanguageModel, ModelRequest};
use super::json_parser::extract_object;
use super::prompts::{build_plan_prompt, PLAN_SYSTEM_PROMPT};
use super::schema::{WireOperation, OPERATION_KINDS, PLAN_FIELDS};
use crate::error::{Error, Result};
use crate::gateway::FilesystemGateway;
use crate::models::file::FileEntry;
use crate::models::issue::{IssueCode, ValidationIssue};
use crate::models::operation::{Operation, OperationKind};
use crate::models::plan::{Plan, PlanId, PlanStatus, Provenance};
use crate::security::{validate_file_name, PathPolicy, PathRejection};
use crate::session::SessionContext;

/// Bounded view of the working directory handed to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub directory: PathBuf,
    pub entries: Vec<FileEntry>,
    /// More entries exist than were captured
    pub truncated: bool,
}

impl DirectoryListing {
    pub fn capture(gateway: &dyn FilesystemGateway, directory: &Path, max_entries: usize) -> Result<Self> {
        let mut entries = gateway.list(directory)?;
        let truncated = entries.len() > max_entries;
        entries.truncate(max_entries);
        Ok(Self {
            directory: directory.to_path_buf(),
            entries,
            truncated,
        })
    }

    fn find(&self, path: &Path) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

/// What the parser needs to turn wire operations into typed ones
pub struct ParseContext<'a> {
    pub policy: &'a PathPolicy,
    pub working_directory: &'a Path,
    pub listing: &'a DirectoryListing,
}

/// Result of interpreting one model response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interpretation {
    pub operations: Vec<Operation>,
    pub issues: Vec<ValidationIssue>,
    pub ambiguous: bool,
    pub alternatives: Vec<String>,
    pub notes: Option<String>,
}

impl Interpretation {
    fn block(&mut self, code: IssueCode, index: Option<usize>, reason: impl Into<String>) {
        self.issues.push(ValidationIssue::blocking(code, index, reason));
    }

    fn warn(&mut self, code: IssueCode, index: Option<usize>, reason: impl Into<String>) {
        self.issues.push(ValidationIssue::warning(code, index, reason));
    }
}

/// A parsed plan plus what the model said about it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseOutcome {
    pub plan: Plan,
    pub notes: Option<String>,
    pub alternatives: Vec<String>,
}

/// Turn a raw model response into operations and issues. Pure.
pub fn interpret(raw: &str, ctx: &ParseContext<'_>) -> Interpretation {
    let mut out = Interpretation::default();

    let object = match extract_object(raw) {
        Ok(object) => object,
        Err(reason) => {
            out.block(IssueCode::MalformedResponse, None, reason);
            return out;
        }
    };

    for key in object.keys() {
        if !PLAN_FIELDS.contains(&key.as_str()) {
            out.block(
                IssueCode::MalformedResponse,
                None,
                format!("unexpected field '{}' in plan", key),
            );
        }
    }

    out.ambiguous = object.get("ambiguous").and_then(Value::as_bool).unwrap_or(false);
    out.alternatives = object
        .get("alternatives")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    out.notes = object
        .get("notes")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    let items: &[Value] = match object.get("operations") {
        Some(Value::Array(items)) => items.as_slice(),
        Some(_) => {
            out.block(IssueCode::MalformedResponse, None, "'operations' must be a list");
            &[]
        }
        None => {
            out.block(IssueCode::MissingField, None, "missing field 'operations'");
            &[]
        }
    };

    // Directories created earlier in this plan count as directory destinations
    let mut created_dirs: Vec<PathBuf> = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let wire = match decode_operation(item) {
            Ok(wire) => wire,
            Err((code, reason)) => {
                out.block(code, Some(index), reason);
                continue;
            }
        };
        match build_operation(wire, index, ctx, &created_dirs, &mut out) {
            Some(op) => {
                if op.kind() == OperationKind::CreateDirectory {
                    if let Some(dir) = op.destination() {
                        created_dirs.push(dir.to_path_buf());
                    }
                }
                out.operations.push(op);
            }
            None => continue,
        }
    }

    if out.ambiguous || !out.alternatives.is_empty() {
        let reason = if out.alternatives.is_empty() {
            "the request is ambiguous".to_string()
        } else {
            format!("the request could mean: {}", out.alternatives.join(" | "))
        };
        out.warn(IssueCode::Ambiguous, None, reason);
    }

    let parsed_cleanly = !out.issues.iter().any(|i| i.is_blocking());
    if items.is_empty() && parsed_cleanly {
        let reason = out
            .notes
            .clone()
            .unwrap_or_else(|| "the model proposed no operations".to_string());
        out.warn(IssueCode::EmptyPlan, None, reason);
    }

    out
}

fn decode_operation(item: &Value) -> std::result::Result<WireOperation, (IssueCode, String)> {
    let Some(object) = item.as_object() else {
        return Err((
            IssueCode::MalformedResponse,
            "operation is not a JSON object".to_string(),
        ));
    };
    let kind = match object.get("op") {
        Some(Value::String(kind)) => kind.as_str(),
        Some(_) => {
            return Err((IssueCode::MissingField, "'op' must be a string".to_string()));
        }
        None => return Err((IssueCode::MissingField, "missing field 'op'".to_string())),
    };
    if !OPERATION_KINDS.contains(&kind) {
        return Err((
            IssueCode::UnknownOperationKind,
            format!("unknown operation '{}'", kind),
        ));
    }
    serde_json::from_value::<WireOperation>(item.clone()).map_err(|err| {
        let message = err.to_string();
        let code = if message.contains("missing field") {
            IssueCode::MissingField
        } else {
            IssueCode::InvalidOperation
        };
        (code, format!("{}: {}", kind, message))
    })
}

fn has_wildcard(raw: &str) -> bool {
    raw.contains('*') || raw.contains('?')
}

fn ends_with_separator(raw: &str) -> bool {
    raw.ends_with('/') || raw.ends_with('\\')
}

/// Translate a shell-style name pattern into an anchored regex
fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let mut expr = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

fn resolve_one(
    raw: &str,
    index: usize,
    ctx: &ParseContext<'_>,
    out: &mut Interpretation,
) -> Option<PathBuf> {
    match ctx.policy.resolve(raw, ctx.working_directory) {
        Ok(path) => Some(path),
        Err(PathRejection::Empty) => {
            out.block(IssueCode::MissingField, Some(index), "empty path");
            None
        }
        Err(rejection @ (PathRejection::OutsideRoot(_) | PathRejection::ThroughLink { .. })) => {
            out.block(IssueCode::PathOutsideRoot, Some(index), rejection.to_string());
            None
        }
        Err(rejection @ PathRejection::Reserved(_)) => {
            out.block(IssueCode::ProtectedPath, Some(index), rejection.to_string());
            None
        }
    }
}

/// Resolve source strings, expanding wildcards against the listing
fn resolve_sources(
    raws: Vec<String>,
    index: usize,
    ctx: &ParseContext<'_>,
    out: &mut Interpretation,
) -> Option<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    let mut ok = true;
    for raw in raws {
        let Some(path) = resolve_one(&raw, index, ctx, out) else {
            ok = false;
            continue;
        };
        if !has_wildcard(&raw) {
            resolved.push(path);
            continue;
        }

        let pattern = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if path.parent() != Some(ctx.listing.directory.as_path()) {
            out.block(
                IssueCode::PathNotFound,
                Some(index),
                format!("wildcard '{}' only matches inside the current directory", raw),
            );
            ok = false;
            continue;
        }
        let Some(regex) = wildcard_regex(&pattern) else {
            out.block(IssueCode::InvalidOperation, Some(index), format!("bad pattern '{}'", raw));
            ok = false;
            continue;
        };
        let include_hidden = pattern.starts_with('.');
        let matches: Vec<PathBuf> = ctx
            .listing
            .entries
            .iter()
            .filter(|e| include_hidden || !e.is_hidden)
            .filter(|e| regex.is_match(&e.name))
            .map(|e| e.path.clone())
            .collect();
        if matches.is_empty() {
            out.block(
                IssueCode::PathNotFound,
                Some(index),
                format!("nothing matches '{}'", raw),
            );
            ok = false;
            continue;
        }
        if ctx.listing.truncated {
            out.warn(
                IssueCode::ListingTruncated,
                Some(index),
                format!("'{}' was matched against a truncated listing", raw),
            );
        }
        for m in matches {
            if !resolved.contains(&m) {
                resolved.push(m);
            }
        }
    }
    ok.then_some(resolved)
}

fn build_operation(
    wire: WireOperation,
    index: usize,
    ctx: &ParseContext<'_>,
    created_dirs: &[PathBuf],
    out: &mut Interpretation,
) -> Option<Operation> {
    let built = match wire {
        WireOperation::Move {
            sources,
            destination,
            overwrite,
        } => {
            let (sources, destination) =
                resolve_transfer(sources.into_vec(), &destination, index, ctx, created_dirs, out)?;
            Operation::move_paths(sources, destination, overwrite)
        }
        WireOperation::Copy {
            sources,
            destination,
            overwrite,
        } => {
            let (sources, destination) =
                resolve_transfer(sources.into_vec(), &destination, index, ctx, created_dirs, out)?;
            Operation::copy_paths(sources, destination, overwrite)
        }
        WireOperation::Rename {
            source,
            new_name,
            overwrite,
        } => {
            let new_name = new_name.trim();
            if let Err(reason) = validate_file_name(new_name) {
                out.block(IssueCode::InvalidOperation, Some(index), reason);
                return None;
            }
            let source = resolve_one(&source, index, ctx, out)?;
            let Some(parent) = source.parent() else {
                out.block(IssueCode::InvalidOperation, Some(index), "cannot rename the filesystem root");
                return None;
            };
            let destination = parent.join(new_name);
            Operation::rename(source, destination, overwrite)
        }
        WireOperation::Delete {
            sources,
            recursive,
            permanent,
        } => {
            let sources = resolve_sources(sources.into_vec(), index, ctx, out)?;
            Operation::delete(sources, recursive, permanent)
        }
        WireOperation::CreateDirectory { path } => {
            Ok(Operation::create_directory(resolve_one(&path, index, ctx, out)?))
        }
        WireOperation::CreateFile { path } => {
            Ok(Operation::create_file(resolve_one(&path, index, ctx, out)?))
        }
    };

    match built {
        Ok(op) => Some(op),
        Err(err) => {
            out.block(IssueCode::InvalidOperation, Some(index), err.to_string());
            None
        }
    }
}

fn resolve_transfer(
    sources: Vec<String>,
    destination: &str,
    index: usize,
    ctx: &ParseContext<'_>,
    created_dirs: &[PathBuf],
    out: &mut Interpretation,
) -> Option<(Vec<PathBuf>, PathBuf)> {
    let resolved_sources = resolve_sources(sources, index, ctx, out);
    let resolved_destination = resolve_one(destination, index, ctx, out);
    let (sources, mut target) = (resolved_sources?, resolved_destination?);

    if sources.len() == 1 {
        let into_directory = ends_with_separator(destination.trim())
            || ctx.listing.find(&target).map(|e| e.is_dir()).unwrap_or(false)
            || created_dirs.contains(&target);
        if into_directory {
            if let Some(name) = sources[0].file_name() {
                target = target.join(name);
            }
        }
    }
    Some((sources, target))
}

/// Calls the model and builds candidate plans
pub struct IntentParser {
    model: Arc<dyn LanguageModel>,
    gateway: Arc<dyn FilesystemGateway>,
    policy: PathPolicy,
    max_listing_entries: usize,
}

impl IntentParser {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        gateway: Arc<dyn FilesystemGateway>,
        policy: PathPolicy,
        max_listing_entries: usize,
    ) -> Self {
        Self {
            model,
            gateway,
            policy,
            max_listing_entries: max_listing_entries.max(1),
        }
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// Parse one utterance into a Draft plan, or a Failed plan carrying the
    /// blocking parse issues. Cancellation discards the plan entirely.
    pub async fn parse(
        &self,
        id: PlanId,
        utterance: &str,
        session: &SessionContext,
        cancel: &CancellationToken,
    ) -> Result<ParseOutcome> {
        let working_directory = session.working_directory().to_path_buf();

        let listing = {
            let gateway = Arc::clone(&self.gateway);
            let directory = working_directory.clone();
            let max = self.max_listing_entries;
            tokio::task::spawn_blocking(move || {
                DirectoryListing::capture(gateway.as_ref(), &directory, max)
            })
            .await
            .map_err(|e| Error::InvalidState(format!("listing task failed: {e}")))??
        };

        let selection: Vec<String> = session
            .selection()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let history: Vec<String> = session.history().map(|h| h.utterance.clone()).collect();
        let request = ModelRequest {
            system: PLAN_SYSTEM_PROMPT.to_string(),
            prompt: build_plan_prompt(utterance, &listing, &selection, &history),
        };

        tracing::info!(
            plan_id = id.0,
            model = self.model.name(),
            entries = listing.entries.len(),
            truncated = listing.truncated,
            "Interpreting request"
        );

        let raw = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(plan_id = id.0, "Request cancelled while waiting for the model");
                return Err(Error::Cancelled);
            }
            response = self.model.complete(&request) => response?,
        };

        let interpretation = interpret(
            &raw,
            &ParseContext {
                policy: &self.policy,
                working_directory: &working_directory,
                listing: &listing,
            },
        );

        let mut plan = Plan::new(
            id,
            interpretation.operations,
            Provenance {
                utterance: utterance.to_string(),
                raw_response: raw,
                model: self.model.name().to_string(),
                generated_at: Utc::now(),
                working_directory,
                replay_of: None,
            },
        );
        plan.parse_issues = interpretation.issues;
        if plan.parse_issues.iter().any(|i| i.is_blocking()) {
            plan.transition(PlanStatus::Failed)?;
        }

        tracing::debug!(
            plan_id = id.0,
            operations = plan.operations().len(),
            issues = plan.parse_issues.len(),
            status = %plan.status(),
            "Plan parsed"
        );

        Ok(ParseOutcome {
            plan,
            notes: interpretation.notes,
            alternatives: interpretation.alternatives,
        })
    }
}
