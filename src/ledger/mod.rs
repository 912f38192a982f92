//! Undo/Redo Ledger
//!
//! An append-only sequence of [`LedgerEvent`]s with an in-memory view: an
//! undo stack of completed plans and a redo stack of undone plans. The
//! ledger is the [`RecordSink`] the execution engine reports to, so every
//! record lands here as soon as its operation completes.
//!
//! ## Modules
//! - `journal`: optional JSON-lines persistence under an exclusive file lock

pub mod journal;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::execution::{ExecutionEngine, ExecutionSummary, Inverse, RecordSink, Step};
use crate::gateway::{FilesystemGateway, HoldingArea};
use crate::models::operation::Operation;
use crate::models::plan::{Plan, PlanId, PlanStatus, Provenance};
use crate::models::record::ExecutionRecord;
use crate::validation::confirmation::{ConfirmationAuthority, ConfirmationChallenge};
use crate::validation::{PlanValidator, ValidateOptions};

pub use journal::{Journal, LedgerEvent};

/// Where a plan stands with respect to undo and redo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum UndoState {
    /// Not finished, or finished without completing
    NotApplicable,
    Undoable,
    #[serde(rename_all = "camelCase")]
    Undone { fingerprint: String },
    #[serde(rename_all = "camelCase")]
    Replayed { replayed_as: PlanId },
    /// The filesystem no longer matches what the inverses expect
    #[serde(rename_all = "camelCase")]
    Stale { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub plan_id: PlanId,
    pub utterance: String,
    pub working_directory: PathBuf,
    pub operations: Vec<Operation>,
    pub replay_of: Option<PlanId>,
    pub records: Vec<ExecutionRecord>,
    pub status: PlanStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub undo: UndoState,
}

impl LedgerEntry {
    /// Inverse steps for the whole plan, last operation first
    fn undo_steps(&self) -> std::result::Result<Vec<Step>, String> {
        let mut steps = Vec::new();
        for record in self.records.iter().rev().filter(|r| r.is_success()) {
            match &record.inverse {
                Inverse::Steps { steps: inverse } => steps.extend(inverse.iter().cloned()),
                Inverse::Irreversible { reason } => {
                    return Err(format!(
                        "operation {} ({}) cannot be undone: {}",
                        record.operation_index + 1,
                        record.operation,
                        reason
                    ))
                }
            }
        }
        Ok(steps)
    }

    fn affected_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for record in &self.records {
            for path in record.affected_paths() {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        for op in &self.operations {
            for path in op.touched_paths() {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }
}

/// What an undo would do, computed before locks are taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoCandidate {
    pub plan_id: PlanId,
    pub steps: Vec<Step>,
    pub affected: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoCandidate {
    pub plan_id: PlanId,
    pub utterance: String,
    pub working_directory: PathBuf,
    pub operations: Vec<Operation>,
    pub fingerprint: String,
    pub affected: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoSummary {
    pub plan_id: PlanId,
    /// Inverse steps that changed the filesystem
    pub reverted_steps: Vec<Step>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedoSummary {
    pub original: PlanId,
    pub execution: ExecutionSummary,
}

#[derive(Debug, Default)]
pub struct UndoLedger {
    entries: BTreeMap<PlanId, LedgerEntry>,
    undo_stack: Vec<PlanId>,
    redo_stack: Vec<PlanId>,
    events: Vec<LedgerEvent>,
    journal: Option<Journal>,
    last_id: u64,
}

impl UndoLedger {
    /// In-memory ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger persisted to `path`. Replays existing events, then marks plans
    /// whose inverses no longer apply to the filesystem as stale.
    pub fn open(path: &Path, gateway: &dyn FilesystemGateway, holding: &HoldingArea) -> Result<Self> {
        let (journal, events) = Journal::open(path)?;
        let mut ledger = Self::new();
        for event in events {
            ledger.apply(event);
        }
        ledger.journal = Some(journal);
        ledger.revalidate(gateway, holding);
        tracing::info!(
            path = %path.display(),
            plans = ledger.entries.len(),
            undoable = ledger.undo_stack.len(),
            "Ledger loaded"
        );
        Ok(ledger)
    }

    fn revalidate(&mut self, gateway: &dyn FilesystemGateway, holding: &HoldingArea) {
        let mut stale = Vec::new();
        for entry in self.entries.values() {
            if entry.status == PlanStatus::Executing {
                stale.push((entry.plan_id, "execution was interrupted".to_string()));
                continue;
            }
            if entry.undo != UndoState::Undoable {
                continue;
            }
            // Irreversible plans are reported at undo time
            if let Ok(steps) = entry.undo_steps() {
                if let Err(reason) = check_applicable(&steps, gateway, holding) {
                    stale.push((entry.plan_id, reason));
                }
            }
        }
        for (plan_id, reason) in stale {
            tracing::warn!(plan_id = plan_id.0, reason = %reason, "Ledger entry is stale");
            if let Some(entry) = self.entries.get_mut(&plan_id) {
                entry.undo = UndoState::Stale { reason };
            }
        }
    }

    /// Allocate the next plan id; ids never repeat, across reloads included
    pub fn next_plan_id(&mut self) -> PlanId {
        self.last_id += 1;
        PlanId(self.last_id)
    }

    /// Persist (when a journal is open) and apply an event
    pub fn record(&mut self, event: LedgerEvent) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&event)?;
        }
        self.apply(event);
        Ok(())
    }

    fn apply(&mut self, event: LedgerEvent) {
        self.last_id = self.last_id.max(event.plan_id().0);
        match &event {
            LedgerEvent::PlanStarted {
                plan_id,
                utterance,
                working_directory,
                operations,
                replay_of,
                at,
            } => {
                if replay_of.is_none() {
                    self.redo_stack.clear();
                }
                self.entries.insert(
                    *plan_id,
                    LedgerEntry {
                        plan_id: *plan_id,
                        utterance: utterance.clone(),
                        working_directory: working_directory.clone(),
                        operations: operations.clone(),
                        replay_of: *replay_of,
                        records: Vec::new(),
                        status: PlanStatus::Executing,
                        started_at: *at,
                        finished_at: None,
                        undo: UndoState::NotApplicable,
                    },
                );
            }
            LedgerEvent::RecordAppended { record } => {
                if let Some(entry) = self.entries.get_mut(&record.plan_id) {
                    entry.records.push(record.clone());
                }
            }
            LedgerEvent::PlanFinished { plan_id, status, at } => {
                if let Some(entry) = self.entries.get_mut(plan_id) {
                    entry.status = *status;
                    entry.finished_at = Some(*at);
                    if *status == PlanStatus::Completed {
                        entry.undo = UndoState::Undoable;
                        self.undo_stack.push(*plan_id);
                    }
                }
            }
            LedgerEvent::PlanUndone {
                plan_id,
                fingerprint,
                ..
            } => {
                self.undo_stack.retain(|id| id != plan_id);
                self.redo_stack.push(*plan_id);
                if let Some(entry) = self.entries.get_mut(plan_id) {
                    entry.undo = UndoState::Undone {
                        fingerprint: fingerprint.clone(),
                    };
                }
            }
            LedgerEvent::PlanRedone {
                plan_id,
                replayed_as,
                ..
            } => {
                self.redo_stack.retain(|id| id != plan_id);
                if let Some(entry) = self.entries.get_mut(plan_id) {
                    entry.undo = UndoState::Replayed {
                        replayed_as: *replayed_as,
                    };
                }
            }
        }
        self.events.push(event);
    }

    pub fn entry(&self, plan_id: PlanId) -> Option<&LedgerEntry> {
        self.entries.get(&plan_id)
    }

    /// All plans, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    pub fn undo_stack(&self) -> &[PlanId] {
        &self.undo_stack
    }

    pub fn redo_stack(&self) -> &[PlanId] {
        &self.redo_stack
    }

    /// The plan an undo would revert. With `target`, it must be the most
    /// recent completed plan.
    pub fn peek_undo(&self, target: Option<PlanId>) -> Result<UndoCandidate> {
        let Some(top) = self.undo_stack.last().copied() else {
            return Err(Error::UndoUnavailable("no completed plan to undo".to_string()));
        };
        if let Some(target) = target {
            if target != top {
                return Err(Error::UndoUnavailable(format!(
                    "plan {} is not the most recent completed plan ({} is)",
                    target, top
                )));
            }
        }
        let entry = self
            .entries
            .get(&top)
            .ok_or_else(|| Error::Ledger(format!("plan {} missing from ledger", top)))?;
        if let UndoState::Stale { reason } = &entry.undo {
            return Err(Error::UndoUnavailable(format!("plan {} is stale: {}", top, reason)));
        }
        let steps = entry.undo_steps().map_err(Error::UndoUnavailable)?;
        Ok(UndoCandidate {
            plan_id: top,
            steps,
            affected: entry.affected_paths(),
        })
    }

    /// The plan a redo would replay. With `target`, it must be the most
    /// recently undone plan.
    pub fn peek_redo(&self, target: Option<PlanId>) -> Result<RedoCandidate> {
        let Some(top) = self.redo_stack.last().copied() else {
            return Err(Error::UndoUnavailable("nothing to redo".to_string()));
        };
        if let Some(target) = target {
            if target != top {
                return Err(Error::UndoUnavailable(format!(
                    "plan {} is not the most recently undone plan ({} is)",
                    target, top
                )));
            }
        }
        let entry = self
            .entries
            .get(&top)
            .ok_or_else(|| Error::Ledger(format!("plan {} missing from ledger", top)))?;
        let UndoState::Undone { fingerprint } = &entry.undo else {
            return Err(Error::Ledger(format!("plan {} is on the redo stack but not undone", top)));
        };
        Ok(RedoCandidate {
            plan_id: top,
            utterance: entry.utterance.clone(),
            working_directory: entry.working_directory.clone(),
            operations: entry.operations.clone(),
            fingerprint: fingerprint.clone(),
            affected: entry.affected_paths(),
        })
    }

    /// Drop events of plans that can no longer be undone or redone
    pub fn compact(&mut self) -> Result<usize> {
        let live: Vec<PlanId> = self
            .undo_stack
            .iter()
            .chain(self.redo_stack.iter())
            .copied()
            .collect();
        let before = self.events.len();
        let last_id = self.last_id;
        self.events.retain(|e| live.contains(&e.plan_id()) || e.plan_id().0 == last_id);
        if let Some(journal) = self.journal.as_mut() {
            journal.compact(&self.events)?;
        }
        self.entries.retain(|id, _| live.contains(id) || id.0 == last_id);
        Ok(before - self.events.len())
    }
}

/// Hash of kind, size and mtime of every path; absent paths count too
pub fn fingerprint(gateway: &dyn FilesystemGateway, paths: &[PathBuf]) -> String {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for path in sorted {
        hasher.update(path.to_string_lossy().as_bytes());
        match gateway.stat(path) {
            Ok(Some(stat)) => {
                hasher.update(stat.kind.label().as_bytes());
                hasher.update(stat.size.to_be_bytes());
                hasher.update(stat.modified_at.unwrap_or_default().to_be_bytes());
            }
            Ok(None) => hasher.update(b"absent"),
            Err(e) => hasher.update(format!("error:{}", e.kind.as_str()).as_bytes()),
        }
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Whether `steps` could run against the current filesystem, tracking the
/// effect of each step on the ones after it
fn check_applicable(
    steps: &[Step],
    gateway: &dyn FilesystemGateway,
    holding: &HoldingArea,
) -> std::result::Result<(), String> {
    let mut overlay: HashMap<PathBuf, bool> = HashMap::new();
    let present = |overlay: &HashMap<PathBuf, bool>, path: &Path| -> bool {
        match overlay.get(path) {
            Some(present) => *present,
            None => gateway.exists(path).unwrap_or(false),
        }
    };

    for step in steps {
        if let Some(required) = step.requires() {
            if !present(&overlay, required) {
                return Err(format!("{} no longer exists", required.display()));
            }
        }
        if let Some(occupied) = step.occupies() {
            if present(&overlay, occupied) {
                return Err(format!("{} already exists", occupied.display()));
            }
        }
        if let Step::Restore { entry, .. } = step {
            if !holding.contains(entry) {
                return Err(format!("holding area entry {} is gone", entry));
            }
        }
        if let Some(required) = step.requires() {
            if matches!(step, Step::Move { .. } | Step::Stash { .. } | Step::Erase { .. } | Step::RemoveDirIfEmpty { .. }) {
                overlay.insert(required.to_path_buf(), false);
            }
        }
        if let Some(occupied) = step.occupies() {
            overlay.insert(occupied.to_path_buf(), true);
        }
    }
    Ok(())
}

/// Thread-safe handle shared by the assistant and the execution engine
#[derive(Debug, Clone, Default)]
pub struct SharedLedger {
    inner: Arc<Mutex<UndoLedger>>,
}

impl SharedLedger {
    pub fn new(ledger: UndoLedger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, UndoLedger>> {
        self.inner
            .lock()
            .map_err(|_| Error::Ledger("ledger lock poisoned".to_string()))
    }

    pub fn next_plan_id(&self) -> Result<PlanId> {
        Ok(self.lock()?.next_plan_id())
    }

    pub fn peek_undo(&self, target: Option<PlanId>) -> Result<UndoCandidate> {
        self.lock()?.peek_undo(target)
    }

    pub fn peek_redo(&self, target: Option<PlanId>) -> Result<RedoCandidate> {
        self.lock()?.peek_redo(target)
    }

    /// Revert the most recent completed plan (which must be `target` when
    /// given). The caller holds path locks on the candidate's paths.
    pub fn undo(&self, engine: &ExecutionEngine, target: Option<PlanId>) -> Result<UndoSummary> {
        let candidate = self.peek_undo(target)?;
        tracing::info!(
            plan_id = candidate.plan_id.0,
            steps = candidate.steps.len(),
            "Undoing plan"
        );

        let reverted_steps = engine.run_steps(candidate.plan_id, &candidate.steps, &candidate.affected)?;
        let fingerprint = fingerprint(engine.gateway(), &candidate.affected);
        self.lock()?.record(LedgerEvent::PlanUndone {
            plan_id: candidate.plan_id,
            fingerprint: fingerprint.clone(),
            at: Utc::now(),
        })?;

        Ok(UndoSummary {
            plan_id: candidate.plan_id,
            reverted_steps,
            fingerprint,
        })
    }

    /// Re-execute the most recently undone plan (which must be `target` when
    /// given) as a new plan, provided nothing on disk changed since the undo.
    /// The caller holds path locks on the candidate's paths.
    pub fn redo(
        &self,
        engine: &ExecutionEngine,
        validator: &PlanValidator,
        authority: &ConfirmationAuthority,
        target: Option<PlanId>,
        cancel: &CancellationToken,
    ) -> Result<RedoSummary> {
        let candidate = self.peek_redo(target)?;
        let current = fingerprint(engine.gateway(), &candidate.affected);
        if current != candidate.fingerprint {
            return Err(Error::RedoStateStale {
                plan_id: candidate.plan_id,
                reason: "files changed since the undo".to_string(),
            });
        }

        let mut plan = Plan::new(
            self.next_plan_id()?,
            candidate.operations.clone(),
            Provenance {
                utterance: candidate.utterance.clone(),
                raw_response: String::new(),
                model: "redo".to_string(),
                generated_at: Utc::now(),
                working_directory: candidate.working_directory.clone(),
                replay_of: Some(candidate.plan_id),
            },
        );

        let report = validator.validate_and_apply(&mut plan, ValidateOptions { assume_confirmed: true })?;
        if plan.status() != PlanStatus::Validated {
            let reasons: Vec<String> = report.blocking().map(|i| i.to_string()).collect();
            return Err(Error::RedoStateStale {
                plan_id: candidate.plan_id,
                reason: reasons.join("; "),
            });
        }
        if !plan.destructive_indices().is_empty() {
            let challenge = ConfirmationChallenge::for_plan(&plan);
            plan.confirmation = Some(authority.grant(&challenge, challenge.required_scope()));
        }

        tracing::info!(
            plan_id = plan.id.0,
            replay_of = candidate.plan_id.0,
            "Redoing plan"
        );
        let execution = engine.execute(&mut plan, self, cancel)?;
        self.lock()?.record(LedgerEvent::PlanRedone {
            plan_id: candidate.plan_id,
            replayed_as: plan.id,
            at: Utc::now(),
        })?;

        Ok(RedoSummary {
            original: candidate.plan_id,
            execution,
        })
    }
}

impl RecordSink for SharedLedger {
    fn plan_started(&self, plan: &Plan) -> Result<()> {
        self.lock()?.record(LedgerEvent::PlanStarted {
            plan_id: plan.id,
            utterance: plan.provenance.utterance.clone(),
            working_directory: plan.provenance.working_directory.clone(),
            operations: plan.operations().to_vec(),
            replay_of: plan.provenance.replay_of,
            at: Utc::now(),
        })
    }

    fn record_appended(&self, record: &ExecutionRecord) -> Result<()> {
        self.lock()?.record(LedgerEvent::RecordAppended {
            record: record.clone(),
        })
    }

    fn plan_finished(&self, plan_id: PlanId, status: PlanStatus) -> Result<()> {
        self.lock()?.record(LedgerEvent::PlanFinished {
            plan_id,
            status,
            at: Utc::now(),
        })
    }
}
