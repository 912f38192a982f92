//! The front-end dispatcher.
//!
//! [`Assistant`] owns every component and is what a UI talks to. Model calls
//! and filesystem work run on a bounded pool of blocking workers; plans that
//! touch overlapping paths are serialized by advisory path locks.
//!
//! A request goes through `submit` (parse and validate), optionally
//! `confirm` (destructive plans), then `execute`. Undo and redo can be asked
//! for directly or by typing "undo that" / "redo".

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::ai::{IntentParser, LanguageModel, ModelStatus};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::execution::{ExecutionEngine, ExecutionSummary, LockPolicy, PathLockGuard, PathLockTable};
use crate::gateway::{FilesystemGateway, HoldingArea, HoldingEntry, LocalFs};
use crate::ledger::{RedoSummary, SharedLedger, UndoLedger, UndoState, UndoSummary};
use crate::models::file::{EntryKind, FileEntry};
use crate::models::plan::{Plan, PlanId, PlanStatus};
use crate::security::PathPolicy;
use crate::session::{HistoryEntry, SessionContext};
use crate::validation::confirmation::{ConfirmationAuthority, ConfirmationChallenge, TokenScope};
use crate::validation::{PlanValidator, ValidateOptions};

/// A parsed and validated plan waiting for the caller's decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub plan: Plan,
    pub challenge: Option<ConfirmationChallenge>,
    pub notes: Option<String>,
    pub alternatives: Vec<String>,
}

impl Proposal {
    pub fn status(&self) -> PlanStatus {
        self.plan.status()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.operations().is_empty()
    }

    pub fn needs_confirmation(&self) -> bool {
        self.plan.status() == PlanStatus::AwaitingConfirmation
    }
}

/// What `submit` did with an utterance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SubmitOutcome {
    Proposed(Box<Proposal>),
    Undone(UndoSummary),
    Redone(Box<RedoSummary>),
}

/// One executed plan as shown in the history view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub plan_id: PlanId,
    pub utterance: String,
    pub status: PlanStatus,
    pub operations: usize,
    pub undo: UndoState,
    pub replay_of: Option<PlanId>,
    pub started_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
    Undo,
    Redo,
}

fn follow_up(utterance: &str) -> Option<FollowUp> {
    static UNDO: OnceLock<Option<Regex>> = OnceLock::new();
    static REDO: OnceLock<Option<Regex>> = OnceLock::new();
    let undo = UNDO.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:please\s+)?(?:undo|revert|reverse)(?:\s+(?:that|it|this|last|the\s+last(?:\s+(?:one|change|operation|plan))?))?\s*[.!]*\s*$",
        )
        .ok()
    });
    let redo = REDO.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:please\s+)?(?:redo(?:\s+(?:that|it|this))?|do\s+(?:that|it)\s+again)\s*[.!]*\s*$").ok()
    });

    if undo.as_ref().is_some_and(|re| re.is_match(utterance)) {
        Some(FollowUp::Undo)
    } else if redo.as_ref().is_some_and(|re| re.is_match(utterance)) {
        Some(FollowUp::Redo)
    } else {
        None
    }
}

pub struct Assistant {
    policy: PathPolicy,
    gateway: Arc<dyn FilesystemGateway>,
    holding: Arc<HoldingArea>,
    authority: Arc<ConfirmationAuthority>,
    parser: IntentParser,
    validator: Arc<PlanValidator>,
    engine: Arc<ExecutionEngine>,
    ledger: SharedLedger,
    session: Mutex<SessionContext>,
    pending: Mutex<HashMap<PlanId, Plan>>,
    locks: Arc<PathLockTable>,
    lock_policy: LockPolicy,
    workers: Arc<Semaphore>,
}

impl Assistant {
    pub fn new(config: &AppConfig, model: Arc<dyn LanguageModel>) -> Result<Self> {
        Self::with_gateway(config, model, Arc::new(LocalFs::new()))
    }

    /// Build over any gateway; the holding area and ledger still live on disk
    pub fn with_gateway(
        config: &AppConfig,
        model: Arc<dyn LanguageModel>,
        gateway: Arc<dyn FilesystemGateway>,
    ) -> Result<Self> {
        config.validate()?;
        let mut policy = PathPolicy::new(&config.root)?;
        for path in config.reserved_paths() {
            policy = policy.reserve(&path);
        }

        let holding = Arc::new(HoldingArea::new(
            config.holding.dir.clone(),
            config.holding.retention_days,
        ));
        holding.open()?;
        match holding.purge_expired(Utc::now()) {
            Ok(purged) if !purged.is_empty() => {
                tracing::info!(count = purged.len(), "Purged expired holding entries at start-up")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not purge the holding area"),
        }

        let ledger = if config.ledger.persist {
            UndoLedger::open(&config.ledger.path, gateway.as_ref(), &holding)?
        } else {
            UndoLedger::new()
        };

        let authority = Arc::new(ConfirmationAuthority::new());
        let engine = Arc::new(ExecutionEngine::new(
            policy.clone(),
            Arc::clone(&gateway),
            Arc::clone(&holding),
            Arc::clone(&authority),
        ));
        let validator = Arc::new(
            PlanValidator::new(policy.clone(), Arc::clone(&gateway), Arc::clone(&authority))
                .with_snapshot_limit(config.context.max_snapshot_entries),
        );
        let parser = IntentParser::new(
            model,
            Arc::clone(&gateway),
            policy.clone(),
            config.context.max_listing_entries,
        );
        let session = SessionContext::new(&policy, &config.initial_directory(), config.context.history_len)?;

        tracing::info!(
            root = %policy.root().display(),
            workers = config.workers,
            "Assistant ready"
        );

        Ok(Self {
            policy,
            gateway,
            holding,
            authority,
            parser,
            validator,
            engine,
            ledger: SharedLedger::new(ledger),
            session: Mutex::new(session),
            pending: Mutex::new(HashMap::new()),
            locks: PathLockTable::new(),
            lock_policy: config.locking,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
        })
    }

    fn session(&self) -> Result<MutexGuard<'_, SessionContext>> {
        self.session
            .lock()
            .map_err(|_| Error::InvalidState("session lock poisoned".to_string()))
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashMap<PlanId, Plan>>> {
        self.pending
            .lock()
            .map_err(|_| Error::InvalidState("pending plan table poisoned".to_string()))
    }

    async fn worker(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| Error::InvalidState("worker pool closed".to_string()))
    }

    async fn lock_paths(&self, owner: &str, paths: &[PathBuf]) -> Result<PathLockGuard> {
        self.locks.acquire(owner, paths, self.lock_policy).await
    }

    /// Run `job` on a blocking worker
    async fn blocking<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let _permit = self.worker().await?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| Error::InvalidState(format!("worker task failed: {e}")))?
    }

    /// Interpret an utterance. Returns a proposal (Validated or
    /// AwaitingConfirmation), or runs undo/redo for follow-ups.
    pub async fn submit(&self, utterance: &str, cancel: &CancellationToken) -> Result<SubmitOutcome> {
        match follow_up(utterance) {
            Some(FollowUp::Undo) => {
                let target = self.session()?.last_plan();
                let summary = self.undo(target).await?;
                self.session()?.record(utterance, None);
                return Ok(SubmitOutcome::Undone(summary));
            }
            Some(FollowUp::Redo) => {
                let summary = self.redo(cancel).await?;
                self.session()?.record(utterance, Some(summary.execution.plan_id));
                return Ok(SubmitOutcome::Redone(Box::new(summary)));
            }
            None => {}
        }

        let id = self.ledger.next_plan_id()?;
        let session = self.session()?.clone();
        let outcome = {
            let _permit = self.worker().await?;
            self.parser.parse(id, utterance, &session, cancel).await?
        };
        self.session()?.record(utterance, Some(id));

        let mut plan = outcome.plan;
        if plan.status() == PlanStatus::Failed {
            tracing::info!(plan_id = id.0, "Plan rejected while parsing");
            return Err(Error::Parse {
                plan_id: id,
                issues: plan.parse_issues,
            });
        }

        let validator = Arc::clone(&self.validator);
        let (plan, report) = self
            .blocking(move || {
                let report = validator.validate_and_apply(&mut plan, ValidateOptions::default())?;
                Ok((plan, report))
            })
            .await?;

        tracing::info!(
            plan_id = id.0,
            status = %plan.status(),
            issues = plan.validation_issues.len(),
            "Plan validated"
        );
        if plan.status() == PlanStatus::Failed {
            return Err(Error::Validation {
                plan_id: id,
                issues: plan.issues().cloned().collect(),
            });
        }

        let proposal = Proposal {
            plan: plan.clone(),
            challenge: report.challenge,
            notes: outcome.notes,
            alternatives: outcome.alternatives,
        };
        self.pending()?.insert(id, plan);
        Ok(SubmitOutcome::Proposed(Box::new(proposal)))
    }

    /// A plan still waiting for confirmation or execution
    pub fn pending_plan(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        Ok(self.pending()?.get(&plan_id).cloned())
    }

    /// Drop a pending plan without running it
    pub fn discard(&self, plan_id: PlanId) -> Result<bool> {
        Ok(self.pending()?.remove(&plan_id).is_some())
    }

    /// Approve the destructive operations of a pending plan.
    /// `Permanent` scope is needed when the plan deletes permanently.
    pub async fn confirm(&self, plan_id: PlanId, scope: TokenScope) -> Result<Proposal> {
        let mut plan = self
            .pending()?
            .remove(&plan_id)
            .ok_or_else(|| Error::NotFound(format!("no pending plan {}", plan_id)))?;

        if plan.status() != PlanStatus::AwaitingConfirmation {
            let status = plan.status();
            self.pending()?.insert(plan_id, plan);
            return Err(Error::InvalidState(format!(
                "plan {} is {} and does not need confirmation",
                plan_id, status
            )));
        }

        let challenge = ConfirmationChallenge::for_plan(&plan);
        if scope < challenge.required_scope() {
            self.pending()?.insert(plan_id, plan);
            return Err(Error::ConfirmationRequired { plan_id, challenge });
        }
        plan.confirmation = Some(self.authority.grant(&challenge, scope));

        // State may have moved on since the proposal; check again with the token
        let validator = Arc::clone(&self.validator);
        let (plan, report) = self
            .blocking(move || {
                let report = validator.validate_and_apply(&mut plan, ValidateOptions::default())?;
                Ok((plan, report))
            })
            .await?;

        tracing::info!(plan_id = plan_id.0, scope = ?scope, status = %plan.status(), "Plan confirmed");
        if plan.status() == PlanStatus::Failed {
            return Err(Error::Validation {
                plan_id,
                issues: plan.issues().cloned().collect(),
            });
        }

        let proposal = Proposal {
            plan: plan.clone(),
            challenge: report.challenge,
            notes: None,
            alternatives: Vec::new(),
        };
        self.pending()?.insert(plan_id, plan);
        Ok(proposal)
    }

    /// Run a validated plan. The plan leaves the pending table once it starts running.
    pub async fn execute(&self, plan_id: PlanId, cancel: &CancellationToken) -> Result<ExecutionSummary> {
        let mut plan = self
            .pending()?
            .remove(&plan_id)
            .ok_or_else(|| Error::NotFound(format!("no pending plan {}", plan_id)))?;

        match plan.status() {
            PlanStatus::Validated => {}
            PlanStatus::AwaitingConfirmation => {
                let challenge = ConfirmationChallenge::for_plan(&plan);
                self.pending()?.insert(plan_id, plan);
                return Err(Error::ConfirmationRequired { plan_id, challenge });
            }
            status => {
                return Err(Error::InvalidState(format!(
                    "plan {} is {} and cannot run",
                    plan_id, status
                )))
            }
        }
        if plan.operations().is_empty() {
            return Err(Error::InvalidState(format!("plan {} has no operations", plan_id)));
        }

        let paths = plan.touched_paths();
        let _guard = match self.lock_paths(&format!("plan {}", plan_id), &paths).await {
            Ok(guard) => guard,
            Err(e) => {
                self.pending()?.insert(plan_id, plan);
                return Err(e);
            }
        };

        let engine = Arc::clone(&self.engine);
        let ledger = self.ledger.clone();
        let cancel = cancel.clone();
        let summary = self
            .blocking(move || engine.execute(&mut plan, &ledger, &cancel))
            .await?;
        self.session()?.set_last_plan(plan_id);
        Ok(summary)
    }

    /// Revert the most recent completed plan; with `target`, only if it is that plan
    pub async fn undo(&self, target: Option<PlanId>) -> Result<UndoSummary> {
        let candidate = self.ledger.peek_undo(target)?;
        let _guard = self
            .lock_paths(&format!("undo of plan {}", candidate.plan_id), &candidate.affected)
            .await?;

        let engine = Arc::clone(&self.engine);
        let ledger = self.ledger.clone();
        let plan_id = candidate.plan_id;
        self.blocking(move || ledger.undo(&engine, Some(plan_id))).await
    }

    /// Replay the most recently undone plan if nothing changed since the undo
    pub async fn redo(&self, cancel: &CancellationToken) -> Result<RedoSummary> {
        let candidate = self.ledger.peek_redo(None)?;
        let _guard = self
            .lock_paths(&format!("redo of plan {}", candidate.plan_id), &candidate.affected)
            .await?;

        let engine = Arc::clone(&self.engine);
        let validator = Arc::clone(&self.validator);
        let authority = Arc::clone(&self.authority);
        let ledger = self.ledger.clone();
        let cancel = cancel.clone();
        let plan_id = candidate.plan_id;
        let summary = self
            .blocking(move || ledger.redo(&engine, &validator, &authority, Some(plan_id), &cancel))
            .await?;
        self.session()?.set_last_plan(summary.execution.plan_id);
        Ok(summary)
    }

    pub fn working_directory(&self) -> Result<PathBuf> {
        Ok(self.session()?.working_directory().to_path_buf())
    }

    pub fn root(&self) -> &Path {
        self.policy.root()
    }

    /// Change directory (relative to the current one) and start a fresh conversation
    pub fn change_directory(&self, raw: &str) -> Result<PathBuf> {
        let mut session = self.session()?;
        let path = self.resolve(raw, session.working_directory())?;
        match self.gateway.stat(&path)? {
            Some(stat) if stat.is_dir() => {}
            Some(_) => return Err(Error::InvalidOperation(format!("{} is not a directory", path.display()))),
            None => return Err(Error::NotFound(path.display().to_string())),
        }
        session.set_working_directory(&path)?;
        Ok(path)
    }

    /// Replace the selection with `raw` paths relative to the working directory
    pub fn select(&self, raw: &[String]) -> Result<Vec<PathBuf>> {
        let mut session = self.session()?;
        let mut paths = Vec::with_capacity(raw.len());
        for item in raw {
            let path = self.resolve(item, session.working_directory())?;
            if !self.gateway.exists(&path)? {
                return Err(Error::NotFound(path.display().to_string()));
            }
            paths.push(path);
        }
        session.select(paths.clone())?;
        Ok(paths)
    }

    pub fn selection(&self) -> Result<Vec<PathBuf>> {
        Ok(self.session()?.selection().to_vec())
    }

    pub fn reset_session(&self) -> Result<()> {
        self.session()?.reset();
        self.pending()?.clear();
        tracing::debug!("Session reset");
        Ok(())
    }

    /// Recent utterances of this session, oldest first
    pub fn conversation(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.session()?.history().cloned().collect())
    }

    /// Every plan the ledger knows about, most recent first
    pub fn history(&self) -> Result<Vec<PlanSummary>> {
        let ledger = self.ledger.lock()?;
        let mut summaries: Vec<PlanSummary> = ledger
            .entries()
            .map(|entry| PlanSummary {
                plan_id: entry.plan_id,
                utterance: entry.utterance.clone(),
                status: entry.status,
                operations: entry.operations.len(),
                undo: entry.undo.clone(),
                replay_of: entry.replay_of,
                started_at: entry.started_at,
            })
            .collect();
        summaries.reverse();
        Ok(summaries)
    }

    /// Entries of a directory (the working directory when `raw` is `None`)
    pub fn list(&self, raw: Option<&str>) -> Result<Vec<FileEntry>> {
        let cwd = self.working_directory()?;
        let path = match raw {
            Some(raw) => self.resolve(raw, &cwd)?,
            None => cwd,
        };
        if let Some(stat) = self.gateway.stat(&path)? {
            if stat.kind == EntryKind::Symlink {
                return Err(Error::InvalidOperation(format!(
                    "{} is a symbolic link and is not listed",
                    path.display()
                )));
            }
        }
        Ok(self.gateway.list(&path)?)
    }

    /// Resolve a user path, refusing anything reached through a link below the root
    fn resolve(&self, raw: &str, cwd: &Path) -> Result<PathBuf> {
        let path = self
            .policy
            .resolve(raw, cwd)
            .map_err(|e| Error::InvalidOperation(e.to_string()))?;
        self.policy
            .check_links(&path, self.gateway.as_ref())
            .map_err(|e| Error::InvalidOperation(e.to_string()))?;
        Ok(path)
    }

    pub fn holding_entries(&self) -> Result<Vec<HoldingEntry>> {
        Ok(self.holding.entries()?)
    }

    /// Permanently remove holding entries past their retention period
    pub fn purge_holding(&self) -> Result<Vec<HoldingEntry>> {
        Ok(self.holding.purge_expired(Utc::now())?)
    }

    pub async fn model_status(&self) -> Result<ModelStatus> {
        self.parser.model().status().await
    }
}
