//! End-to-end scenarios through the `Assistant`, with a scripted model in
//! place of the model service and real files in a temporary directory.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use automanager::ai::{LanguageModel, ModelRequest, ModelStatus};
use automanager::config::{HoldingConfig, LedgerConfig};
use automanager::execution::{FailureKind, LockPolicy};
use automanager::gateway::{FilesystemGateway, GatewayError, GatewayErrorKind, GatewayResult, LocalFs};
use automanager::ledger::UndoState;
use automanager::models::{FileEntry, IssueCode, PathStat, PlanStatus};
use automanager::validation::confirmation::TokenScope;
use automanager::{AppConfig, Assistant, Error, Proposal, SubmitOutcome};

/// Replies with canned responses in order
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &ModelRequest) -> automanager::Result<String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Model("script exhausted".to_string()))
    }

    async fn status(&self) -> automanager::Result<ModelStatus> {
        Ok(ModelStatus {
            endpoint: "scripted".to_string(),
            model: "scripted".to_string(),
            reachable: true,
            model_available: true,
            available_models: vec!["scripted".to_string()],
            detail: None,
        })
    }
}

/// Local filesystem whose nth mutation fails with PermissionDenied
struct FaultyGateway {
    inner: LocalFs,
    fail_at: usize,
    mutations: AtomicUsize,
}

impl FaultyGateway {
    fn new(fail_at: usize) -> Self {
        Self {
            inner: LocalFs::new(),
            fail_at,
            mutations: AtomicUsize::new(0),
        }
    }

    fn check(&self, path: &Path) -> GatewayResult<()> {
        let n = self.mutations.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_at {
            return Err(GatewayError::new(
                GatewayErrorKind::PermissionDenied,
                path,
                "injected failure",
            ));
        }
        Ok(())
    }
}

impl FilesystemGateway for FaultyGateway {
    fn list(&self, path: &Path) -> GatewayResult<Vec<FileEntry>> {
        self.inner.list(path)
    }

    fn stat(&self, path: &Path) -> GatewayResult<Option<PathStat>> {
        self.inner.stat(path)
    }

    fn move_path(&self, from: &Path, to: &Path) -> GatewayResult<()> {
        self.check(from)?;
        self.inner.move_path(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> GatewayResult<()> {
        self.check(from)?;
        self.inner.copy(from, to)
    }

    fn delete(&self, path: &Path, recursive: bool) -> GatewayResult<()> {
        self.check(path)?;
        self.inner.delete(path, recursive)
    }

    fn create_directory(&self, path: &Path) -> GatewayResult<()> {
        self.check(path)?;
        self.inner.create_directory(path)
    }

    fn create_file(&self, path: &Path) -> GatewayResult<()> {
        self.check(path)?;
        self.inner.create_file(path)
    }
}

/// Local filesystem that parks inside `create_file` for files named `slow.txt`
struct GatedGateway {
    inner: LocalFs,
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl FilesystemGateway for GatedGateway {
    fn list(&self, path: &Path) -> GatewayResult<Vec<FileEntry>> {
        self.inner.list(path)
    }

    fn stat(&self, path: &Path) -> GatewayResult<Option<PathStat>> {
        self.inner.stat(path)
    }

    fn move_path(&self, from: &Path, to: &Path) -> GatewayResult<()> {
        self.inner.move_path(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> GatewayResult<()> {
        self.inner.copy(from, to)
    }

    fn delete(&self, path: &Path, recursive: bool) -> GatewayResult<()> {
        self.inner.delete(path, recursive)
    }

    fn create_directory(&self, path: &Path) -> GatewayResult<()> {
        self.inner.create_directory(path)
    }

    fn create_file(&self, path: &Path) -> GatewayResult<()> {
        if path.file_name().is_some_and(|n| n == "slow.txt") {
            if let Some(entered) = self.entered.lock().unwrap().take() {
                let _ = entered.send(());
            }
            let _ = self.release.lock().unwrap().recv();
        }
        self.inner.create_file(path)
    }
}

struct Env {
    dir: TempDir,
    root: PathBuf,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        Self { dir, root }
    }

    fn config(&self) -> AppConfig {
        AppConfig {
            root: self.root.clone(),
            holding: HoldingConfig {
                dir: self.dir.path().join("holding"),
                retention_days: 30,
            },
            ledger: LedgerConfig {
                persist: true,
                path: self.dir.path().join("state/ledger.jsonl"),
            },
            locking: LockPolicy::Reject,
            workers: 4,
            ..AppConfig::default()
        }
    }

    fn assistant(&self, replies: &[&str]) -> Assistant {
        Assistant::new(&self.config(), ScriptedModel::new(replies)).unwrap()
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    /// Every path under the root with file contents (directories map to None)
    fn tree(&self) -> BTreeMap<PathBuf, Option<String>> {
        walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(&self.root).unwrap().to_path_buf();
                let contents = if e.file_type().is_dir() {
                    None
                } else {
                    Some(fs::read_to_string(e.path()).unwrap())
                };
                (rel, contents)
            })
            .collect()
    }
}

const ARCHIVE_PLAN: &str = r#"Sure, here is the plan:
```json
{
  "operations": [
    {"op": "create_directory", "path": "archive"},
    {"op": "move", "sources": ["a.txt"], "destination": "archive/"},
    {"op": "move", "sources": ["b.txt"], "destination": "archive/"}
  ],
  "ambiguous": false,
  "alternatives": [],
  "notes": "Moving both files into a new archive folder."
}
```"#;

fn proposed(outcome: SubmitOutcome) -> Proposal {
    match outcome {
        SubmitOutcome::Proposed(proposal) => *proposal,
        other => panic!("expected a proposal, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delete_requires_confirmation() {
    let env = Env::new();
    env.write("report.txt", "q3 numbers");
    let assistant = env.assistant(&[r#"{"operations": [{"op": "delete", "sources": ["report.txt"]}]}"#]);
    let cancel = CancellationToken::new();

    let proposal = proposed(assistant.submit("delete report.txt", &cancel).await.unwrap());
    assert_eq!(proposal.status(), PlanStatus::AwaitingConfirmation);
    let challenge = proposal.challenge.clone().unwrap();
    assert_eq!(challenge.destructive_operations, vec![0]);
    assert!(!challenge.requires_permanent);

    // Without confirmation nothing runs
    let err = assistant.execute(proposal.plan.id, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::ConfirmationRequired { .. }));
    assert!(env.root.join("report.txt").exists());

    let confirmed = assistant.confirm(proposal.plan.id, TokenScope::Standard).await.unwrap();
    assert_eq!(confirmed.status(), PlanStatus::Validated);

    let summary = assistant.execute(proposal.plan.id, &cancel).await.unwrap();
    assert_eq!(summary.status, PlanStatus::Completed);
    assert_eq!(summary.records.len(), 1);
    assert!(!env.root.join("report.txt").exists());

    let held = assistant.holding_entries().unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].original_path, env.root.join("report.txt"));
}

#[tokio::test]
async fn test_permanent_delete_needs_permanent_scope() {
    let env = Env::new();
    env.write("cache.bin", "x");
    let assistant = env.assistant(&[
        r#"{"operations": [{"op": "delete", "sources": ["cache.bin"], "permanent": true}]}"#,
    ]);
    let cancel = CancellationToken::new();

    let proposal = proposed(assistant.submit("permanently delete cache.bin", &cancel).await.unwrap());
    assert!(proposal.challenge.as_ref().unwrap().requires_permanent);
    assert!(proposal
        .plan
        .issues()
        .any(|i| i.code == IssueCode::IrreversibleDelete));

    let err = assistant.confirm(proposal.plan.id, TokenScope::Standard).await.unwrap_err();
    assert!(matches!(err, Error::ConfirmationRequired { .. }));

    assistant.confirm(proposal.plan.id, TokenScope::Permanent).await.unwrap();
    assistant.execute(proposal.plan.id, &cancel).await.unwrap();
    assert!(!env.root.join("cache.bin").exists());
    assert!(assistant.holding_entries().unwrap().is_empty());

    let err = assistant.undo(None).await.unwrap_err();
    assert!(matches!(err, Error::UndoUnavailable(_)));
}

#[tokio::test]
async fn test_archive_move_and_undo() {
    let env = Env::new();
    env.write("a.txt", "alpha");
    env.write("b.txt", "beta");
    let before = env.tree();
    let assistant = env.assistant(&[ARCHIVE_PLAN]);
    let cancel = CancellationToken::new();

    let proposal = proposed(
        assistant
            .submit("move a.txt and b.txt into archive/", &cancel)
            .await
            .unwrap(),
    );
    assert_eq!(proposal.status(), PlanStatus::Validated);
    assert_eq!(proposal.plan.operations().len(), 3);
    assert_eq!(
        proposal.plan.operations()[1].destination(),
        Some(env.root.join("archive/a.txt").as_path())
    );

    let summary = assistant.execute(proposal.plan.id, &cancel).await.unwrap();
    assert_eq!(summary.status, PlanStatus::Completed);
    assert_eq!(summary.records.len(), 3);
    assert_eq!(fs::read_to_string(env.root.join("archive/b.txt")).unwrap(), "beta");

    match assistant.submit("undo that", &cancel).await.unwrap() {
        SubmitOutcome::Undone(undo) => assert_eq!(undo.plan_id, proposal.plan.id),
        other => panic!("expected undo, got {:?}", other),
    }
    assert_eq!(env.tree(), before);
}

#[tokio::test]
async fn test_failure_midway_rolls_back() {
    let env = Env::new();
    env.write("a.txt", "alpha");
    env.write("b.txt", "beta");
    let before = env.tree();
    // Mutation 1 creates archive/, mutation 2 is the first move
    let assistant = Assistant::with_gateway(
        &env.config(),
        ScriptedModel::new(&[ARCHIVE_PLAN]),
        Arc::new(FaultyGateway::new(2)),
    )
    .unwrap();
    let cancel = CancellationToken::new();

    let proposal = proposed(assistant.submit("archive a and b", &cancel).await.unwrap());
    let err = assistant.execute(proposal.plan.id, &cancel).await.unwrap_err();
    let report = match err {
        Error::Execution(report) => report,
        other => panic!("expected a rolled back execution, got {:?}", other),
    };
    assert_eq!(report.failed_index, 1);
    assert_eq!(report.kind, FailureKind::Gateway(GatewayErrorKind::PermissionDenied));
    assert_eq!(report.completed, vec![0]);
    assert!(report.rollback_complete());
    assert_eq!(env.tree(), before);

    let history = assistant.history().unwrap();
    assert_eq!(history[0].status, PlanStatus::RolledBack);
    assert!(matches!(assistant.undo(None).await, Err(Error::UndoUnavailable(_))));
}

#[tokio::test]
async fn test_redo_only_on_unchanged_state() {
    let env = Env::new();
    env.write("a.txt", "alpha");
    env.write("b.txt", "beta");
    let assistant = env.assistant(&[ARCHIVE_PLAN]);
    let cancel = CancellationToken::new();

    let proposal = proposed(assistant.submit("archive a and b", &cancel).await.unwrap());
    assistant.execute(proposal.plan.id, &cancel).await.unwrap();
    assistant.undo(None).await.unwrap();

    let redo = match assistant.submit("redo", &cancel).await.unwrap() {
        SubmitOutcome::Redone(redo) => redo,
        other => panic!("expected redo, got {:?}", other),
    };
    assert_eq!(redo.original, proposal.plan.id);
    assert_eq!(redo.execution.status, PlanStatus::Completed);
    assert!(env.root.join("archive/a.txt").exists());

    // Undo the replay, then touch one of the files
    assistant.undo(None).await.unwrap();
    env.write("a.txt", "alpha, edited afterwards");
    let err = assistant.redo(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::RedoStateStale { .. }));
    assert!(!env.root.join("archive").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_plans_are_rejected() {
    let env = Env::new();
    env.write("docs/readme.md", "hi");
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gateway = GatedGateway {
        inner: LocalFs::new(),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    };
    let assistant = Arc::new(
        Assistant::with_gateway(
            &env.config(),
            ScriptedModel::new(&[
                r#"{"operations": [{"op": "create_file", "path": "docs/slow.txt"}]}"#,
                r#"{"operations": [{"op": "rename", "source": "docs", "new_name": "papers"}]}"#,
                r#"{"operations": [{"op": "create_directory", "path": "music"}]}"#,
            ]),
            Arc::new(gateway),
        )
        .unwrap(),
    );
    let cancel = CancellationToken::new();

    let slow = proposed(assistant.submit("create docs/slow.txt", &cancel).await.unwrap());
    let overlapping = proposed(assistant.submit("rename docs to papers", &cancel).await.unwrap());
    let disjoint = proposed(assistant.submit("make a music folder", &cancel).await.unwrap());

    let running = {
        let assistant = Arc::clone(&assistant);
        let id = slow.plan.id;
        tokio::spawn(async move { assistant.execute(id, &CancellationToken::new()).await })
    };
    entered_rx.await.unwrap();

    let err = assistant.execute(overlapping.plan.id, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Locked(_)), "{:?}", err);
    // The refused plan stays pending
    assert!(assistant.pending_plan(overlapping.plan.id).unwrap().is_some());
    assistant.execute(disjoint.plan.id, &cancel).await.unwrap();
    assert!(env.root.join("music").is_dir());

    release_tx.send(()).unwrap();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.status, PlanStatus::Completed);
    assert!(env.root.join("docs/slow.txt").exists());
    assert!(!env.root.join("papers").exists());

    let summary = assistant.execute(overlapping.plan.id, &cancel).await.unwrap();
    assert_eq!(summary.status, PlanStatus::Completed);
    assert!(env.root.join("papers/readme.md").exists());
    assert!(assistant.pending_plan(overlapping.plan.id).unwrap().is_none());
}

#[tokio::test]
async fn test_traversal_is_rejected() {
    let env = Env::new();
    fs::write(env.dir.path().join("secret.txt"), "keep out").unwrap();
    env.write("inbox.txt", "x");
    let assistant = env.assistant(&[
        r#"{"operations": [{"op": "move", "sources": ["inbox.txt"], "destination": "../secret.txt", "overwrite": true}]}"#,
    ]);

    let err = assistant
        .submit("replace the secret", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Parse { .. }));
    assert!(err.issues().iter().any(|i| i.code == IssueCode::PathOutsideRoot));
    assert_eq!(
        fs::read_to_string(env.dir.path().join("secret.txt")).unwrap(),
        "keep out"
    );
    assert!(env.root.join("inbox.txt").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_linked_folder_cannot_reach_outside() {
    let env = Env::new();
    let outside = env.dir.path().join("outside");
    fs::create_dir(&outside).unwrap();
    fs::write(outside.join("secret.txt"), "keep out").unwrap();
    std::os::unix::fs::symlink(&outside, env.root.join("link")).unwrap();
    let assistant = env.assistant(&[r#"{"operations": [{"op": "delete", "sources": ["link/secret.txt"]}]}"#]);

    let err = assistant
        .submit("delete link/secret.txt", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }), "{:?}", err);
    assert!(err.issues().iter().any(|i| i.code == IssueCode::PathOutsideRoot));
    assert_eq!(fs::read_to_string(outside.join("secret.txt")).unwrap(), "keep out");
    assert!(assistant.holding_entries().unwrap().is_empty());

    assert!(assistant.list(Some("link")).is_err());
    assert!(assistant.change_directory("link").is_err());
    assert!(assistant.select(&["link/secret.txt".to_string()]).is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_folder_swapped_for_link_after_confirmation() {
    let env = Env::new();
    env.write("docs/secret.txt", "inside");
    let outside = env.dir.path().join("outside");
    fs::create_dir(&outside).unwrap();
    fs::write(outside.join("secret.txt"), "keep out").unwrap();
    let assistant = env.assistant(&[r#"{"operations": [{"op": "delete", "sources": ["docs/secret.txt"]}]}"#]);
    let cancel = CancellationToken::new();

    let proposal = proposed(assistant.submit("delete docs/secret.txt", &cancel).await.unwrap());
    assistant.confirm(proposal.plan.id, TokenScope::Standard).await.unwrap();

    fs::rename(env.root.join("docs"), env.dir.path().join("docs-moved")).unwrap();
    std::os::unix::fs::symlink(&outside, env.root.join("docs")).unwrap();

    let err = assistant.execute(proposal.plan.id, &cancel).await.unwrap_err();
    let report = match err {
        Error::Execution(report) => report,
        other => panic!("expected a refused execution, got {:?}", other),
    };
    assert_eq!(report.kind, FailureKind::StateDrift);
    assert_eq!(fs::read_to_string(outside.join("secret.txt")).unwrap(), "keep out");
    assert!(assistant.holding_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_plan_is_not_executed() {
    let env = Env::new();
    let assistant = env.assistant(&[
        r#"{"operations": [], "notes": "That does not sound like a file request."}"#,
    ]);
    let cancel = CancellationToken::new();

    let proposal = proposed(assistant.submit("what's the weather", &cancel).await.unwrap());
    assert!(proposal.is_empty());
    assert!(proposal.plan.issues().any(|i| i.code == IssueCode::EmptyPlan));
    assert_eq!(proposal.notes.as_deref(), Some("That does not sound like a file request."));

    let err = assistant.execute(proposal.plan.id, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(assistant.history().unwrap().is_empty());
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let env = Env::new();
    env.write("a.txt", "alpha");
    env.write("b.txt", "beta");
    let before = env.tree();

    let first_id = {
        let assistant = env.assistant(&[ARCHIVE_PLAN]);
        let cancel = CancellationToken::new();
        let proposal = proposed(assistant.submit("archive a and b", &cancel).await.unwrap());
        assistant.execute(proposal.plan.id, &cancel).await.unwrap();
        proposal.plan.id
    };

    let assistant = env.assistant(&[r#"{"operations": [{"op": "create_file", "path": "c.txt"}]}"#]);
    let history = assistant.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].plan_id, first_id);
    assert_eq!(history[0].undo, UndoState::Undoable);

    // Plan ids keep increasing across restarts
    let next = proposed(
        assistant
            .submit("make c.txt", &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert!(next.plan.id > first_id);
    assistant.discard(next.plan.id).unwrap();

    assistant.undo(Some(first_id)).await.unwrap();
    assert_eq!(env.tree(), before);
}

#[tokio::test]
async fn test_session_follows_directory_changes() {
    let env = Env::new();
    env.write("photos/cat.jpg", "meow");
    let assistant = env.assistant(&[
        r#"{"operations": [{"op": "rename", "source": "cat.jpg", "new_name": "kitty.jpg"}]}"#,
    ]);
    let cancel = CancellationToken::new();

    assert!(assistant.change_directory("../..").is_err());
    assert_eq!(assistant.change_directory("photos").unwrap(), env.root.join("photos"));
    assistant.select(&["cat.jpg".to_string()]).unwrap();
    assert_eq!(assistant.selection().unwrap(), vec![env.root.join("photos/cat.jpg")]);

    let proposal = proposed(assistant.submit("rename it to kitty", &cancel).await.unwrap());
    assistant.execute(proposal.plan.id, &cancel).await.unwrap();
    assert!(env.root.join("photos/kitty.jpg").exists());
    assert_eq!(assistant.conversation().unwrap().len(), 1);

    assistant.reset_session().unwrap();
    assert!(assistant.conversation().unwrap().is_empty());
    assert!(assistant.selection().unwrap().is_empty());
}
