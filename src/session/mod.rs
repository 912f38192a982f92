//! Conversational state for one user session.
//!
//! The context is an explicitly owned value handed to the intent parser; it
//! only stores plan ids, never plans. Changing the working directory or
//! calling [`SessionContext::reset`] clears everything conversational.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::plan::PlanId;
use crate::security::{normalize_path, PathPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub utterance: String,
    pub plan_id: Option<PlanId>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    root: PathBuf,
    working_directory: PathBuf,
    selection: Vec<PathBuf>,
    history: VecDeque<HistoryEntry>,
    history_len: usize,
    last_plan: Option<PlanId>,
}

impl SessionContext {
    pub fn new(policy: &PathPolicy, working_directory: &Path, history_len: usize) -> Result<Self> {
        let working_directory = normalize_path(working_directory);
        if !policy.is_within_root(&working_directory) {
            return Err(Error::InvalidState(format!(
                "working directory {} is outside {}",
                working_directory.display(),
                policy.root().display()
            )));
        }
        Ok(Self {
            root: policy.root().to_path_buf(),
            working_directory,
            selection: Vec::new(),
            history: VecDeque::with_capacity(history_len),
            history_len: history_len.max(1),
            last_plan: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn selection(&self) -> &[PathBuf] {
        &self.selection
    }

    pub fn last_plan(&self) -> Option<PlanId> {
        self.last_plan
    }

    /// Oldest first
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Remember an utterance and the plan it produced, evicting the oldest entry
    pub fn record(&mut self, utterance: &str, plan_id: Option<PlanId>) {
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            utterance: utterance.to_string(),
            plan_id,
            at: Utc::now(),
        });
        if plan_id.is_some() {
            self.last_plan = plan_id;
        }
    }

    /// Point the session at the most recently executed plan
    pub fn set_last_plan(&mut self, plan_id: PlanId) {
        self.last_plan = Some(plan_id);
    }

    /// Replace the selection; every path must be inside the root
    pub fn select(&mut self, paths: Vec<PathBuf>) -> Result<()> {
        let mut selection = Vec::with_capacity(paths.len());
        for path in paths {
            let path = normalize_path(&path);
            if !path.starts_with(&self.root) {
                return Err(Error::InvalidState(format!(
                    "{} is outside {}",
                    path.display(),
                    self.root.display()
                )));
            }
            selection.push(path);
        }
        self.selection = selection;
        Ok(())
    }

    /// Change directory and start a fresh conversation
    pub fn set_working_directory(&mut self, path: &Path) -> Result<()> {
        let path = normalize_path(path);
        if !path.starts_with(&self.root) {
            return Err(Error::InvalidState(format!(
                "{} is outside {}",
                path.display(),
                self.root.display()
            )));
        }
        tracing::debug!(from = %self.working_directory.display(), to = %path.display(), "working directory changed");
        self.working_directory = path;
        self.clear();
        Ok(())
    }

    /// Forget conversational state, keep the working directory
    pub fn reset(&mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        self.history.clear();
        self.selection.clear();
        self.last_plan = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(len: usize) -> SessionContext {
        let policy = PathPolicy::new(Path::new("/srv/files")).unwrap();
        SessionContext::new(&policy, Path::new("/srv/files/docs"), len).unwrap()
    }

    #[test]
    fn test_history_is_bounded() {
        let mut session = session(2);
        session.record("first", Some(PlanId(1)));
        session.record("second", None);
        session.record("third", Some(PlanId(3)));

        let utterances: Vec<&str> = session.history().map(|h| h.utterance.as_str()).collect();
        assert_eq!(utterances, vec!["second", "third"]);
        assert_eq!(session.last_plan(), Some(PlanId(3)));
    }

    #[test]
    fn test_directory_change_clears_context() {
        let mut session = session(5);
        session.record("move a", Some(PlanId(1)));
        session.select(vec!["/srv/files/docs/a.txt".into()]).unwrap();

        session.set_working_directory(Path::new("/srv/files/music")).unwrap();

        assert_eq!(session.working_directory(), Path::new("/srv/files/music"));
        assert_eq!(session.history().count(), 0);
        assert!(session.selection().is_empty());
        assert_eq!(session.last_plan(), None);
    }

    #[test]
    fn test_cannot_leave_root() {
        let mut session = session(5);
        assert!(session.set_working_directory(Path::new("/srv/files/../etc")).is_err());
        assert!(session.select(vec!["/etc/passwd".into()]).is_err());
        assert_eq!(session.working_directory(), Path::new("/srv/files/docs"));
    }

    #[test]
    fn test_reset_keeps_directory() {
        let mut session = session(5);
        session.record("x", Some(PlanId(9)));
        session.reset();
        assert_eq!(session.last_plan(), None);
        assert_eq!(session.working_directory(), Path::new("/srv/files/docs"));
    }
}
