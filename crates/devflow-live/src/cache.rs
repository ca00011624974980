use chrono::{DateTime, Utc};
use devflow_core::{Finding, Phase, Session, SessionStatus, Task, TaskStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

/// A cached collection that can be marked stale as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionKey {
    Tasks,
    Sessions(String),
    Phases(String),
    Findings(String),
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKey::Tasks => f.write_str("tasks"),
            CollectionKey::Sessions(task_id) => write!(f, "sessions[{task_id}]"),
            CollectionKey::Phases(task_id) => write!(f, "phases[{task_id}]"),
            CollectionKey::Findings(task_id) => write!(f, "findings[{task_id}]"),
        }
    }
}

/// Best-known snapshot of server entities.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    tasks: BTreeMap<String, Task>,
    sessions: BTreeMap<String, Session>,
    phases: HashMap<String, Vec<Phase>>,
    findings: HashMap<String, Vec<Finding>>,
    executing: BTreeSet<String>,
    stale: BTreeSet<CollectionKey>,
    revision: u64,
}

impl Cache {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Sessions of one task, oldest first.
    pub fn sessions_for_task(&self, task_id: &str) -> Vec<&Session> {
        let mut sessions = self
            .sessions
            .values()
            .filter(|session| session.task_id == task_id)
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn phases(&self, task_id: &str) -> &[Phase] {
        self.phases.get(task_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn findings(&self, task_id: &str) -> &[Finding] {
        self.findings.get(task_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_executing(&self, task_id: &str) -> bool {
        self.executing.contains(task_id)
    }

    pub fn executing_tasks(&self) -> impl Iterator<Item = &str> {
        self.executing.iter().map(String::as_str)
    }

    pub fn is_stale(&self, key: &CollectionKey) -> bool {
        self.stale.contains(key)
    }

    pub fn stale(&self) -> impl Iterator<Item = &CollectionKey> {
        self.stale.iter()
    }

    /// Bumped once per write that changed anything.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn set_task_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> Option<bool> {
        let task = self.tasks.get_mut(task_id)?;
        if task.status == status {
            return Some(false);
        }
        task.status = status;
        task.updated_at = Some(at);
        Some(true)
    }

    pub(crate) fn insert_session(&mut self, session: Session) -> bool {
        if self.sessions.contains_key(&session.id) {
            return false;
        }
        self.sessions.insert(session.id.clone(), session);
        true
    }

    pub(crate) fn finish_session(
        &mut self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Option<bool> {
        let session = self.sessions.get_mut(session_id)?;
        if session.status == status && session.completed_at.is_some() {
            return Some(false);
        }
        session.status = status;
        session.completed_at = Some(session.completed_at.unwrap_or(at));
        Some(true)
    }

    pub(crate) fn set_executing(&mut self, task_id: &str, executing: bool) -> bool {
        if executing {
            self.executing.insert(task_id.to_string())
        } else {
            self.executing.remove(task_id)
        }
    }

    /// Drops a task and everything keyed by it.
    pub(crate) fn remove_task(&mut self, task_id: &str) -> bool {
        let mut changed = self.tasks.remove(task_id).is_some();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.task_id != task_id);
        changed |= self.sessions.len() != before;
        changed |= self.phases.remove(task_id).is_some();
        changed |= self.findings.remove(task_id).is_some();
        changed |= self.executing.remove(task_id);
        changed
    }

    pub(crate) fn mark_stale(&mut self, key: CollectionKey) {
        self.stale.insert(key);
    }

    pub(crate) fn replace_tasks(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks.into_iter().map(|task| (task.id.clone(), task)).collect();
        self.stale.remove(&CollectionKey::Tasks);
    }

    /// Replaces one task's sessions; the executing flag follows whether any
    /// fetched session is still running.
    pub(crate) fn replace_sessions(&mut self, task_id: &str, sessions: Vec<Session>) {
        let running = sessions
            .iter()
            .any(|session| session.status == SessionStatus::Running);
        self.set_executing(task_id, running);
        self.sessions.retain(|_, session| session.task_id != task_id);
        for session in sessions {
            self.sessions.insert(session.id.clone(), session);
        }
        self.stale.remove(&CollectionKey::Sessions(task_id.to_string()));
    }

    pub(crate) fn replace_phases(&mut self, task_id: &str, phases: Vec<Phase>) {
        self.phases.insert(task_id.to_string(), phases);
        self.stale.remove(&CollectionKey::Phases(task_id.to_string()));
    }

    pub(crate) fn replace_findings(&mut self, task_id: &str, findings: Vec<Finding>) {
        self.findings.insert(task_id.to_string(), findings);
        self.stale.remove(&CollectionKey::Findings(task_id.to_string()));
    }

    pub(crate) fn clear(&mut self) {
        let revision = self.revision;
        *self = Cache {
            revision,
            ..Cache::default()
        };
    }
}

/// Creates a cache with its single writer and a cloneable reader.
pub(crate) fn shared() -> (CacheWriter, CacheReader) {
    let inner = Arc::new(RwLock::new(Cache::default()));
    let (revision_tx, revision_rx) = watch::channel(0);
    (
        CacheWriter {
            inner: inner.clone(),
            revision_tx,
        },
        CacheReader { inner, revision_rx },
    )
}

pub(crate) struct CacheWriter {
    inner: Arc<RwLock<Cache>>,
    revision_tx: watch::Sender<u64>,
}

impl CacheWriter {
    /// Runs `f` under the write lock; `f` reports whether it changed
    /// anything, which bumps and publishes the revision.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut Cache) -> (R, bool)) -> R {
        let mut cache = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let (result, changed) = f(&mut cache);
        if changed {
            cache.revision += 1;
            let revision = cache.revision;
            drop(cache);
            self.revision_tx.send_replace(revision);
        }
        result
    }
}

/// Read-only view handed to consumers.
#[derive(Debug, Clone)]
pub struct CacheReader {
    inner: Arc<RwLock<Cache>>,
    revision_rx: watch::Receiver<u64>,
}

impl CacheReader {
    pub fn read<R>(&self, f: impl FnOnce(&Cache) -> R) -> R {
        let cache = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&cache)
    }

    pub fn snapshot(&self) -> Cache {
        self.read(Cache::clone)
    }

    pub fn revision(&self) -> u64 {
        *self.revision_rx.borrow()
    }

    /// Waits until a write lands after the last revision this reader saw.
    /// Returns `None` once the writer is gone.
    pub async fn changed(&mut self) -> Option<u64> {
        self.revision_rx.changed().await.ok()?;
        Some(*self.revision_rx.borrow_and_update())
    }

    /// Waits until the cache satisfies `predicate`, re-checking on every
    /// write. Returns `false` once the writer is gone.
    pub async fn wait_until(&mut self, mut predicate: impl FnMut(&Cache) -> bool) -> bool {
        loop {
            if self.read(&mut predicate) {
                return true;
            }
            if self.changed().await.is_none() {
                return self.read(&mut predicate);
            }
        }
    }
}
