//! File-backed task store.
//!
//! Layout: `<data_dir>/tasks.json` holds `{"version": 1, "tasks": [...]}`
//! in insertion order, `<data_dir>/tasks.json.lock` serializes writers.
//! Writers swap in a complete new file with an atomic rename, so readers
//! never take the lock and never observe a partial write.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use grab_core::{count_by_status, CancelOutcome, NewTask, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::lock::{RetryPolicy, StoreLock};

const STORE_FILE: &str = "tasks.json";
const LOCK_FILE: &str = "tasks.json.lock";
const STORE_VERSION: u32 = 1;

#[derive(Deserialize)]
struct StoreFile {
    version: u32,
    tasks: Vec<Task>,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    tasks: &'a [Task],
}

/// Process-safe task queue. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    lock_path: PathBuf,
    retry: RetryPolicy,
}

impl TaskStore {
    /// Open the store under `data_dir`, creating the directory if needed.
    ///
    /// A missing store file is an empty queue. A present but unreadable one
    /// fails with [`QueueError::Corruption`] and is left untouched.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, QueueError> {
        Self::open_with(data_dir, RetryPolicy::default())
    }

    pub fn open_with(data_dir: impl AsRef<Path>, retry: RetryPolicy) -> Result<Self, QueueError> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let store = Self {
            path: dir.join(STORE_FILE),
            lock_path: dir.join(LOCK_FILE),
            retry,
        };
        let tasks = store.load()?;
        info!(path = %store.path.display(), tasks = tasks.len(), "task store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn get(&self, id: &TaskId) -> Result<Task, QueueError> {
        self.load()?
            .into_iter()
            .find(|t| t.id == *id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Look a task up by full id or by a unique prefix of its hyphen-less form.
    pub fn resolve(&self, key: &str) -> Result<Task, QueueError> {
        let key = key.trim();
        if let Ok(id) = Uuid::parse_str(key) {
            return self.get(&id);
        }

        let prefix = key.replace('-', "").to_ascii_lowercase();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(QueueError::NotFound(key.to_string()));
        }

        let mut matches = self
            .load()?
            .into_iter()
            .filter(|t| t.id.simple().to_string().starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(task), None) => Ok(task),
            (Some(_), Some(_)) => Err(QueueError::Ambiguous(key.to_string())),
            (None, _) => Err(QueueError::NotFound(key.to_string())),
        }
    }

    /// All tasks in insertion order, optionally restricted to one status.
    pub fn list(&self, filter: Option<TaskStatus>) -> Result<Vec<Task>, QueueError> {
        let mut tasks = self.load()?;
        if let Some(status) = filter {
            tasks.retain(|t| t.status() == status);
        }
        Ok(tasks)
    }

    /// PENDING tasks, highest priority first, then oldest first.
    pub fn pending_by_priority(&self) -> Result<Vec<Task>, QueueError> {
        let mut pending = self.list(Some(TaskStatus::Pending))?;
        // Stable sort keeps insertion order for identical timestamps.
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(pending)
    }

    /// RUNNING and CANCELLING tasks.
    pub fn active(&self) -> Result<Vec<Task>, QueueError> {
        let mut tasks = self.load()?;
        tasks.retain(|t| t.status().is_active());
        Ok(tasks)
    }

    pub fn counts(&self) -> Result<BTreeMap<TaskStatus, usize>, QueueError> {
        Ok(count_by_status(&self.load()?))
    }

    // ── Mutations ────────────────────────────────────────────────

    pub fn add(&self, spec: NewTask) -> Result<TaskId, QueueError> {
        spec.validate()?;
        let id = self.transaction("add", |tasks| {
            let mut id = Uuid::new_v4();
            while tasks.iter().any(|t| t.id == id) {
                id = Uuid::new_v4();
            }
            tasks.push(Task::new(id, spec.clone(), Utc::now()));
            Ok((id, true))
        })?;
        info!(task_id = %id, "task queued");
        Ok(id)
    }

    /// Atomic read-modify-write of one task.
    ///
    /// The mutator runs while the store lock is held and may run again if
    /// the write hits a transient I/O error. An error from the mutator
    /// aborts the transaction without persisting anything.
    pub fn update<T>(
        &self,
        id: &TaskId,
        mut mutator: impl FnMut(&mut Task) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        self.transaction("update", |tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == *id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            let before = task.clone();
            let value = mutator(task)?;
            if !same_submission(&before, task) {
                return Err(QueueError::ImmutableField(id.to_string()));
            }
            let changed = before != *task;
            Ok((value, changed))
        })
    }

    /// PENDING tasks are cancelled outright, RUNNING ones move to
    /// CANCELLING for the scheduler to terminate. Anything else is
    /// reported back unchanged.
    pub fn cancel(&self, id: &TaskId) -> Result<CancelOutcome, QueueError> {
        let outcome = self.update(id, |task| Ok(task.request_cancel(Utc::now())))?;
        match outcome {
            CancelOutcome::NotCancellable(status) => {
                debug!(task_id = %id, %status, "cancel ignored")
            }
            _ => info!(task_id = %id, status = %outcome.status(), "task cancel requested"),
        }
        Ok(outcome)
    }

    /// Drop terminal tasks that finished more than `max_age` ago.
    pub fn cleanup(&self, max_age: chrono::Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - max_age;
        let removed = self.transaction("cleanup", |tasks| {
            let before = tasks.len();
            tasks.retain(|t| {
                !(t.status().is_terminal() && t.finished_at.is_some_and(|at| at < cutoff))
            });
            let removed = before - tasks.len();
            Ok((removed, removed > 0))
        })?;
        if removed > 0 {
            info!(removed, "expired tasks removed");
        }
        Ok(removed)
    }

    // ── Internals ────────────────────────────────────────────────

    /// Run `body` under the store lock against a fresh copy of the queue,
    /// persisting the result when it reports a change. Transient I/O
    /// failures retry the whole transaction with backoff.
    fn transaction<T>(
        &self,
        op: &'static str,
        mut body: impl FnMut(&mut Vec<Task>) -> Result<(T, bool), QueueError>,
    ) -> Result<T, QueueError> {
        let attempts = self.retry.io_attempts.max(1);
        let mut delay = self.retry.initial_delay;
        let mut attempt = 1;
        loop {
            match self.try_transaction(&mut body) {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(op, attempt, error = %e, "store mutation failed, retrying");
                    std::thread::sleep(delay);
                    delay = self.retry.next_delay(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn try_transaction<T>(
        &self,
        body: &mut impl FnMut(&mut Vec<Task>) -> Result<(T, bool), QueueError>,
    ) -> Result<T, QueueError> {
        let _guard = StoreLock::acquire(&self.lock_path, &self.retry)?;
        let mut tasks = self.load()?;
        let (value, changed) = body(&mut tasks)?;
        if changed {
            self.persist(&tasks)?;
        }
        Ok(value)
    }

    fn load(&self) -> Result<Vec<Task>, QueueError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        // `touch tasks.json` leaves a zero-length file; treat it as empty.
        if bytes.is_empty() {
            return Ok(Vec::new());
        }

        let file: StoreFile = serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e))?;
        if file.version != STORE_VERSION {
            return Err(self.corrupt(format!("unsupported store version {}", file.version)));
        }
        let mut seen = std::collections::HashSet::with_capacity(file.tasks.len());
        if let Some(dup) = file.tasks.iter().find(|t| !seen.insert(t.id)) {
            return Err(self.corrupt(format!("duplicate task id {}", dup.id)));
        }
        Ok(file.tasks)
    }

    fn persist(&self, tasks: &[Task]) -> Result<(), QueueError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(
            &mut tmp,
            &StoreFileRef {
                version: STORE_VERSION,
                tasks,
            },
        )?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| QueueError::Io(e.error))?;

        // Make the rename itself durable.
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
        debug!(path = %self.path.display(), tasks = tasks.len(), "task store persisted");
        Ok(())
    }

    fn corrupt(&self, reason: impl ToString) -> QueueError {
        QueueError::Corruption {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Fields fixed at submission time are untouched.
fn same_submission(a: &Task, b: &Task) -> bool {
    a.id == b.id
        && a.name == b.name
        && a.command == b.command
        && a.working_dir == b.working_dir
        && a.env == b.env
        && a.requirements == b.requirements
        && a.priority == b.priority
        && a.created_at == b.created_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use grab_core::ResourceRequirement;

    fn new_task(command: &str, priority: i64) -> NewTask {
        NewTask {
            name: String::new(),
            command: command.to_string(),
            working_dir: None,
            env: BTreeMap::new(),
            requirements: ResourceRequirement::default(),
            priority,
        }
    }

    fn open() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_file_is_empty_queue() {
        let (_dir, store) = open();
        assert!(store.list(None).unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn reload_preserves_tasks_and_order() {
        let (dir, store) = open();
        let a = store.add(new_task("echo a", 0)).unwrap();
        let b = store.add(new_task("echo b", 3)).unwrap();
        store
            .update(&b, |t| Ok(t.mark_running(4242, vec![1], "/tmp/b.log".into(), Utc::now())?))
            .unwrap();

        let before = store.list(None).unwrap();
        let reopened = TaskStore::open(dir.path()).unwrap();
        let after = reopened.list(None).unwrap();
        assert_eq!(before, after);
        assert_eq!(after.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(after[1].pid, Some(4242));
    }

    #[test]
    fn malformed_file_is_fatal_and_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        std::fs::write(&path, b"{\"version\": 1, \"tasks\": [").unwrap();

        let err = TaskStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, QueueError::Corruption { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"version\": 1, \"tasks\": [");
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STORE_FILE), br#"{"version": 9, "tasks": []}"#).unwrap();
        assert!(matches!(
            TaskStore::open(dir.path()),
            Err(QueueError::Corruption { .. })
        ));
    }

    #[test]
    fn pending_orders_by_priority_then_age() {
        let (_dir, store) = open();
        let low = store.add(new_task("low", 5)).unwrap();
        let first_mid = store.add(new_task("mid", 7)).unwrap();
        let high = store.add(new_task("high", 10)).unwrap();
        let second_mid = store.add(new_task("mid again", 7)).unwrap();

        let order: Vec<_> = store.pending_by_priority().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(order, vec![high, first_mid, second_mid, low]);
    }

    #[test]
    fn failed_mutator_persists_nothing() {
        let (_dir, store) = open();
        let id = store.add(new_task("sleep 1", 0)).unwrap();

        let err = store
            .update(&id, |t| {
                t.pid = Some(1);
                t.transition(TaskStatus::Completed)?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition(_)));

        let task = store.get(&id).unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.pid, None);
    }

    #[test]
    fn submission_fields_are_immutable() {
        let (_dir, store) = open();
        let id = store.add(new_task("echo hi", 0)).unwrap();
        let err = store
            .update(&id, |t| {
                t.command = "rm -rf /".into();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, QueueError::ImmutableField(_)));
        assert_eq!(store.get(&id).unwrap().command, "echo hi");
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let (_dir, store) = open();
        let err = store.update(&Uuid::new_v4(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[test]
    fn cancel_pending_then_again_is_noop() {
        let (_dir, store) = open();
        let id = store.add(new_task("sleep 60", 0)).unwrap();

        assert_eq!(store.cancel(&id).unwrap(), CancelOutcome::Cancelled);
        let cancelled = store.get(&id).unwrap();
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);

        assert_eq!(
            store.cancel(&id).unwrap(),
            CancelOutcome::NotCancellable(TaskStatus::Cancelled)
        );
        assert_eq!(store.get(&id).unwrap(), cancelled);
    }

    #[test]
    fn cancel_running_moves_to_cancelling() {
        let (_dir, store) = open();
        let id = store.add(new_task("sleep 60", 0)).unwrap();
        store
            .update(&id, |t| Ok(t.mark_running(99, vec![0], "/tmp/x.log".into(), Utc::now())?))
            .unwrap();

        assert_eq!(store.cancel(&id).unwrap(), CancelOutcome::Cancelling);
        assert_eq!(store.get(&id).unwrap().status(), TaskStatus::Cancelling);
        assert_eq!(
            store.cancel(&id).unwrap(),
            CancelOutcome::NotCancellable(TaskStatus::Cancelling)
        );
    }

    #[test]
    fn resolve_by_prefix() {
        let (_dir, store) = open();
        let id = store.add(new_task("echo", 0)).unwrap();
        let simple = id.simple().to_string();

        assert_eq!(store.resolve(&simple[..6]).unwrap().id, id);
        assert_eq!(store.resolve(&id.to_string()).unwrap().id, id);
        assert_eq!(store.resolve(&simple.to_uppercase()[..8]).unwrap().id, id);
        assert!(matches!(store.resolve("zzzz"), Err(QueueError::NotFound(_))));
        assert!(matches!(store.resolve(""), Err(QueueError::NotFound(_))));
    }

    #[test]
    fn resolve_reports_ambiguity() {
        let (_dir, store) = open();
        // Enough tasks that some single hex digit prefix repeats.
        for i in 0..40 {
            store.add(new_task(&format!("echo {i}"), 0)).unwrap();
        }
        let ids: Vec<String> = store
            .list(None)
            .unwrap()
            .iter()
            .map(|t| t.id.simple().to_string())
            .collect();
        let shared = ids
            .iter()
            .map(|s| &s[..1])
            .find(|p| ids.iter().filter(|s| s.starts_with(*p)).count() > 1)
            .unwrap();
        assert!(matches!(store.resolve(shared), Err(QueueError::Ambiguous(_))));
    }

    #[test]
    fn cleanup_only_removes_old_terminal_tasks() {
        let (_dir, store) = open();
        let old_done = store.add(new_task("old", 0)).unwrap();
        let fresh_done = store.add(new_task("fresh", 0)).unwrap();
        let pending = store.add(new_task("waiting", 0)).unwrap();
        let running = store.add(new_task("busy", 0)).unwrap();

        let long_ago = Utc::now() - chrono::Duration::days(30);
        store
            .update(&old_done, |t| {
                t.mark_running(1, vec![0], "/tmp/o.log".into(), long_ago)?;
                Ok(t.mark_exited(0, long_ago)?)
            })
            .unwrap();
        store.cancel(&fresh_done).unwrap();
        store
            .update(&running, |t| Ok(t.mark_running(2, vec![1], "/tmp/r.log".into(), long_ago)?))
            .unwrap();

        assert_eq!(store.cleanup(chrono::Duration::days(7)).unwrap(), 1);
        let left: Vec<_> = store.list(None).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(left, vec![fresh_done, pending, running]);
        assert_eq!(store.cleanup(chrono::Duration::days(7)).unwrap(), 0);
    }

    #[test]
    fn counts_cover_every_status() {
        let (_dir, store) = open();
        let id = store.add(new_task("a", 0)).unwrap();
        store.add(new_task("b", 0)).unwrap();
        store.cancel(&id).unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts.len(), TaskStatus::ALL.len());
        assert_eq!(counts[&TaskStatus::Pending], 1);
        assert_eq!(counts[&TaskStatus::Cancelled], 1);
        assert_eq!(counts[&TaskStatus::Running], 0);
    }

    #[test]
    fn invalid_submission_is_rejected() {
        let (_dir, store) = open();
        let err = store.add(new_task("   ", 0)).unwrap_err();
        assert!(matches!(err, QueueError::Invalid(_)));
        assert!(store.list(None).unwrap().is_empty());
    }
}
