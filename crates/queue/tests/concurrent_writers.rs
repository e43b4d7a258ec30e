//! Several independent store handles on one directory behave like
//! separate processes: each opens its own lock file descriptor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use grab_core::{CancelOutcome, NewTask, TaskStatus};
use grab_queue::{RetryPolicy, TaskStore};

fn patient() -> RetryPolicy {
    RetryPolicy {
        lock_attempts: 200,
        io_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(20),
    }
}

fn job(command: String) -> NewTask {
    NewTask {
        command,
        ..Default::default()
    }
}

#[test]
fn concurrent_submitters_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let writers = 8;
    let per_writer = 25;

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let path = dir.path().to_path_buf();
        let stop = stop.clone();
        thread::spawn(move || {
            let store = TaskStore::open_with(&path, patient()).unwrap();
            let mut last_seen = 0;
            while !stop.load(Ordering::Relaxed) {
                // Lock-free reads must always see a complete file.
                let n = store.list(None).unwrap().len();
                assert!(n >= last_seen, "queue shrank from {last_seen} to {n}");
                last_seen = n;
            }
        })
    };

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let path = dir.path().to_path_buf();
            thread::spawn(move || {
                let store = TaskStore::open_with(&path, patient()).unwrap();
                (0..per_writer)
                    .map(|i| store.add(job(format!("echo {w}-{i}"))).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.extend(handle.join().unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    assert_eq!(ids.len(), writers * per_writer);
    let store = TaskStore::open(dir.path()).unwrap();
    let tasks = store.list(Some(TaskStatus::Pending)).unwrap();
    assert_eq!(tasks.len(), writers * per_writer);
    assert!(tasks.iter().all(|t| ids.contains(&t.id)));
}

#[test]
fn racing_cancels_accept_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let id = TaskStore::open(dir.path())
        .unwrap()
        .add(job("sleep 600".into()))
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let path = dir.path().to_path_buf();
            thread::spawn(move || {
                TaskStore::open_with(&path, patient())
                    .unwrap()
                    .cancel(&id)
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<CancelOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let accepted = outcomes.iter().filter(|o| o.accepted()).count();
    assert_eq!(accepted, 1);
    assert!(outcomes
        .iter()
        .filter(|o| !o.accepted())
        .all(|o| *o == CancelOutcome::NotCancellable(TaskStatus::Cancelled)));
}
