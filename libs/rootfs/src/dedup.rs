//! Execute-at-most-once-per-key coordination for expensive async work.
//!
//! [`Deduper::run`] either starts the operation on a background task and
//! registers it under its key, or attaches the caller to the execution that
//! is already registered. Every attached caller observes the same value.
//!
//! The background task owns the work. Dropping a [`DedupHandle`] (because the
//! caller timed out or was cancelled) only detaches that caller; the
//! operation keeps running for the remaining waiters and retires its
//! registry entry when it finishes. Results are not retained afterwards:
//! the next call with the same key starts a fresh execution.
//!
//! [`Deduper::shutdown`] is the only way to stop an execution early.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// The background task ended without publishing a value (it panicked, was
/// aborted by [`Deduper::shutdown`], or the runtime shut down).
#[derive(Debug, Clone, Copy, Error)]
#[error("deduplicated operation ended without a result")]
pub struct Abandoned;

/// Value observed by one caller.
#[derive(Debug, Clone)]
pub struct Deduped<T> {
    pub value: T,
    /// `true` when this caller attached to an execution started by another.
    pub joined: bool,
}

struct InFlight<T> {
    id: u64,
    result: watch::Receiver<Option<T>>,
    waiters: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

type Registry<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

fn lock<T>(registry: &Mutex<T>) -> MutexGuard<'_, T> {
    // The registry stays consistent across a panicking holder.
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keyed registry of in-flight operations.
pub struct Deduper<T> {
    in_flight: Registry<T>,
    next_id: AtomicU64,
}

impl<T> Default for Deduper<T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> Deduper<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `op` under `key`, or attach to the execution already running.
    ///
    /// `op` is only invoked when a new execution starts. Must be called from
    /// within a Tokio runtime.
    pub fn run<F, Fut>(&self, key: &str, op: F) -> DedupHandle<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut in_flight = lock(&self.in_flight);

        if let Some(existing) = in_flight.get(key) {
            let waiters = existing.waiters.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(key = %key, waiters, "Attached to in-flight operation");
            return DedupHandle {
                result: existing.result.clone(),
                waiters: Arc::clone(&existing.waiters),
                joined: true,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let waiters = Arc::new(AtomicUsize::new(1));
        let registration = Registration {
            registry: Arc::clone(&self.in_flight),
            key: key.to_string(),
            id,
        };
        let fut = op();
        // The task retires its entry under the lock held here, so it cannot
        // finish before the entry exists.
        let task = tokio::spawn(async move {
            let value = fut.await;
            registration.complete(&tx, value);
        });
        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                result: rx.clone(),
                waiters: Arc::clone(&waiters),
                task,
            },
        );
        drop(in_flight);

        DedupHandle {
            result: rx,
            waiters,
            joined: false,
        }
    }

    /// Number of keys with an execution in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Callers currently attached to the execution for `key`, if any.
    pub fn waiters(&self, key: &str) -> Option<usize> {
        lock(&self.in_flight)
            .get(key)
            .map(|entry| entry.waiters.load(Ordering::SeqCst))
    }

    /// Abort every execution in flight and wait until each background task
    /// has been torn down, so the operations' drop guards have run.
    ///
    /// Attached callers observe [`Abandoned`]. Returns how many executions
    /// were aborted.
    pub async fn shutdown(&self) -> usize {
        let tasks: Vec<JoinHandle<()>> = lock(&self.in_flight)
            .drain()
            .map(|(key, entry)| {
                debug!(key = %key, "Aborting in-flight operation");
                entry.task.abort();
                entry.task
            })
            .collect();

        let count = tasks.len();
        for task in tasks {
            // A cancelled or panicked task is the expected outcome here.
            let _ = task.await;
        }
        count
    }
}

/// Retires a registry entry when its execution finishes, or when the
/// background task is torn down without finishing.
struct Registration<T> {
    registry: Registry<T>,
    key: String,
    id: u64,
}

impl<T> Registration<T> {
    fn complete(&self, tx: &watch::Sender<Option<T>>, value: T) {
        // Publish and retire under one lock so a new caller either sees the
        // value or starts a fresh execution.
        let mut in_flight = lock(&self.registry);
        tx.send_replace(Some(value));
        self.retire(&mut in_flight);
    }

    fn retire(&self, in_flight: &mut HashMap<String, InFlight<T>>) {
        if in_flight.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            if let Some(entry) = in_flight.remove(&self.key) {
                debug!(
                    key = %self.key,
                    waiters = entry.waiters.load(Ordering::SeqCst),
                    "Retired in-flight operation"
                );
            }
        }
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.registry);
        self.retire(&mut in_flight);
    }
}

/// One caller's attachment to an in-flight execution.
pub struct DedupHandle<T> {
    result: watch::Receiver<Option<T>>,
    waiters: Arc<AtomicUsize>,
    joined: bool,
}

impl<T: Clone> DedupHandle<T> {
    /// Whether this handle attached to an execution started by another call.
    pub fn joined(&self) -> bool {
        self.joined
    }

    /// Wait for the shared value.
    ///
    /// Cancel-safe: dropping this future detaches only this caller.
    pub async fn wait(&mut self) -> Result<Deduped<T>, Abandoned> {
        let value = self
            .result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Abandoned)?
            .clone();
        match value {
            Some(value) => Ok(Deduped {
                value,
                joined: self.joined,
            }),
            None => Err(Abandoned),
        }
    }
}

impl<T> Drop for DedupHandle<T> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}
