//! Bounded worker pool with submission tracking.
//!
//! A unit of work occupies its slot for its entire run, including any
//! blocking waits it performs (pacing sleeps, admission-gate waits, external
//! processes). Units may themselves submit further units to the same or
//! another pool; [`TaskPool::wait_all`] covers every submission ever made,
//! including ones enqueued while it is already waiting.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub struct TaskPool {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    outstanding: Arc<watch::Sender<usize>>,
    failures: Arc<Mutex<Vec<String>>>,
}

/// Handle for one scheduled unit of work.
pub struct Submission {
    label: String,
    handle: JoinHandle<Result<()>>,
}

/// Keeps the outstanding-submissions count accurate even when a unit panics.
struct CompletionGuard {
    label: String,
    outstanding: Arc<watch::Sender<usize>>,
    failures: Arc<Mutex<Vec<String>>>,
    finished: bool,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.failures
                .lock()
                .push(format!("{}: task panicked or was aborted", self.label));
        }
        self.outstanding.send_modify(|count| *count -= 1);
    }
}

impl TaskPool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        let (outstanding, _) = watch::channel(0);
        Arc::new(Self {
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            outstanding: Arc::new(outstanding),
            failures: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Schedule a unit of work. The unit starts once a slot frees up and
    /// holds that slot until its future completes. Safe to call from inside
    /// units already running on this pool.
    pub fn submit<F>(&self, label: impl Into<String>, future: F) -> Submission
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        self.outstanding.send_modify(|count| *count += 1);

        let mut guard = CompletionGuard {
            label: label.clone(),
            outstanding: self.outstanding.clone(),
            failures: self.failures.clone(),
            finished: false,
        };
        let semaphore = self.semaphore.clone();
        let pool = self.name.clone();
        let task = label.clone();

        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| anyhow!("pool {pool} is closed"))?;
            debug!(pool = %pool, task = %task, "task acquired slot");

            let result = future.await;
            if let Err(error) = &result {
                error!(pool = %pool, task = %task, "task failed: {error:#}");
                guard
                    .failures
                    .lock()
                    .push(format!("{task}: {error:#}"));
            }
            guard.finished = true;
            result
        });

        Submission { label, handle }
    }

    /// Block until every submission ever made on this pool has completed,
    /// then report accumulated failures.
    pub async fn wait_all(&self) -> Result<()> {
        let mut outstanding = self.outstanding.subscribe();
        outstanding
            .wait_for(|count| *count == 0)
            .await
            .map_err(|_| anyhow!("pool {} went away while waiting", self.name))?;

        let failures = self.failures.lock();
        if failures.is_empty() {
            Ok(())
        } else {
            bail!(
                "{} task(s) failed on pool {}: {}",
                failures.len(),
                self.name,
                failures.join("; ")
            );
        }
    }
}

impl Submission {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Block until this unit completes, surfacing its failure (or panic).
    pub async fn wait(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result.with_context(|| format!("task {} failed", self.label)),
            Err(join_error) => Err(anyhow!("task {} panicked: {join_error}", self.label)),
        }
    }
}
