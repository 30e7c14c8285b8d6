use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::error;

use crate::error::panic_message;

/// Bounded pool that runs request handlers and response settlement off
/// the connection read/write loops.
///
/// Shared by every connection of a receiver. At most `workers` jobs run at
/// once; the rest wait for a permit.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Spawn a tracked job. A panic inside `job` is logged and contained.
    pub fn spawn<F>(self: &Arc<Self>, label: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let permits = Arc::clone(&self.permits);
        let pool = Arc::downgrade(self);

        // Hold the table lock across spawn so the job cannot deregister
        // before it is registered.
        let mut tasks = self.tasks.lock();
        let handle = tokio::spawn(async move {
            if let Ok(_permit) = permits.acquire_owned().await {
                if let Err(payload) = AssertUnwindSafe(job).catch_unwind().await {
                    error!(
                        "worker job '{label}' panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            if let Some(pool) = pool.upgrade() {
                pool.tasks.lock().remove(&id);
            }
        });
        tasks.insert(id, handle.abort_handle());
    }

    /// Jobs spawned and not yet finished (running or waiting for a permit).
    pub fn active(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Abort every job and refuse new permits.
    pub fn shutdown(&self) {
        self.permits.close();
        let tasks: Vec<AbortHandle> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        for task in tasks {
            task.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }
}

// ── Tests ────────────────────────────────────────────────────────
