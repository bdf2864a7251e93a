//! Background work pool for promotions and resizes
//!
//! A small rayon pool plus a pending-task counter, so the index can wait for
//! all maintenance to drain before it syncs or shuts down.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Runs maintenance closures off the foreground path
pub struct BackgroundPool {
    pool: rayon::ThreadPool,
    pending: Arc<Pending>,
}

impl BackgroundPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("dirindex-bg-{}", i))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to start background pool: {}", e)))?;

        Ok(Self {
            pool,
            pending: Arc::new(Pending::default()),
        })
    }

    /// Queue `task`. Its captures are dropped before the task counts as done.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.pending.count.lock() += 1;
        let pending = Arc::clone(&self.pending);
        debug!(task = name, "Queued background task");
        self.pool.spawn(move || {
            task();
            pending.done();
        });
    }

    /// Tasks queued or running
    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Block until no task is queued or running
    ///
    /// Tasks spawned by running tasks are waited for as well.
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }
}
