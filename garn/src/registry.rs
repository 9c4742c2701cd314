use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{ThreadShared, ThreadStatus};

/// Tracks every thread an interpreter created and has not yet joined.
/// Cloning shares the same registry; each interpreter carries its own,
/// so a worker's threads are joined when that worker winds down, not
/// by the top-level interpreter.
#[derive(Debug, Clone, Default)]
pub struct ThreadRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    threads: Mutex<HashMap<u64, Arc<ThreadShared>>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: u64, shared: Arc<ThreadShared>) {
        self.inner.threads.lock().insert(id, shared);
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.inner.threads.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-joins every tracked thread. Threads that never started
    /// have no worker to wait on and are just dropped from tracking.
    pub fn join_all(&self) {
        let drained: Vec<Arc<ThreadShared>> = {
            let mut threads = self.inner.threads.lock();
            threads.drain().map(|(_, shared)| shared).collect()
        };
        for shared in drained {
            if shared.status() == ThreadStatus::NotStarted {
                log::debug!("skipping join of never-started thread");
                continue;
            }
            shared.join();
        }
    }
}
