//! Thread and mutex registries shared by every execution context.
//!
//! Hosted threads are native OS threads. A thread object stores its thread
//! id in word 0 and its mutex id in word 1.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread::JoinHandle;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};
use tracing::debug;

use super::error::VmError;

/// Stack size for hosted threads; interpreted recursion runs on the native
/// stack.
pub const THREAD_STACK_BYTES: usize = 16 * 1024 * 1024;

/// Live hosted threads and mutexes.
pub struct ThreadRegistry {
    threads: Mutex<HashMap<i64, JoinHandle<Result<(), VmError>>>>,
    mutexes: Mutex<HashMap<i64, Arc<RawMutex>>>,
    /// Next id for threads and mutexes. Zero means "none".
    next_id: AtomicI64,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            mutexes: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawns `body` on a new OS thread and returns its id.
    pub fn spawn<F>(&self, name: String, body: F) -> Result<i64, VmError>
    where
        F: FnOnce() -> Result<(), VmError> + Send + 'static,
    {
        let id = self.next_id();
        let handle = std::thread::Builder::new()
            .name(name)
            .stack_size(THREAD_STACK_BYTES)
            .spawn(body)
            .map_err(|e| VmError::ResourceExhausted {
                message: format!("unable to create thread: {}", e),
            })?;
        self.threads.lock().insert(id, handle);
        debug!(id, "thread started");
        Ok(id)
    }

    /// Waits for thread `id`. Joining an unknown or already joined id is a
    /// no-op, matching a join on a finished thread.
    pub fn join(&self, id: i64) -> Result<(), VmError> {
        let handle = self.threads.lock().remove(&id);
        match handle {
            Some(handle) => {
                let result = handle
                    .join()
                    .map_err(|_| VmError::thread(format!("thread {} panicked", id)))?;
                debug!(id, ok = result.is_ok(), "thread joined");
                result.map_err(|e| VmError::thread(format!("thread {} failed: {}", id, e)))
            }
            None => Ok(()),
        }
    }

    pub fn live_threads(&self) -> usize {
        self.threads.lock().len()
    }

    /// Creates a mutex and returns its id.
    pub fn new_mutex(&self) -> i64 {
        let id = self.next_id();
        self.mutexes.lock().insert(id, Arc::new(RawMutex::INIT));
        id
    }

    fn mutex(&self, id: i64) -> Result<Arc<RawMutex>, VmError> {
        self.mutexes
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| VmError::thread(format!("unknown mutex {}", id)))
    }

    /// Blocks until mutex `id` is acquired. The registry lock is not held
    /// while waiting.
    pub fn lock(&self, id: i64) -> Result<(), VmError> {
        let mutex = self.mutex(id)?;
        mutex.lock();
        Ok(())
    }

    pub fn unlock(&self, id: i64) -> Result<(), VmError> {
        let mutex = self.mutex(id)?;
        if !mutex.is_locked() {
            return Err(VmError::thread(format!("mutex {} is not locked", id)));
        }
        // SAFETY: the hosted program pairs CRITICAL_START/CRITICAL_END on the
        // same thread; the check above rejects an unlock without a lock.
        unsafe { mutex.unlock() };
        Ok(())
    }

    /// Joins every remaining thread; used at shutdown.
    pub fn join_all(&self) -> Result<(), VmError> {
        let ids: Vec<i64> = self.threads.lock().keys().copied().collect();
        let mut first = Ok(());
        for id in ids {
            if let Err(e) = self.join(id) {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_spawn_and_join() {
        let registry = ThreadRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let id = registry
            .spawn("worker".into(), move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        registry.join(id).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_threads(), 0);
        // second join is a no-op
        registry.join(id).unwrap();
    }

    #[test]
    fn test_join_reports_thread_error() {
        let registry = ThreadRegistry::new();
        let id = registry
            .spawn("failing".into(), || Err(VmError::div_zero()))
            .unwrap();
        let err = registry.join(id).unwrap_err();
        assert!(err.to_string().contains("divide by zero"));
    }

    #[test]
    fn test_ids_are_per_registry() {
        let first = ThreadRegistry::new();
        let second = ThreadRegistry::new();
        assert_eq!(first.new_mutex(), 1);
        assert_eq!(first.new_mutex(), 2);
        assert_eq!(second.new_mutex(), 1);
    }

    #[test]
    fn test_mutex_lock_unlock() {
        let registry = ThreadRegistry::new();
        let id = registry.new_mutex();
        registry.lock(id).unwrap();
        registry.unlock(id).unwrap();
        assert!(registry.unlock(id).is_err());
        assert!(registry.lock(id + 1_000_000).is_err());
    }
}
