use cache_lib::{context_id, CacheError, CacheResult};
use log::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Requested strength of an advisory file lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Read,
    Write,
    Delete,
}

struct FileLockState {
    owner: String,
    level: LockLevel,
    count: u32,
    notify: Arc<Notify>,
}

/// In-process advisory lock per key. A key has at most one owner context;
/// the owner stacks re-entrant acquisitions, everyone else waits. The stack
/// count drives when the cluster-side release may happen.
pub struct FileLockManager {
    locks: Mutex<HashMap<String, FileLockState>>,
}

impl FileLockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<String, FileLockState>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquires the lock, waiting without bound while a foreign context
    /// holds it.
    pub async fn lock(&self, key: &str, level: LockLevel) {
        let ctx = context_id();
        loop {
            let notify = {
                let mut locks = self.locked();
                match locks.get_mut(key) {
                    None => {
                        locks.insert(
                            key.to_string(),
                            FileLockState {
                                owner: ctx.clone(),
                                level,
                                count: 1,
                                notify: Arc::new(Notify::new()),
                            },
                        );
                        trace!("file lock taken: key {}, level {:?}, owner {}", key, level, ctx);
                        return;
                    }
                    Some(state) if state.owner == ctx => {
                        state.count += 1;
                        if level > state.level {
                            state.level = level;
                        }
                        trace!(
                            "file lock stacked: key {}, level {:?}, count {}",
                            key,
                            state.level,
                            state.count
                        );
                        return;
                    }
                    Some(state) => state.notify.clone(),
                }
            };
            notify.notified().await;
        }
    }

    /// Pops one stacked acquisition. Unlocking a key this context does not
    /// hold at all is tolerated; unlocking someone else's key is not.
    pub fn unlock(&self, key: &str) -> CacheResult<()> {
        let ctx = context_id();
        let notify = {
            let mut locks = self.locked();
            match locks.get_mut(key) {
                None => {
                    trace!("file unlock of key {} which is not locked", key);
                    return Ok(());
                }
                Some(state) if state.owner != ctx => {
                    return Err(CacheError::InvalidState(format!(
                        "file lock for key {} is owned by {}, not by {}",
                        key, state.owner, ctx
                    )));
                }
                Some(state) => {
                    state.count -= 1;
                    if state.count > 0 {
                        trace!("file lock popped: key {}, count {}", key, state.count);
                        return Ok(());
                    }
                    locks.remove(key).unwrap().notify
                }
            }
        };
        notify.notify_waiters();
        notify.notify_one();
        trace!("file lock released: key {}, owner {}", key, ctx);
        Ok(())
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locked().contains_key(key)
    }

    pub fn is_locked_by_current_context(&self, key: &str) -> bool {
        let ctx = context_id();
        matches!(self.locked().get(key), Some(state) if state.owner == ctx)
    }

    /// How many times the current context has stacked this key; 0 for
    /// foreign-held or free keys.
    pub fn context_lock_count(&self, key: &str) -> u32 {
        let ctx = context_id();
        match self.locked().get(key) {
            Some(state) if state.owner == ctx => state.count,
            _ => 0,
        }
    }

    pub fn lock_level(&self, key: &str) -> Option<LockLevel> {
        self.locked().get(key).map(|s| s.level)
    }
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_reentrant_stacking() {
        let mgr = FileLockManager::new();
        mgr.lock("/a/b", LockLevel::Write).await;
        mgr.lock("/a/b", LockLevel::Write).await;
        assert_eq!(mgr.context_lock_count("/a/b"), 2);
        assert!(mgr.is_locked_by_current_context("/a/b"));

        mgr.unlock("/a/b").unwrap();
        assert_eq!(mgr.context_lock_count("/a/b"), 1);
        assert!(mgr.is_locked("/a/b"));

        mgr.unlock("/a/b").unwrap();
        assert!(!mgr.is_locked("/a/b"));
        assert_eq!(mgr.context_lock_count("/a/b"), 0);
    }

    #[tokio::test]
    async fn test_level_upgrade_kept() {
        let mgr = FileLockManager::new();
        mgr.lock("/a", LockLevel::Read).await;
        mgr.lock("/a", LockLevel::Delete).await;
        assert_eq!(mgr.lock_level("/a"), Some(LockLevel::Delete));
        mgr.unlock("/a").unwrap();
        mgr.unlock("/a").unwrap();
    }

    #[tokio::test]
    async fn test_foreign_context_waits() {
        let mgr = Arc::new(FileLockManager::new());
        let holder = mgr.clone();
        let handle = tokio::spawn(async move {
            holder.lock("/a", LockLevel::Write).await;
            sleep(Duration::from_millis(150)).await;
            holder.unlock("/a").unwrap();
        });

        // Let the spawned task take the lock first.
        for _ in 0..100u32 {
            if mgr.is_locked("/a") {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(!mgr.is_locked_by_current_context("/a"));

        let started = Instant::now();
        mgr.lock("/a", LockLevel::Write).await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        mgr.unlock("/a").unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_of_unlocked_key_tolerated() {
        let mgr = FileLockManager::new();
        assert!(mgr.unlock("/nope").is_ok());
    }
}
