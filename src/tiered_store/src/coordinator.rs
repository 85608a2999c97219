use crate::context;
use crate::file_lock::{FileLockManager, LockLevel};
use cache_lib::{CacheError, CacheResult};
use cluster_map::{ClusterMap, TxStatus};
use log::{error, trace};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll period while waiting out a lock held by another node or context.
pub const FOREIGN_LOCK_POLL: Duration = Duration::from_millis(1000);

/// Couples the in-process file locks with the cluster ownership map: a key
/// is first locked locally, then on the map inside the context's
/// transaction. The per-context file counter delays the transaction commit
/// until the outermost release of the context.
pub struct LockCoordinator {
    file_locks: FileLockManager,
    owner_map: Arc<ClusterMap<String>>,
}

impl LockCoordinator {
    pub fn new(owner_map: Arc<ClusterMap<String>>) -> Self {
        Self {
            file_locks: FileLockManager::new(),
            owner_map,
        }
    }

    pub fn owner_map(&self) -> &Arc<ClusterMap<String>> {
        &self.owner_map
    }

    pub fn file_locks(&self) -> &FileLockManager {
        &self.file_locks
    }

    /// Takes the file lock, waits out any foreign holder of the map lock,
    /// then locks the key on the map inside the context's transaction
    /// (beginning one when none is active). On failure past the file lock,
    /// the file lock is unlocked again before the error returns; callers
    /// release only after a successful acquire.
    pub async fn acquire(&self, key: &str, level: LockLevel, wait: Duration) -> CacheResult<()> {
        self.file_locks.lock(key, level).await;
        if let Err(e) = self.acquire_cluster(key, wait).await {
            if let Err(ue) = self.file_locks.unlock(key) {
                error!("file unlock after failed acquire failed for key {}: {}", key, ue);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn acquire_cluster(&self, key: &str, wait: Duration) -> CacheResult<()> {
        self.wait_for_foreign_lock(key, wait).await?;

        if self.owner_map.tx_status() == TxStatus::NoTransaction {
            self.owner_map.begin_tx()?;
            trace!("transaction started for key {}", key);
        }

        if !self.owner_map.is_locked(key) && self.owner_map.tx_status().is_active() {
            self.owner_map.lock(&[key])?;
            let counter = context::current().increment_tx_files();
            trace!("cluster lock taken for key {}, open file count {}", key, counter);
        }
        Ok(())
    }

    /// Unstacks the file lock; once the context's stack for the key is empty,
    /// unlocks the key on the map, and when the context's last file is gone
    /// commits (or rolls back) the transaction.
    pub fn release(&self, key: &str, should_commit: bool) -> CacheResult<()> {
        self.file_locks
            .unlock(key)
            .map_err(|e| CacheError::InvalidState(format!("file unlock failed for key {}: {}", key, e)))?;

        let lock_count = self.file_locks.context_lock_count(key);
        trace!("file lock released for key {}, stacked count {}", key, lock_count);
        if lock_count != 0 {
            return Ok(());
        }

        if !self.owner_map.tx_status().is_active() {
            return Ok(());
        }

        let mut count: i64 = 0;
        if self.owner_map.is_locked_by_current_tx(key) {
            self.owner_map.unlock(key)?;
            count = context::current().decrement_tx_files();
            trace!("cluster lock released for key {}, open file count {}", key, count);
        }

        if count == 0 {
            if should_commit {
                match self.owner_map.commit() {
                    Ok(()) => {
                        trace!("transaction committed for key {}", key);
                        return Ok(());
                    }
                    Err(e) => {
                        error!("cluster map commit failed for key {}: {}", key, e);
                    }
                }
            }
            // A failed commit must still end with the locks released.
            self.owner_map.rollback().map_err(|e| {
                error!("cluster map rollback failed for key {}: {}", key, e);
                CacheError::InvalidState(format!("cluster map rollback failed for key {}: {}", key, e))
            })?;
            trace!("transaction rolled back for key {}", key);
        }
        Ok(())
    }

    /// Waits until no other owner holds the map lock for the key, polling
    /// once a second. A key held by the caller's own transaction passes
    /// straight through.
    pub async fn wait_for_foreign_lock(&self, key: &str, timeout: Duration) -> CacheResult<()> {
        if self.owner_map.is_locked_by_current_tx(key) {
            trace!("key {} already locked by this context, no wait", key);
            return Ok(());
        }

        let mut waited = Duration::ZERO;
        loop {
            let Some(owner) = self.owner_map.get_lock_owner(key) else {
                return Ok(());
            };
            if waited >= timeout {
                return Err(CacheError::Timeout(format!(
                    "cluster lock wait timed out after {:?}, owner is {}, key is {}",
                    timeout, owner, key
                )));
            }
            trace!("cluster lock for key {} still held by {}, waiting", key, owner);
            tokio::time::sleep(FOREIGN_LOCK_POLL).await;
            waited += FOREIGN_LOCK_POLL;
        }
    }

    /// Locks several keys for the context's transaction in one sorted batch,
    /// waiting out foreign holders per key. The total order makes opposing
    /// batches drain instead of deadlocking. Used by cross-path copying,
    /// which must not touch the per-file counter.
    pub async fn lock_keys(&self, keys: &[&str], wait: Duration) -> CacheResult<()> {
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let deadline = Instant::now() + wait;
        for key in sorted {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.wait_for_foreign_lock(key, remaining).await?;
                if self.owner_map.is_locked_by_current_tx(key) {
                    break;
                }
                match self.owner_map.lock(&[key]) {
                    Ok(()) => break,
                    Err(CacheError::Timeout(_)) => {
                        // Lost the race for the key; wait out the new holder.
                        if Instant::now() >= deadline {
                            return Err(CacheError::Timeout(format!(
                                "multi-key lock wait timed out for key {}",
                                key
                            )));
                        }
                        tokio::time::sleep(FOREIGN_LOCK_POLL).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release_commits_once() {
        let map: Arc<ClusterMap<String>> = ClusterMap::new("owners-coord-1");
        let coord = LockCoordinator::new(map.clone());

        coord
            .acquire("/base/group", LockLevel::Write, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(map.is_locked("/base/group"));
        assert_eq!(context::current().tx_files(), 1);

        coord.release("/base/group", true).unwrap();
        assert!(!map.is_locked("/base/group"));
        assert_eq!(context::current().tx_files(), 0);
        assert_eq!(map.commit_count(), 1);
        context::remove_current();
    }

    #[tokio::test]
    async fn test_stacked_acquire_single_commit() {
        let map: Arc<ClusterMap<String>> = ClusterMap::new("owners-coord-2");
        let coord = LockCoordinator::new(map.clone());
        let key = "/base/group";

        coord.acquire(key, LockLevel::Write, Duration::from_secs(5)).await.unwrap();
        coord.acquire(key, LockLevel::Write, Duration::from_secs(5)).await.unwrap();
        assert_eq!(coord.file_locks().context_lock_count(key), 2);
        // The map lock is taken once; the counter follows it.
        assert_eq!(context::current().tx_files(), 1);

        coord.release(key, true).unwrap();
        assert!(map.is_locked(key));
        assert_eq!(map.commit_count(), 0);

        coord.release(key, true).unwrap();
        assert!(!map.is_locked(key));
        assert_eq!(map.commit_count(), 1);
        context::remove_current();
    }

    #[tokio::test]
    async fn test_release_without_commit_rolls_back() {
        let map: Arc<ClusterMap<String>> = ClusterMap::new("owners-coord-3");
        let coord = LockCoordinator::new(map.clone());
        let key = "/base/group";

        coord.acquire(key, LockLevel::Delete, Duration::from_secs(5)).await.unwrap();
        coord.release(key, false).unwrap();
        assert_eq!(map.commit_count(), 0);
        assert_eq!(map.tx_status(), TxStatus::NoTransaction);
        assert!(!map.is_locked(key));
        context::remove_current();
    }

    #[tokio::test]
    async fn test_wait_for_foreign_lock_times_out() {
        let map: Arc<ClusterMap<String>> = ClusterMap::new("owners-coord-4");
        let coord = Arc::new(LockCoordinator::new(map.clone()));
        let key = "/base/group";

        let holder_map = map.clone();
        let held = tokio::spawn(async move {
            holder_map.begin_tx().unwrap();
            holder_map.lock(&[key]).unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            holder_map.rollback().unwrap();
        });

        for _ in 0..200u32 {
            if map.is_locked(key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let result = coord
            .wait_for_foreign_lock(key, Duration::from_millis(1500))
            .await;
        assert!(matches!(result, Err(CacheError::Timeout(_))));
        held.abort();
        map.abandon_tx_for(&map.get_lock_owner(key).unwrap_or_default());
        context::remove_current();
    }
}
