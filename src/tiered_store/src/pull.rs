use crate::coordinator::LockCoordinator;
use crate::file_lock::LockLevel;
use cache_lib::{CacheError, CacheResult, LocalCacheProvider, Resource};
use cluster_map::ClusterMap;
use log::{error, trace, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Gate shared between a waiting reader and the shared→local pull running on
/// its behalf. `readable` flips as soon as the local sink is open, before the
/// copy finishes, so the reader can start following the writer.
pub(crate) struct PullState {
    readable: AtomicBool,
    failed: AtomicBool,
    notify: Notify,
}

impl PullState {
    pub(crate) fn new() -> Self {
        Self {
            readable: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn mark_readable(&self) {
        self.readable.store(true, Ordering::SeqCst);
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Parks until the local copy is readable or the pull failed. Returns
    /// whether the local copy can be opened.
    pub(crate) async fn wait_ready(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.failed.load(Ordering::SeqCst) && !self.readable.load(Ordering::SeqCst) {
                return false;
            }
            if self.readable.load(Ordering::SeqCst) {
                return true;
            }
            notified.await;
        }
    }
}

/// Runs the shared→local copy on the runtime. The task locks the key for
/// writing, streams the shared copy into the local tier, and releases with a
/// rollback in its epilogue; the data itself is the observable effect.
pub(crate) fn spawn_pull(
    coordinator: Arc<LockCoordinator>,
    local: Arc<dyn LocalCacheProvider>,
    local_files: Arc<ClusterMap<Resource>>,
    shared_path: PathBuf,
    resource: Resource,
    key: String,
    state: Arc<PullState>,
    lock_wait: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = coordinator.acquire(&key, LockLevel::Write, lock_wait).await {
            warn!(
                "shared->local pull could not lock key {} for resource {}: {}",
                key, resource, e
            );
            state.mark_failed();
            state.notify.notify_waiters();
            return;
        }

        if let Err(e) = run_pull(local.as_ref(), &shared_path, &resource, &state).await {
            state.mark_failed();
            warn!(
                "i/o error during shared->local pull for resource {}: {}",
                resource, e
            );
        }

        if let Err(e) = coordinator.release(&key, false) {
            error!("release after shared->local pull failed for key {}: {}", key, e);
        }
        record_local_file(local.as_ref(), &local_files, &resource).await;
        state.notify.notify_waiters();
    })
}

async fn run_pull(
    local: &dyn LocalCacheProvider,
    shared_path: &Path,
    resource: &Resource,
    state: &PullState,
) -> CacheResult<()> {
    if tokio::fs::metadata(shared_path).await.is_err() {
        trace!("shared copy missing for resource {}", resource);
        state.mark_failed();
        state.notify.notify_waiters();
        return Ok(());
    }

    let mut shared_in = tokio::fs::File::open(shared_path)
        .await
        .map_err(|e| CacheError::Io(format!("open shared copy of {} failed: {}", resource, e)))?;
    let mut local_out = local.open_output(resource).await?;

    // Readers may start before the copy is done; the local tier serializes
    // them against this writer.
    state.mark_readable();
    state.notify.notify_waiters();

    tokio::io::copy(&mut shared_in, &mut local_out)
        .await
        .map_err(|e| CacheError::Io(format!("shared->local copy of {} failed: {}", resource, e)))?;
    local_out
        .shutdown()
        .await
        .map_err(|e| CacheError::Io(format!("local sink close of {} failed: {}", resource, e)))?;
    trace!("shared->local copy done for resource {}", resource);
    Ok(())
}

/// Records the local copy in the expiration map so an expired entry can
/// trigger the local deletion later.
pub(crate) async fn record_local_file(
    local: &dyn LocalCacheProvider,
    local_files: &ClusterMap<Resource>,
    resource: &Resource,
) {
    if local.exists(resource).await {
        local_files.put(resource.path(), resource.clone());
    }
}
