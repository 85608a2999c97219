use crate::config::TieredStoreConfig;
use crate::context;
use crate::coordinator::LockCoordinator;
use crate::dual_writer::DualWriter;
use crate::file_lock::LockLevel;
use crate::node;
use crate::pull::{self, PullState};
use crate::transfer::{Transfer, TransferRegistry};
use async_trait::async_trait;
use cache_lib::{
    normalize_rel, CacheError, CacheReader, CacheResult, CacheWriter, LocalCacheProvider,
    PathGenerator, Resource, ATTR_ALT_STORAGE_LOCATION,
};
use cluster_map::{ClusterMap, ExpireListener};
use log::{debug, error, info, trace, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

/// Two-tier cache provider: every artifact lives on fast local disk and on a
/// shared store mounted by all peer nodes. Reads prefer the local tier and
/// lazily populate it from the shared tier; writes land on both tiers
/// through one mirrored stream; the ownership map records which node wrote
/// the shared copy and doubles as the cross-node advisory lock.
pub struct TieredStoreMgr {
    shared_root: PathBuf,
    local: Arc<dyn LocalCacheProvider>,
    path_gen: Arc<dyn PathGenerator>,
    owner_map: Arc<ClusterMap<String>>,
    local_files: Arc<ClusterMap<Resource>>,
    coordinator: Arc<LockCoordinator>,
    transfers: TransferRegistry,
    lock_wait: Duration,
    node_ip: Option<String>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct LocalFileExpireListener {
    local: Arc<dyn LocalCacheProvider>,
}

#[async_trait]
impl ExpireListener<Resource> for LocalFileExpireListener {
    async fn on_expired(&self, key: &str, value: Resource) {
        if key.is_empty() {
            return;
        }
        debug!("local copy of expired entry {} will be deleted", key);
        if let Err(e) = self.local.delete(&value).await {
            error!("cannot delete local copy {} on expiration: {}", value, e);
        }
    }
}

impl TieredStoreMgr {
    /// Builds the provider and wires the expiration listener and sweeper.
    pub fn open(
        local: Arc<dyn LocalCacheProvider>,
        path_gen: Arc<dyn PathGenerator>,
        owner_map: Arc<ClusterMap<String>>,
        local_files: Arc<ClusterMap<Resource>>,
        config: TieredStoreConfig,
    ) -> CacheResult<Arc<Self>> {
        let shared_root = config.resolve_shared_root()?;
        let coordinator = Arc::new(LockCoordinator::new(owner_map.clone()));
        let mgr = Arc::new(Self {
            shared_root,
            local,
            path_gen,
            owner_map,
            local_files,
            coordinator,
            transfers: TransferRegistry::new(),
            lock_wait: config.lock_wait(),
            node_ip: config.node_ip.clone(),
            sweeper: Mutex::new(None),
        });

        mgr.local_files.add_listener(Arc::new(LocalFileExpireListener {
            local: mgr.local.clone(),
        }));
        let sweeper = mgr
            .local_files
            .clone()
            .start_expiry_sweeper(config.expiry_sweep());
        *mgr.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(sweeper);
        mgr.local.start_reporting();
        info!("tiered store opened, shared root {}", mgr.shared_root.display());
        Ok(mgr)
    }

    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            sweeper.abort();
        }
        self.local.stop_reporting();
    }

    pub fn shared_root(&self) -> &Path {
        &self.shared_root
    }

    pub fn coordinator(&self) -> &Arc<LockCoordinator> {
        &self.coordinator
    }

    fn node_ip(&self) -> CacheResult<String> {
        match &self.node_ip {
            Some(ip) => Ok(ip.clone()),
            None => node::current_node_ip(),
        }
    }

    fn shared_path(&self, resource: &Resource) -> PathBuf {
        self.shared_root
            .join(normalize_rel(&self.path_gen.path_for(resource)))
    }

    /// Shared-tier path of the resource; for a location root the directory
    /// is created on demand.
    pub fn shared_detached_file(&self, resource: &Resource) -> PathBuf {
        let path = self.shared_path(resource);
        if resource.is_root() && !path.is_dir() {
            let _ = std::fs::create_dir_all(&path);
        }
        path
    }

    /// Read path of the resource, honoring a per-location storage override.
    pub fn file_path(&self, resource: &Resource) -> PathBuf {
        match resource.location().attribute(ATTR_ALT_STORAGE_LOCATION) {
            Some(alt) => PathBuf::from(alt).join(normalize_rel(&self.path_gen.path_for(resource))),
            None => self.shared_path(resource),
        }
    }

    /// The local copy when present, otherwise the shared one.
    pub fn detached_file(&self, resource: &Resource) -> PathBuf {
        let local = self.local.detached_file(resource);
        if local.exists() {
            local
        } else {
            self.shared_detached_file(resource)
        }
    }

    /// Lock key of the resource: the shared-tier parent directory, so a file
    /// and its checksum siblings contend on one key.
    pub fn key_for(&self, resource: &Resource) -> CacheResult<String> {
        let path = self.shared_path(resource);
        let dir = if resource.is_root() || path.is_dir() {
            path
        } else {
            path.parent()
                .ok_or_else(|| {
                    CacheError::InvalidParam(format!("resource {} has no parent directory", resource))
                })?
                .to_path_buf()
        };
        Ok(dir.to_string_lossy().to_string())
    }

    pub fn is_directory(&self, resource: &Resource) -> bool {
        self.detached_file(resource).is_dir()
    }

    pub fn is_file(&self, resource: &Resource) -> bool {
        self.detached_file(resource).is_file()
    }

    /// Opens the resource for reading, preferring the local tier. On a local
    /// miss a background task populates the local copy from the shared tier
    /// and the read starts as soon as the local file is open. `None` means
    /// neither tier has the resource.
    pub async fn open_input(&self, resource: &Resource) -> CacheResult<Option<CacheReader>> {
        let key = self.key_for(resource)?;
        let state = Arc::new(PullState::new());

        self.transfers
            .try_lock_and(resource, self.lock_wait, || async move {
                if self.local.exists(resource).await {
                    trace!("local hit for resource {}", resource);
                    return self.local.open_input(resource).await.map(Some);
                }

                trace!("local miss for resource {}, pulling from shared store", resource);
                let _pull = pull::spawn_pull(
                    self.coordinator.clone(),
                    self.local.clone(),
                    self.local_files.clone(),
                    self.shared_path(resource),
                    resource.clone(),
                    key.clone(),
                    state.clone(),
                    self.lock_wait,
                );

                if !state.wait_ready().await {
                    debug!("shared store has no copy of {} either", resource);
                    return Ok(None);
                }
                self.local.open_input(resource).await.map(Some)
            })
            .await
    }

    /// Opens a mirrored stream writing the local and shared copies together.
    /// Closing the stream is the commit point: the ownership entry and the
    /// cluster lock are settled exactly once there.
    pub async fn open_output(&self, resource: &Resource) -> CacheResult<CacheWriter> {
        let key = self.key_for(resource)?;
        let node_ip = self.node_ip()?;
        let shared_file = self.shared_path(resource);

        self.transfers
            .try_lock_and(resource, self.lock_wait, || async move {
                self.coordinator
                    .acquire(&key, LockLevel::Write, self.lock_wait)
                    .await?;

                match self.open_dual(resource, &key, &node_ip, &shared_file).await {
                    Ok(writer) => Ok(writer),
                    Err(e) => {
                        warn!(
                            "output stream open failed for resource {}, releasing key {}: {}",
                            resource, key, e
                        );
                        if let Err(re) = self.coordinator.release(&key, false) {
                            error!("release after failed output open failed for key {}: {}", key, re);
                        }
                        Err(e)
                    }
                }
            })
            .await
    }

    async fn open_dual(
        &self,
        resource: &Resource,
        key: &str,
        node_ip: &str,
        shared_file: &Path,
    ) -> CacheResult<CacheWriter> {
        self.owner_map.put(key, node_ip.to_string());

        let local_out = self.local.open_output(resource).await?;
        trace!("local sink open for {}", resource);

        if let Some(parent) = shared_file.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::Io(format!("create shared dirs for {} failed: {}", resource, e))
            })?;
        }
        let shared_out = fs::File::create(shared_file).await.map_err(|e| {
            CacheError::Io(format!("open shared copy of {} failed: {}", resource, e))
        })?;
        trace!("shared sink open for {}", resource);

        let writer = DualWriter::new(
            local_out,
            Box::pin(shared_out),
            self.coordinator.clone(),
            self.local_files.clone(),
            key.to_string(),
            resource.clone(),
        );
        context::current().register_stream(writer.guard());
        if let Some(owner) = self.owner_map.get_lock_owner(key) {
            trace!("cluster lock for key {} held by {} while stream open", key, owner);
        }
        Ok(Box::pin(writer))
    }

    /// Deletes the resource from both tiers. Refuses (returning `false`)
    /// while the local copy is being read or written; a failed local
    /// deletion leaves the shared tier untouched so the tiers stay
    /// consistent. Returns whether the shared copy was removed.
    pub async fn delete(&self, resource: &Resource) -> CacheResult<bool> {
        let key = self.key_for(resource)?;
        let shared_file = self.shared_path(resource);

        self.transfers
            .try_lock_and(resource, self.lock_wait, || async move {
                if self.local.is_write_locked(resource).await
                    || self.local.is_read_locked(resource).await
                {
                    warn!(
                        "resource {} is locked by readers or writers, not deleting",
                        resource
                    );
                    return Ok(false);
                }

                let local_deleted = self.local.delete(resource).await?;
                if !local_deleted {
                    info!("local copy deletion failed for {}", resource);
                    return Ok(false);
                }

                let result = async {
                    self.coordinator
                        .acquire(&key, LockLevel::Delete, self.lock_wait)
                        .await?;
                    let deleted = async {
                        self.owner_map.remove(&key);
                        match fs::remove_file(&shared_file).await {
                            Ok(()) => Ok(true),
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                                info!("shared copy already missing for {}", resource);
                                Ok(false)
                            }
                            Err(e) => Err(CacheError::Io(format!(
                                "delete shared copy of {} failed: {}",
                                resource, e
                            ))),
                        }
                    }
                    .await;
                    if let Err(e) = self.coordinator.release(&key, false) {
                        error!("release after delete failed for key {}: {}", key, e);
                        deleted?;
                        return Err(e);
                    }
                    deleted
                }
                .await;

                self.local_files.remove(resource.path());
                result
            })
            .await
    }

    /// Copies the resource inside both tiers. Runs outside the per-resource
    /// mutexes (two resources would invert); the batched multi-key lock
    /// keeps opposing copies from deadlocking. Best effort with respect to
    /// in-process concurrency.
    pub async fn copy(&self, from: &Resource, to: &Resource) -> CacheResult<()> {
        let result = self.copy_locked(from, to).await;
        if result.is_err() && self.owner_map.tx_status().is_active() {
            if let Err(re) = self.owner_map.rollback() {
                error!("rollback after failed copy {} -> {} failed: {}", from, to, re);
                return Err(CacheError::InvalidState(format!(
                    "rollback after failed copy failed: {}",
                    re
                )));
            }
        }
        result
    }

    async fn copy_locked(&self, from: &Resource, to: &Resource) -> CacheResult<()> {
        let from_key = self.key_for(from)?;
        let to_key = self.key_for(to)?;
        let node_ip = self.node_ip()?;
        let from_path = self.shared_path(from);
        let to_path = self.shared_path(to);

        self.owner_map.begin_tx()?;
        self.coordinator
            .lock_keys(&[from_key.as_str(), to_key.as_str()], self.lock_wait)
            .await?;

        if self.local.exists(from).await {
            self.local.copy(from, to).await?;
        }

        let mut shared_in = fs::File::open(&from_path)
            .await
            .map_err(|e| CacheError::Io(format!("open shared copy of {} failed: {}", from, e)))?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::Io(format!("create shared dirs for {} failed: {}", to, e)))?;
        }
        let mut shared_out = fs::File::create(&to_path)
            .await
            .map_err(|e| CacheError::Io(format!("open shared copy of {} failed: {}", to, e)))?;
        tokio::io::copy(&mut shared_in, &mut shared_out)
            .await
            .map_err(|e| CacheError::Io(format!("shared copy {} -> {} failed: {}", from, to, e)))?;
        shared_out
            .shutdown()
            .await
            .map_err(|e| CacheError::Io(format!("shared sink close of {} failed: {}", to, e)))?;

        self.owner_map.put_if_absent(&to_key, node_ip);
        self.owner_map.commit()?;
        trace!("copy {} -> {} committed", from, to);
        Ok(())
    }

    /// Cross-location alias: materialized as a copy when both the location
    /// and the path differ.
    pub async fn create_alias(&self, from: &Resource, to: &Resource) -> CacheResult<()> {
        if from.location() != to.location()
            && !from.path().is_empty()
            && !to.path().is_empty()
            && from.path() != to.path()
        {
            self.copy(from, to).await?;
        }
        Ok(())
    }

    pub async fn mkdirs(&self, resource: &Resource) -> CacheResult<()> {
        let key = self.key_for(resource)?;
        self.coordinator
            .acquire(&key, LockLevel::Write, self.lock_wait)
            .await?;
        let result = fs::create_dir_all(self.shared_path(resource))
            .await
            .map_err(|e| CacheError::Io(format!("mkdirs for {} failed: {}", resource, e)));
        let released = self.coordinator.release(&key, false);
        result?;
        released
    }

    pub async fn create_file(&self, resource: &Resource) -> CacheResult<()> {
        let key = self.key_for(resource)?;
        self.coordinator
            .acquire(&key, LockLevel::Write, self.lock_wait)
            .await?;
        let result: CacheResult<()> = async {
            let path = self.shared_path(resource);
            if fs::metadata(&path).await.is_ok() {
                return Ok(());
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    CacheError::Io(format!("create shared dirs for {} failed: {}", resource, e))
                })?;
            }
            fs::File::create(&path)
                .await
                .map_err(|e| CacheError::Io(format!("create shared file {} failed: {}", resource, e)))?;
            Ok(())
        }
        .await;
        let released = self.coordinator.release(&key, false);
        result?;
        released
    }

    pub async fn exists(&self, resource: &Resource) -> bool {
        if self.local.exists(resource).await {
            return true;
        }
        fs::metadata(self.shared_path(resource)).await.is_ok()
    }

    /// The shared copy is the stable reference for file attributes; a file
    /// being pulled into the local tier would report a short length.
    async fn stat_path(&self, resource: &Resource) -> Option<std::fs::Metadata> {
        let shared = self.shared_path(resource);
        if let Ok(meta) = fs::metadata(&shared).await {
            return Some(meta);
        }
        fs::metadata(self.local.detached_file(resource)).await.ok()
    }

    pub async fn length(&self, resource: &Resource) -> u64 {
        self.stat_path(resource).await.map(|m| m.len()).unwrap_or(0)
    }

    /// Millis since the epoch; 0 when the file is missing.
    pub async fn last_modified(&self, resource: &Resource) -> u64 {
        self.stat_path(resource)
            .await
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Lists the shared directory only.
    pub async fn list(&self, resource: &Resource) -> Vec<String> {
        let path = self.shared_detached_file(resource);
        let mut names = Vec::new();
        let Ok(mut entries) = fs::read_dir(&path).await else {
            return names;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names
    }

    pub async fn is_read_locked(&self, resource: &Resource) -> CacheResult<bool> {
        let key = self.key_for(resource)?;
        self.transfers
            .try_lock_and(resource, self.lock_wait, || async move {
                let file_locked = self.local.is_read_locked(resource).await;
                let map_locked = self.owner_map.is_locked(&key);
                trace!(
                    "read lock status for {}: local {}, cluster {}, key {}",
                    resource,
                    file_locked,
                    map_locked,
                    key
                );
                Ok(file_locked || map_locked)
            })
            .await
    }

    pub async fn is_write_locked(&self, resource: &Resource) -> CacheResult<bool> {
        let key = self.key_for(resource)?;
        self.transfers
            .try_lock_and(resource, self.lock_wait, || async move {
                let file_locked = self.local.is_write_locked(resource).await;
                let map_locked = self.owner_map.is_locked(&key);
                trace!(
                    "write lock status for {}: local {}, cluster {}, key {}",
                    resource,
                    file_locked,
                    map_locked,
                    key
                );
                Ok(file_locked || map_locked)
            })
            .await
    }

    pub async fn wait_for_read_unlock(&self, resource: &Resource) -> CacheResult<()> {
        let key = self.key_for(resource)?;
        self.transfers
            .try_lock_and(resource, self.lock_wait, || async move {
                self.local.wait_for_read_unlock(resource).await;
                self.coordinator
                    .wait_for_foreign_lock(&key, self.lock_wait)
                    .await
            })
            .await
    }

    pub async fn wait_for_write_unlock(&self, resource: &Resource) -> CacheResult<()> {
        let key = self.key_for(resource)?;
        self.transfers
            .try_lock_and(resource, self.lock_wait, || async move {
                self.local.wait_for_write_unlock(resource).await;
                self.coordinator
                    .wait_for_foreign_lock(&key, self.lock_wait)
                    .await
            })
            .await
    }

    pub fn transfer_for(&self, resource: &Resource) -> Arc<Transfer> {
        self.transfers.transfer_for(resource)
    }

    pub fn clear_transfers(&self) {
        self.transfers.clear();
    }

    /// Force-closes streams the current context leaked and drops its ambient
    /// state; delegates to the local tier's cleanup as well. The guards are
    /// released while the context still exists, so the counter-gated
    /// rollback sees the right counts.
    pub async fn cleanup_current_context(&self) {
        self.local.cleanup_current_context().await;
        let ctx = context::current();
        for guard in ctx.take_streams() {
            if let Some(guard) = guard.upgrade() {
                if !guard.is_released() {
                    warn!(
                        "stream for {} leaked by its context, releasing key {}",
                        guard.resource(),
                        guard.key()
                    );
                    guard.release_quietly();
                }
            }
        }
        context::remove_current();
    }
}

impl Drop for TieredStoreMgr {
    fn drop(&mut self) {
        self.shutdown();
    }
}
