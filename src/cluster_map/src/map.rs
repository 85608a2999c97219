use async_trait::async_trait;
use cache_lib::{context_id, CacheError, CacheResult};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Transaction status as seen by the owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    NoTransaction,
    Active,
    Preparing,
    Prepared,
    Committing,
    RollingBack,
}

impl TxStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TxStatus::Active
                | TxStatus::Preparing
                | TxStatus::Prepared
                | TxStatus::Committing
                | TxStatus::RollingBack
        )
    }
}

/// Fired after an entry has been dropped by the expiry sweeper.
#[async_trait]
pub trait ExpireListener<V>: Send + Sync {
    async fn on_expired(&self, key: &str, value: V);
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

struct KeyLock {
    owner: String,
    notify: Arc<Notify>,
}

struct TxState {
    status: TxStatus,
    keys: Vec<String>,
}

struct MapInner<V> {
    entries: HashMap<String, Entry<V>>,
    locks: HashMap<String, KeyLock>,
    txs: HashMap<String, TxState>,
}

/// A cluster-visible key/value map doubling as an advisory lock service.
///
/// Data operations apply immediately. Transactions exist to scope key locks:
/// a lock belongs to the transaction of the context that took it, and commit
/// or rollback releases every lock the transaction still holds. Cooperating
/// nodes respect the locks; nothing is enforced against a writer that never
/// asks.
pub struct ClusterMap<V> {
    name: String,
    default_ttl: Option<Duration>,
    inner: Mutex<MapInner<V>>,
    listeners: RwLock<Vec<Arc<dyn ExpireListener<V>>>>,
    commits: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> ClusterMap<V> {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_ttl(name, None)
    }

    pub fn with_default_ttl(name: &str, ttl: Duration) -> Arc<Self> {
        Self::with_ttl(name, Some(ttl))
    }

    fn with_ttl(name: &str, default_ttl: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            default_ttl,
            inner: Mutex::new(MapInner {
                entries: HashMap::new(),
                locks: HashMap::new(),
                txs: HashMap::new(),
            }),
            listeners: RwLock::new(Vec::new()),
            commits: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MapInner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let inner = self.locked();
        let entry = inner.entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: &str, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: &str, value: V, ttl: Option<Duration>) {
        let mut inner = self.locked();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Returns the previous value when the key was already present.
    pub fn put_if_absent(&self, key: &str, value: V) -> Option<V> {
        let mut inner = self.locked();
        let now = Instant::now();
        if let Some(existing) = inner.entries.get(key) {
            if !existing.is_expired(now) {
                return Some(existing.value.clone());
            }
        }
        let ttl = self.default_ttl;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        None
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.locked();
        inner.entries.remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.locked().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn begin_tx(&self) -> CacheResult<()> {
        let ctx = context_id();
        let mut inner = self.locked();
        if let Some(tx) = inner.txs.get(&ctx) {
            if tx.status.is_active() {
                return Err(CacheError::InvalidState(format!(
                    "transaction already active on map {} for context {}",
                    self.name, ctx
                )));
            }
        }
        trace!("map {}: transaction started for context {}", self.name, ctx);
        inner.txs.insert(
            ctx,
            TxState {
                status: TxStatus::Active,
                keys: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn tx_status(&self) -> TxStatus {
        let ctx = context_id();
        let inner = self.locked();
        inner
            .txs
            .get(&ctx)
            .map(|tx| tx.status)
            .unwrap_or(TxStatus::NoTransaction)
    }

    pub fn commit(&self) -> CacheResult<()> {
        self.finish_tx(true)
    }

    pub fn rollback(&self) -> CacheResult<()> {
        self.finish_tx(false)
    }

    fn finish_tx(&self, commit: bool) -> CacheResult<()> {
        let ctx = context_id();
        let notifies = {
            let mut inner = self.locked();
            let tx = inner.txs.get_mut(&ctx).ok_or_else(|| {
                CacheError::InvalidState(format!(
                    "no active transaction on map {} for context {}",
                    self.name, ctx
                ))
            })?;
            if !tx.status.is_active() {
                return Err(CacheError::InvalidState(format!(
                    "transaction on map {} is not active for context {}",
                    self.name, ctx
                )));
            }
            tx.status = if commit {
                TxStatus::Committing
            } else {
                TxStatus::RollingBack
            };
            let keys = std::mem::take(&mut tx.keys);
            let mut notifies = Vec::new();
            for key in keys {
                if let Some(lock) = inner.locks.get(&key) {
                    if lock.owner == ctx {
                        let lock = inner.locks.remove(&key).unwrap();
                        notifies.push(lock.notify);
                    }
                }
            }
            inner.txs.remove(&ctx);
            notifies
        };
        for notify in notifies {
            notify.notify_waiters();
            notify.notify_one();
        }
        if commit {
            self.commits.fetch_add(1, Ordering::SeqCst);
            trace!("map {}: transaction committed for context {}", self.name, context_id());
        } else {
            trace!("map {}: transaction rolled back for context {}", self.name, context_id());
        }
        Ok(())
    }

    /// Total committed transactions since construction.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Locks all the given keys for the caller's active transaction in one
    /// step. Keys already held by this transaction pass through; a key held
    /// by any other owner fails the whole call without taking anything.
    pub fn lock(&self, keys: &[&str]) -> CacheResult<()> {
        let ctx = context_id();
        let mut inner = self.locked();
        match inner.txs.get(&ctx) {
            Some(tx) if tx.status.is_active() => {}
            _ => {
                return Err(CacheError::InvalidState(format!(
                    "lock on map {} requires an active transaction, context {}",
                    self.name, ctx
                )))
            }
        }
        for key in keys {
            if let Some(lock) = inner.locks.get(*key) {
                if lock.owner != ctx {
                    return Err(CacheError::Timeout(format!(
                        "key {} on map {} is locked by {}",
                        key, self.name, lock.owner
                    )));
                }
            }
        }
        for key in keys {
            if !inner.locks.contains_key(*key) {
                inner.locks.insert(
                    key.to_string(),
                    KeyLock {
                        owner: ctx.clone(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                inner
                    .txs
                    .get_mut(&ctx)
                    .expect("transaction checked above")
                    .keys
                    .push(key.to_string());
                trace!("map {}: key {} locked by {}", self.name, key, ctx);
            }
        }
        Ok(())
    }

    pub fn unlock(&self, key: &str) -> CacheResult<()> {
        let ctx = context_id();
        let notify = {
            let mut inner = self.locked();
            match inner.locks.get(key) {
                None => {
                    trace!("map {}: unlock of key {} which is not locked", self.name, key);
                    return Ok(());
                }
                Some(lock) if lock.owner != ctx => {
                    return Err(CacheError::InvalidState(format!(
                        "key {} on map {} is locked by {}, not by {}",
                        key, self.name, lock.owner, ctx
                    )));
                }
                Some(_) => {}
            }
            let lock = inner.locks.remove(key).unwrap();
            if let Some(tx) = inner.txs.get_mut(&ctx) {
                tx.keys.retain(|k| k.as_str() != key);
            }
            lock.notify
        };
        notify.notify_waiters();
        notify.notify_one();
        trace!("map {}: key {} unlocked by {}", self.name, key, ctx);
        Ok(())
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locked().locks.contains_key(key)
    }

    pub fn is_locked_by_current_tx(&self, key: &str) -> bool {
        let ctx = context_id();
        let inner = self.locked();
        matches!(inner.locks.get(key), Some(lock) if lock.owner == ctx)
    }

    pub fn get_lock_owner(&self, key: &str) -> Option<String> {
        self.locked().locks.get(key).map(|l| l.owner.clone())
    }

    pub fn add_listener(&self, listener: Arc<dyn ExpireListener<V>>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Drops expired entries and fires the post-expiration listeners.
    pub async fn sweep_expired(&self) {
        let expired: Vec<(String, V)> = {
            let mut inner = self.locked();
            let now = Instant::now();
            let keys: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.entries.remove(&k).map(|e| (k, e.value)))
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        debug!("map {}: {} entries expired", self.name, expired.len());
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (key, value) in expired {
            for listener in listeners.iter() {
                listener.on_expired(&key, value.clone()).await;
            }
        }
    }

    pub fn start_expiry_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep_expired().await;
            }
        })
    }

    /// Drops any transaction state left behind by a context that went away
    /// without finishing. Locks it held are released.
    pub fn abandon_tx_for(&self, ctx: &str) {
        let notifies = {
            let mut inner = self.locked();
            let Some(tx) = inner.txs.remove(ctx) else {
                return;
            };
            warn!(
                "map {}: abandoning transaction of context {} with {} held keys",
                self.name,
                ctx,
                tx.keys.len()
            );
            let mut notifies = Vec::new();
            for key in tx.keys {
                if let Some(lock) = inner.locks.get(&key) {
                    if lock.owner == ctx {
                        notifies.push(inner.locks.remove(&key).unwrap().notify);
                    }
                }
            }
            notifies
        };
        for notify in notifies {
            notify.notify_waiters();
            notify.notify_one();
        }
    }
}
