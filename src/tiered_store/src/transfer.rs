use cache_lib::{CacheError, CacheResult, Resource};
use log::trace;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Shared identity object for one resource, carrying the mutex that
/// serializes every state-mutating operation on it inside this process.
pub struct Transfer {
    resource: Resource,
    op_lock: AsyncMutex<()>,
}

impl Transfer {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

/// Weak-valued registry of transfers. A transfer lives as long as someone
/// holds it (or is waiting on its mutex); dead entries are pruned on the
/// next miss.
pub struct TransferRegistry {
    transfers: Mutex<HashMap<Resource, Weak<Transfer>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
        }
    }

    pub fn transfer_for(&self, resource: &Resource) -> Arc<Transfer> {
        let mut transfers = self.transfers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = transfers.get(resource).and_then(Weak::upgrade) {
            return existing;
        }
        transfers.retain(|_, w| w.strong_count() > 0);
        let transfer = Arc::new(Transfer {
            resource: resource.clone(),
            op_lock: AsyncMutex::new(()),
        });
        transfers.insert(resource.clone(), Arc::downgrade(&transfer));
        transfer
    }

    pub fn clear(&self) {
        self.transfers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        let transfers = self.transfers.lock().unwrap_or_else(|e| e.into_inner());
        transfers.values().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `task` with the resource's mutex held. A positive `wait` bounds
    /// the acquisition and surfaces as a timeout error; a zero `wait` blocks
    /// until the mutex is free. The mutex is released before the task's
    /// result, success or error, is handed back.
    pub async fn try_lock_and<T, F, Fut>(
        &self,
        resource: &Resource,
        wait: Duration,
        task: F,
    ) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let transfer = self.transfer_for(resource);
        let guard = if wait.is_zero() {
            transfer.op_lock.lock().await
        } else {
            match tokio::time::timeout(wait, transfer.op_lock.lock()).await {
                Ok(guard) => guard,
                Err(_) => {
                    return Err(CacheError::Timeout(format!(
                        "did not get lock for resource {} in {:?}, timeout happened",
                        resource, wait
                    )))
                }
            }
        };
        trace!("resource mutex taken for {}", resource);
        let result = task().await;
        drop(guard);
        trace!("resource mutex released for {}", resource);
        result
    }
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}
