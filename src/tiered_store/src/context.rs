//! Ambient per-context state. A context is the current task (or thread when
//! not running inside one); streams opened by a context must be closed by it.

use crate::dual_writer::StreamGuard;
use cache_lib::context_id;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

lazy_static! {
    static ref OP_CONTEXTS: Mutex<HashMap<String, Arc<OpContext>>> = Mutex::new(HashMap::new());
}

/// Counter plus open-stream set for one context. The counter tracks how many
/// files of the context's transaction still hold a cluster lock; the commit
/// or rollback fires only when it drops back to zero.
pub struct OpContext {
    id: String,
    tx_file_count: AtomicI64,
    streams: Mutex<Vec<Weak<StreamGuard>>>,
}

impl OpContext {
    fn new(id: String) -> Self {
        Self {
            id,
            tx_file_count: AtomicI64::new(0),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn increment_tx_files(&self) -> i64 {
        self.tx_file_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement_tx_files(&self) -> i64 {
        self.tx_file_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn tx_files(&self) -> i64 {
        self.tx_file_count.load(Ordering::SeqCst)
    }

    pub fn register_stream(&self, guard: &Arc<StreamGuard>) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.retain(|w| w.strong_count() > 0);
        streams.push(Arc::downgrade(guard));
    }

    pub fn take_streams(&self) -> Vec<Weak<StreamGuard>> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *streams)
    }
}

/// The context of the calling task, created on first use.
pub fn current() -> Arc<OpContext> {
    let id = context_id();
    let mut contexts = OP_CONTEXTS.lock().unwrap_or_else(|e| e.into_inner());
    contexts
        .entry(id.clone())
        .or_insert_with(|| Arc::new(OpContext::new(id)))
        .clone()
}

pub fn remove_current() -> Option<Arc<OpContext>> {
    let id = context_id();
    let mut contexts = OP_CONTEXTS.lock().unwrap_or_else(|e| e.into_inner());
    contexts.remove(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_roundtrip() {
        let ctx = current();
        assert_eq!(ctx.tx_files(), 0);
        assert_eq!(ctx.increment_tx_files(), 1);
        assert_eq!(ctx.increment_tx_files(), 2);
        assert_eq!(ctx.decrement_tx_files(), 1);
        assert_eq!(ctx.decrement_tx_files(), 0);
        remove_current();
    }

    #[tokio::test]
    async fn test_same_task_same_context() {
        let a = current();
        let b = current();
        assert!(Arc::ptr_eq(&a, &b));
        remove_current();
    }

    #[tokio::test]
    async fn test_spawned_task_gets_own_context() {
        let here = current().id().to_string();
        let there = tokio::spawn(async { current().id().to_string() })
            .await
            .unwrap();
        assert_ne!(here, there);
        remove_current();
    }
}
