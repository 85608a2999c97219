use crate::{CacheReader, CacheResult, CacheWriter, Resource};
use async_trait::async_trait;
use std::path::PathBuf;

/// The fast local tier. Implementations must allow a reader to follow an
/// in-progress writer on the same path: a stream opened while a write is
/// running keeps producing bytes until the writer finishes, instead of
/// reporting an early end of file.
#[async_trait]
pub trait LocalCacheProvider: Send + Sync {
    async fn open_input(&self, resource: &Resource) -> CacheResult<CacheReader>;

    async fn open_output(&self, resource: &Resource) -> CacheResult<CacheWriter>;

    async fn exists(&self, resource: &Resource) -> bool;

    /// Returns whether a file was actually removed.
    async fn delete(&self, resource: &Resource) -> CacheResult<bool>;

    async fn copy(&self, from: &Resource, to: &Resource) -> CacheResult<()>;

    async fn length(&self, resource: &Resource) -> u64;

    async fn is_read_locked(&self, resource: &Resource) -> bool;

    async fn is_write_locked(&self, resource: &Resource) -> bool;

    async fn wait_for_read_unlock(&self, resource: &Resource);

    async fn wait_for_write_unlock(&self, resource: &Resource);

    /// The on-disk path of the resource inside this tier, whether or not it
    /// exists yet.
    fn detached_file(&self, resource: &Resource) -> PathBuf;

    async fn cleanup_current_context(&self);

    fn start_reporting(&self) {}

    fn stop_reporting(&self) {}
}
