use async_trait::async_trait;
use cache_lib::{
    normalize_rel, CacheError, CacheReader, CacheResult, CacheWriter, LocalCacheProvider,
    PathGenerator, Resource,
};
use fs2::FileExt;
use log::{debug, trace};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const UNLOCK_POLL_MILLIS: u64 = 50;

#[derive(Default)]
struct PathGate {
    writers: u32,
    readers: u32,
    wakers: Vec<Waker>,
}

#[derive(Clone)]
struct GateTable {
    gates: Arc<Mutex<HashMap<PathBuf, PathGate>>>,
}

impl GateTable {
    fn new() -> Self {
        Self {
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, PathGate>> {
        self.gates.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn writer_start(&self, path: &Path) {
        self.locked().entry(path.to_path_buf()).or_default().writers += 1;
    }

    fn writer_end(&self, path: &Path) {
        let wakers = {
            let mut gates = self.locked();
            let Some(gate) = gates.get_mut(path) else {
                return;
            };
            gate.writers = gate.writers.saturating_sub(1);
            let wakers = std::mem::take(&mut gate.wakers);
            if gate.writers == 0 && gate.readers == 0 {
                gates.remove(path);
            }
            wakers
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn reader_start(&self, path: &Path) {
        self.locked().entry(path.to_path_buf()).or_default().readers += 1;
    }

    fn reader_end(&self, path: &Path) {
        let mut gates = self.locked();
        let Some(gate) = gates.get_mut(path) else {
            return;
        };
        gate.readers = gate.readers.saturating_sub(1);
        if gate.writers == 0 && gate.readers == 0 && gate.wakers.is_empty() {
            gates.remove(path);
        }
    }

    /// Wakes parked readers after a writer made progress.
    fn notify_progress(&self, path: &Path) {
        let wakers = {
            let mut gates = self.locked();
            match gates.get_mut(path) {
                Some(gate) => std::mem::take(&mut gate.wakers),
                None => Vec::new(),
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Parks a reader that hit end of file while a writer is still active.
    /// The check and the waker registration happen under one lock so the
    /// writer cannot finish in between.
    fn park_if_writing(&self, path: &Path, waker: Waker) -> bool {
        let mut gates = self.locked();
        match gates.get_mut(path) {
            Some(gate) if gate.writers > 0 => {
                gate.wakers.push(waker);
                true
            }
            _ => false,
        }
    }

    fn writers(&self, path: &Path) -> u32 {
        self.locked().get(path).map(|g| g.writers).unwrap_or(0)
    }

    fn readers(&self, path: &Path) -> u32 {
        self.locked().get(path).map(|g| g.readers).unwrap_or(0)
    }
}

struct TrackedWriter {
    file: File,
    path: PathBuf,
    gates: GateTable,
    done: bool,
}

impl TrackedWriter {
    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.gates.writer_end(&self.path);
        }
    }
}

impl AsyncWrite for TrackedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.gates.notify_progress(&this.path);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_shutdown(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.finish();
                Poll::Ready(result)
            }
        }
    }
}

impl Drop for TrackedWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

struct TrackedReader {
    file: File,
    path: PathBuf,
    gates: GateTable,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.file).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                if read == 0
                    && buf.remaining() > 0
                    && this.gates.park_if_writing(&this.path, cx.waker().clone())
                {
                    // End of the bytes written so far, but the writer is
                    // still running; resume when it makes progress.
                    return Poll::Pending;
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.gates.reader_end(&self.path);
    }
}

/// Disk-backed local tier. A path being written stays joinable: readers
/// opened against it keep producing bytes until the writer finishes, and the
/// read/write gate doubles as the lock status the delete path consults.
pub struct JournaledLocalStore {
    base_dir: PathBuf,
    path_gen: Arc<dyn PathGenerator>,
    gates: GateTable,
}

impl JournaledLocalStore {
    pub fn new(base_dir: PathBuf, path_gen: Arc<dyn PathGenerator>) -> CacheResult<Self> {
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| CacheError::Io(format!("create local base dir failed: {}", e)))?;
        Ok(Self {
            base_dir,
            path_gen,
            gates: GateTable::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, resource: &Resource) -> PathBuf {
        self.base_dir
            .join(normalize_rel(&self.path_gen.path_for(resource)))
    }
}

#[async_trait]
impl LocalCacheProvider for JournaledLocalStore {
    async fn open_input(&self, resource: &Resource) -> CacheResult<CacheReader> {
        let path = self.file_path(resource);
        let file = File::open(&path)
            .await
            .map_err(|e| CacheError::Io(format!("open local copy of {} failed: {}", resource, e)))?;
        self.gates.reader_start(&path);
        trace!("local reader opened for {}", resource);
        Ok(Box::pin(TrackedReader {
            file,
            path,
            gates: self.gates.clone(),
        }))
    }

    async fn open_output(&self, resource: &Resource) -> CacheResult<CacheWriter> {
        let path = self.file_path(resource);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::Io(format!("create local dirs for {} failed: {}", resource, e))
            })?;
        }

        let open_path = path.clone();
        let std_file = tokio::task::spawn_blocking(move || -> io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&open_path)?;
            match file.try_lock_exclusive() {
                Ok(()) => Ok(file),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::new(
                    e.kind(),
                    "local copy already locked for writing",
                )),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| CacheError::Io(format!("open local writer join error: {}", e)))?
        .map_err(|e| CacheError::Io(format!("open local copy of {} failed: {}", resource, e)))?;

        self.gates.writer_start(&path);
        trace!("local writer opened for {}", resource);
        Ok(Box::pin(TrackedWriter {
            file: File::from_std(std_file),
            path,
            gates: self.gates.clone(),
            done: false,
        }))
    }

    async fn exists(&self, resource: &Resource) -> bool {
        fs::metadata(self.file_path(resource)).await.is_ok()
    }

    async fn delete(&self, resource: &Resource) -> CacheResult<bool> {
        let path = self.file_path(resource);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("local copy deleted for {}", resource);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::Io(format!(
                "delete local copy of {} failed: {}",
                resource, e
            ))),
        }
    }

    async fn copy(&self, from: &Resource, to: &Resource) -> CacheResult<()> {
        let from_path = self.file_path(from);
        let to_path = self.file_path(to);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::Io(format!("create local dirs for {} failed: {}", to, e)))?;
        }
        fs::copy(&from_path, &to_path)
            .await
            .map_err(|e| CacheError::Io(format!("local copy {} -> {} failed: {}", from, to, e)))?;
        Ok(())
    }

    async fn length(&self, resource: &Resource) -> u64 {
        fs::metadata(self.file_path(resource))
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    async fn is_read_locked(&self, resource: &Resource) -> bool {
        self.gates.readers(&self.file_path(resource)) > 0
    }

    async fn is_write_locked(&self, resource: &Resource) -> bool {
        self.gates.writers(&self.file_path(resource)) > 0
    }

    async fn wait_for_read_unlock(&self, resource: &Resource) {
        let path = self.file_path(resource);
        while self.gates.readers(&path) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(UNLOCK_POLL_MILLIS)).await;
        }
    }

    async fn wait_for_write_unlock(&self, resource: &Resource) {
        let path = self.file_path(resource);
        while self.gates.writers(&path) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(UNLOCK_POLL_MILLIS)).await;
        }
    }

    fn detached_file(&self, resource: &Resource) -> PathBuf {
        self.file_path(resource)
    }

    async fn cleanup_current_context(&self) {
        trace!("local store has no per-context state to clean");
    }
}
