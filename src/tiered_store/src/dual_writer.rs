use crate::coordinator::LockCoordinator;
use cache_lib::{CacheResult, CacheWriter, Resource};
use cluster_map::ClusterMap;
use log::{debug, trace, warn};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

/// Owns the obligation to release the cluster lock of one dual stream,
/// exactly once. The open-stream registry keeps weak references to guards so
/// a context cleanup can free what a leaked stream left behind.
pub struct StreamGuard {
    key: String,
    resource: Resource,
    coordinator: Arc<LockCoordinator>,
    released: AtomicBool,
}

impl StreamGuard {
    fn new(key: String, resource: Resource, coordinator: Arc<LockCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            key,
            resource,
            coordinator,
            released: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Marks the guard released only after the coordinator release went
    /// through, so a failed release can be retried.
    pub fn release(&self, commit: bool) -> CacheResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.coordinator.release(&self.key, commit)?;
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn release_quietly(&self) {
        if let Err(e) = self.release(false) {
            warn!(
                "forced release failed for key {}, resource {}: {}",
                self.key, self.resource, e
            );
        }
    }
}

enum MirrorState {
    Idle,
    /// Bytes already accepted by the local sink, still being replayed into
    /// the shared sink. `len` is reported to the caller once the replay is
    /// done.
    Mirroring {
        buf: Vec<u8>,
        pos: usize,
        len: usize,
    },
}

#[derive(Default)]
struct ShutdownState {
    started: bool,
    release_result: Option<CacheResult<()>>,
    local_done: bool,
    shared_done: bool,
}

/// Write-only stream mirroring every byte to the local and shared sinks, in
/// that order. Close is the single commit point of the write: the cluster
/// lock is released with a commit when every write landed in both sinks, and
/// with a rollback when any sink failed along the way.
pub struct DualWriter {
    local: CacheWriter,
    shared: CacheWriter,
    guard: Arc<StreamGuard>,
    local_files: Arc<ClusterMap<Resource>>,
    resource: Resource,
    errored: bool,
    mirror: MirrorState,
    flush_local_done: bool,
    shutdown: ShutdownState,
    recorded: bool,
}

impl DualWriter {
    pub fn new(
        local: CacheWriter,
        shared: CacheWriter,
        coordinator: Arc<LockCoordinator>,
        local_files: Arc<ClusterMap<Resource>>,
        key: String,
        resource: Resource,
    ) -> Self {
        let guard = StreamGuard::new(key, resource.clone(), coordinator);
        Self {
            local,
            shared,
            guard,
            local_files,
            resource,
            errored: false,
            mirror: MirrorState::Idle,
            flush_local_done: false,
            shutdown: ShutdownState::default(),
            recorded: false,
        }
    }

    pub fn guard(&self) -> &Arc<StreamGuard> {
        &self.guard
    }

    fn record_local_file(&mut self) {
        if self.recorded {
            return;
        }
        self.local_files
            .put(self.resource.path(), self.resource.clone());
        self.recorded = true;
    }

    /// Drives the shared-sink replay of bytes the local sink already took.
    fn poll_mirror(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<usize>>> {
        loop {
            match &mut self.mirror {
                MirrorState::Idle => return Poll::Ready(Ok(None)),
                MirrorState::Mirroring { buf, pos, len } => {
                    if *pos >= buf.len() {
                        let len = *len;
                        self.mirror = MirrorState::Idle;
                        return Poll::Ready(Ok(Some(len)));
                    }
                    match self.shared.as_mut().poll_write(cx, &buf[*pos..]) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(0)) => {
                            self.errored = true;
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "shared sink accepted no bytes",
                            )));
                        }
                        Poll::Ready(Ok(n)) => *pos += n,
                        Poll::Ready(Err(e)) => {
                            self.errored = true;
                            return Poll::Ready(Err(e));
                        }
                    }
                }
            }
        }
    }
}

impl AsyncWrite for DualWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Finish any half-mirrored chunk first; its length is what the
        // caller gets credited for.
        match this.poll_mirror(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(Some(len))) => return Poll::Ready(Ok(len)),
            Poll::Ready(Ok(None)) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.local.as_mut().poll_write(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(0)) => {
                this.errored = true;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "local sink accepted no bytes",
                )))
            }
            Poll::Ready(Ok(n)) => {
                this.mirror = MirrorState::Mirroring {
                    buf: buf[..n].to_vec(),
                    pos: 0,
                    len: n,
                };
                match this.poll_mirror(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Ok(Some(len))) => Poll::Ready(Ok(len)),
                    Poll::Ready(Ok(None)) => Poll::Ready(Ok(n)),
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                }
            }
            Poll::Ready(Err(e)) => {
                this.errored = true;
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.poll_mirror(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(_)) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
        }

        if !this.flush_local_done {
            match this.local.as_mut().poll_flush(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => this.flush_local_done = true,
                Poll::Ready(Err(e)) => {
                    this.errored = true;
                    return Poll::Ready(Err(e));
                }
            }
        }

        match this.shared.as_mut().poll_flush(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                this.flush_local_done = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.errored = true;
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.shutdown.started {
            if this.guard.is_released() {
                trace!(
                    "dual stream for {} already closed, key {}",
                    this.resource,
                    this.guard.key()
                );
                // A pathological close-after-close can still find the key
                // locked when an earlier release only partially succeeded.
                if this
                    .guard
                    .coordinator
                    .owner_map()
                    .is_locked_by_current_tx(this.guard.key())
                {
                    if let Err(e) = this.guard.coordinator.release(this.guard.key(), false) {
                        warn!(
                            "late release failed for key {}, resource {}: {}",
                            this.guard.key(),
                            this.resource,
                            e
                        );
                    }
                }
                return Poll::Ready(Ok(()));
            }

            let commit = !this.errored;
            this.shutdown.release_result = Some(this.guard.release(commit));
            this.shutdown.started = true;
        }

        // Both sinks close quietly whatever the release said.
        if !this.shutdown.local_done {
            match this.local.as_mut().poll_shutdown(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    if let Err(e) = result {
                        debug!("local sink close failed for {}: {}", this.resource, e);
                    }
                    this.shutdown.local_done = true;
                }
            }
        }
        if !this.shutdown.shared_done {
            match this.shared.as_mut().poll_shutdown(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    if let Err(e) = result {
                        debug!("shared sink close failed for {}: {}", this.resource, e);
                    }
                    this.shutdown.shared_done = true;
                }
            }
        }

        this.record_local_file();

        match this.shutdown.release_result.take() {
            None | Some(Ok(())) => Poll::Ready(Ok(())),
            Some(Err(e)) => {
                // Leave the state machine ready for a retrying close.
                this.shutdown = ShutdownState::default();
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e.to_string())))
            }
        }
    }
}

impl Drop for DualWriter {
    fn drop(&mut self) {
        if !self.guard.is_released() {
            warn!(
                "dual stream for {} dropped without close, releasing key {} with rollback",
                self.resource,
                self.guard.key()
            );
            self.guard.release_quietly();
        }
    }
}
