//! Per-mount worker
//!
//! One worker per local mount pulls requests from a bounded FIFO queue and
//! processes them strictly one at a time:
//!
//! ```text
//! recv ─► register writer ─► send fetch ─► await writer ─► store.put ─► resolve
//!                                             │
//!                           slice timeout / abandon ─► resolve with error
//! ```
//!
//! Stopping is two-level. `stop` lets the current item finish and exits
//! before the next one; `abandon` (engine abort, clear) also gives up on the
//! item in flight. Either way the loop hands its receiver back so the engine
//! can fail whatever is still queued.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::engine::EngineCore;
use super::request::{MountId, ObjectRef, Progress, Request};
use super::transport::SliceFetch;
use super::writer::{SliceWriter, UniqueName};
use crate::error::{Error, Result};

/// Handle to a running worker
pub struct Worker {
    mount: MountId,
    tx: mpsc::Sender<Request>,
    stop: CancellationToken,
    abandon: CancellationToken,
    handle: Mutex<Option<JoinHandle<mpsc::Receiver<Request>>>>,
}

impl Worker {
    /// Start a worker for `mount`. Its abandon signal is tied to the engine's
    /// abort signal.
    pub(crate) fn spawn(mount: MountId, core: Arc<EngineCore>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(core.config.burst_size.max(1));
        let abandon = core.base.abort_token().child_token();
        let stop = abandon.child_token();

        let runner = Runner {
            mount: mount.clone(),
            core,
            stop: stop.clone(),
            abandon: abandon.clone(),
        };
        let handle = tokio::spawn(runner.run(rx));
        debug!(mount = %mount, "Worker started");

        Arc::new(Self {
            mount,
            tx,
            stop,
            abandon,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn mount(&self) -> &MountId {
        &self.mount
    }

    /// Enqueue side of the worker's queue. `send` waits while the queue is
    /// full.
    pub fn sender(&self) -> mpsc::Sender<Request> {
        self.tx.clone()
    }

    /// Requests currently queued
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn signal_stop(&self, abandon: bool) {
        if abandon {
            self.abandon.cancel();
        } else {
            self.stop.cancel();
        }
    }

    /// Wait for the loop to exit and return the requests it never started.
    /// Callers blocked on a full queue are released with an error.
    pub async fn join(&self) -> Vec<Request> {
        let Some(handle) = self.handle.lock().take() else {
            return Vec::new();
        };
        let mut rx = match handle.await {
            Ok(rx) => rx,
            Err(e) => {
                error!(mount = %self.mount, error = %e, "Worker loop failed");
                return Vec::new();
            }
        };
        // after close, recv yields None only once outstanding permits are
        // used or dropped
        rx.close();
        let mut left = Vec::new();
        while let Some(req) = rx.recv().await {
            left.push(req);
        }
        if !left.is_empty() {
            debug!(mount = %self.mount, count = left.len(), "Worker left queued requests");
        }
        left
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("mount", &self.mount)
            .field("queued", &self.queue_len())
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Loop
// =============================================================================

struct Runner {
    mount: MountId,
    core: Arc<EngineCore>,
    stop: CancellationToken,
    abandon: CancellationToken,
}

impl Runner {
    async fn run(self, mut rx: mpsc::Receiver<Request>) -> mpsc::Receiver<Request> {
        loop {
            let req = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };
            let progress = req.progress().cloned();
            let result = self.restore(&req.object, progress).await;
            if let Err(e) = &result {
                warn!(mount = %self.mount, object = %req.object.cname(), error = %e, "Restore failed");
            }
            self.core.resolve(req, result);
        }
        debug!(mount = %self.mount, "Worker stopped");
        rx
    }

    async fn restore(&self, obj: &ObjectRef, progress: Option<Arc<Progress>>) -> Result<()> {
        let started = Instant::now();
        let uname = UniqueName::for_object(obj);

        let (writer, rx) = SliceWriter::new(uname.clone(), obj.size, progress);
        self.core.writers.register(writer)?;
        let fetched = self.fetch(&uname, rx).await;
        self.core.writers.unregister(&uname);

        let data = fetched?;
        let bytes = data.len() as u64;
        self.core.store.put(obj, data).await?;
        self.core.stats.record_decode(started.elapsed(), bytes);
        self.core.base.add_bytes(bytes);
        debug!(mount = %self.mount, object = %obj.cname(), bytes, "Object restored");
        Ok(())
    }

    /// Issue the fetch and wait for the router to resolve the writer.
    async fn fetch(
        &self,
        uname: &UniqueName,
        mut rx: oneshot::Receiver<Result<Bytes>>,
    ) -> Result<Bytes> {
        self.core.transport.send_fetch(SliceFetch::from(uname)).await?;

        let timeout = self.core.config.slice_timeout;
        tokio::select! {
            biased;
            resolved = tokio::time::timeout(timeout, &mut rx) => match resolved {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::Internal(format!("slice writer for {} dropped", uname))),
                Err(_) => Err(Error::Timeout {
                    what: format!("{} slices", uname),
                    duration: timeout,
                }),
            },
            _ = self.abandon.cancelled() => {
                Err(self.core.stopped_error(&format!("worker {} stopped", self.mount)))
            }
        }
    }
}
