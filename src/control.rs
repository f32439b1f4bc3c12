//! Node Control Plane
//!
//! Entry points the cluster API layer calls on this node: starting, watching
//! and stopping object restores, mount topology changes, inbound peer
//! responses and shutdown. Owns the node's [`TaskRegistry`] and registers
//! the task kinds this crate implements.
//!
//! Aborts never cross node boundaries here. A cluster-wide stop is the API
//! layer calling [`ControlPlane::stop`] on every node.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::ec::{
    EcGetFactory, MountId, ObjHeader, ObjectLocator, ObjectRestore, RestoreConfig, RestoreDeps,
    RestoreEngine, RestoreJobArgs, RestoreJobFactory, RestoreOptions, RestoreSnapshot,
};
use crate::error::{Error, Result};
use crate::xact::{downcast, BucketRef, EtlFactory, RenewArgs, Task, TaskKind, TaskRegistry};

/// Node control plane
pub struct ControlPlane {
    registry: Arc<TaskRegistry>,
    deps: RestoreDeps,
}

impl ControlPlane {
    /// Register the EC-GET, object-restore and inline-ETL kinds with the
    /// registry.
    pub fn new(
        registry: Arc<TaskRegistry>,
        config: RestoreConfig,
        deps: RestoreDeps,
        locator: Arc<dyn ObjectLocator>,
    ) -> Self {
        registry.register(Arc::new(EcGetFactory::new(config, deps.clone())));
        registry.register(Arc::new(RestoreJobFactory::new(locator)));
        registry.register(Arc::new(EtlFactory));
        Self { registry, deps }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    // =========================================================================
    // Restores
    // =========================================================================

    /// Start restoring one object. `None` when the object is already present
    /// locally and there is nothing to do.
    #[instrument(skip(self, options))]
    pub async fn start_restore(
        &self,
        bucket: &str,
        object: &str,
        options: RestoreOptions,
    ) -> Result<Option<Uuid>> {
        let bucket = BucketRef::new(bucket);
        if self.deps.store.contains(&bucket, object).await {
            debug!(object = %bucket.cname(object), "Already present locally");
            return Ok(None);
        }

        let args = RenewArgs::new().with_custom(RestoreJobArgs {
            object: object.to_string(),
            options,
        });
        let renewal = self
            .registry
            .renew(TaskKind::OBJECT_RESTORE, Some(&bucket), args)
            .await?;
        Ok(Some(renewal.task.id()))
    }

    /// Start one restore per object. If any start fails, the ones already
    /// started by this call are stopped and the error returned.
    #[instrument(skip(self, objects, options), fields(count = objects.len()))]
    pub async fn start_restore_all(
        &self,
        bucket: &str,
        objects: &[String],
        options: RestoreOptions,
    ) -> Result<Vec<Uuid>> {
        let mut started = Vec::with_capacity(objects.len());
        for object in objects {
            match self.start_restore(bucket, object, options.clone()).await {
                Ok(Some(id)) => started.push(id),
                Ok(None) => {}
                Err(e) => {
                    warn!(object = %object, error = %e, rolled_back = started.len(), "Batch start failed");
                    let cause = format!("batch start failed: {}", e);
                    for id in &started {
                        if let Err(stop_err) = self.registry.stop(*id, &cause) {
                            warn!(task = %id, error = %stop_err, "Rollback stop failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(started)
    }

    fn restore_job(&self, id: Uuid) -> Result<Arc<ObjectRestore>> {
        let task = self.registry.get(id)?;
        downcast::<ObjectRestore>(task).ok_or_else(|| Error::TaskMismatch {
            task: id.to_string(),
            expected: TaskKind::OBJECT_RESTORE.to_string(),
        })
    }

    pub fn get_snapshot(&self, id: Uuid) -> Result<RestoreSnapshot> {
        Ok(self.restore_job(id)?.restore_snapshot())
    }

    /// Stop a task on this node. Stopping a task that already finished is
    /// not an error.
    pub fn stop(&self, id: Uuid) -> Result<()> {
        if !self.registry.stop(id, "stopped by user")? {
            debug!(task = %id, "Task already finished or aborting");
        }
        Ok(())
    }

    /// Wait until a job finishes. A job that ended with an error or abort
    /// yields [`Error::Aborted`]; a caller-side timeout leaves the job
    /// running.
    pub async fn wait(&self, id: Uuid, timeout: Option<Duration>) -> Result<()> {
        let job = self.restore_job(id)?;
        let finished = job.base().wait_finished();
        match timeout {
            Some(duration) => tokio::time::timeout(duration, finished)
                .await
                .map_err(|_| Error::Timeout {
                    what: job.base().name(),
                    duration,
                })?,
            None => finished.await,
        }

        match job.restore_snapshot().error_text {
            Some(cause) => Err(Error::Aborted {
                task: job.base().name(),
                cause,
            }),
            None => Ok(()),
        }
    }

    /// Wait for all jobs; the first error wins.
    pub async fn wait_all(&self, ids: &[Uuid], timeout: Option<Duration>) -> Result<()> {
        try_join_all(ids.iter().map(|id| self.wait(*id, timeout))).await?;
        Ok(())
    }

    // =========================================================================
    // Engines
    // =========================================================================

    fn engines(&self) -> Vec<Arc<RestoreEngine>> {
        self.registry
            .running(TaskKind::EC_GET)
            .into_iter()
            .filter_map(downcast::<RestoreEngine>)
            .collect()
    }

    fn engine(&self, bucket: &BucketRef) -> Option<Arc<RestoreEngine>> {
        self.registry
            .find(TaskKind::EC_GET, Some(bucket))
            .and_then(downcast::<RestoreEngine>)
    }

    /// Add a mount to the node and to every running engine.
    pub fn attach_mount(&self, mount: MountId) {
        self.deps.mounts.attach(mount.clone());
        for engine in self.engines() {
            engine.attach_mount(mount.clone());
        }
        info!(mount = %mount, "Mount attached");
    }

    /// Remove a mount from the node and from every running engine.
    pub fn detach_mount(&self, mount: MountId) {
        if !self.deps.mounts.detach(&mount) {
            warn!(mount = %mount, "Detaching unknown mount");
        }
        for engine in self.engines() {
            engine.detach_mount(mount.clone());
        }
        info!(mount = %mount, "Mount detached");
    }

    /// Mark a mount unavailable. Engines keep its worker so re-enabling needs
    /// no restart.
    pub fn disable_mount(&self, mount: &MountId) -> Result<()> {
        self.deps.mounts.disable(mount)
    }

    /// Route an inbound peer response to the bucket's engine.
    pub async fn on_slice_response<R>(&self, hdr: &ObjHeader, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        match self.engine(&hdr.bucket) {
            Some(engine) => engine.dispatch_resp(hdr, reader).await,
            None => {
                warn!(bucket = %hdr.bucket, object = %hdr.object, "No running engine for response");
                Err(Error::NoWriter {
                    uname: hdr.uname().to_string(),
                })
            }
        }
    }

    /// Stop accepting EC requests for a bucket and terminate its engine.
    pub fn clear_requests(&self, bucket: &str) -> Result<()> {
        let bucket = BucketRef::new(bucket);
        let engine = self
            .engine(&bucket)
            .ok_or_else(|| Error::TaskNotFound(format!("{}[{}]", TaskKind::EC_GET, bucket)))?;
        engine.clear_requests();
        Ok(())
    }

    /// Abort every live task on this node.
    pub fn shutdown(&self, cause: &str) -> usize {
        self.registry.abort_all(cause)
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("registry", &self.registry)
            .field("deps", &self.deps)
            .finish()
    }
}
