//! Single-object restore job
//!
//! An [`ObjectRestore`] is the handle a control-plane caller gets back from
//! `start_restore`. It renews the bucket's EC-GET engine, submits one
//! request, and tracks bytes received until the request resolves.
//!
//! Aborting a job stops the caller's wait only. The engine keeps working on
//! the request (abort is not retroactive), and a caller-side timeout behaves
//! the same way.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::engine::{RestoreEngine, RestoreOptions};
use super::request::{ObjectRef, Progress, Request};
use super::store::ObjectLocator;
use crate::error::{Error, Result};
use crate::xact::{
    downcast, AdmissionDecision, BucketRef, RenewArgs, Task, TaskBase, TaskFactory, TaskKind,
    TaskRegistry, TaskSnapshot,
};

/// Custom renew argument of an [`ObjectRestore`]
#[derive(Debug, Clone, Default)]
pub struct RestoreJobArgs {
    pub object: String,
    pub options: RestoreOptions,
}

/// Control-plane view of a restore job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSnapshot {
    pub id: Uuid,
    pub finished: bool,
    pub aborted: bool,
    pub bytes_total: u64,
    pub bytes_done: u64,
    /// Abort cause or failure, if any
    pub error_text: Option<String>,
}

/// Restore of one object through the bucket's engine
pub struct ObjectRestore {
    base: TaskBase,
    object: ObjectRef,
    options: RestoreOptions,
    engine: Arc<RestoreEngine>,
    progress: Arc<Progress>,
    request: Mutex<Option<Request>>,
    rx: Mutex<Option<tokio::sync::oneshot::Receiver<Result<()>>>>,
}

impl ObjectRestore {
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    /// Id of the engine doing the work
    pub fn engine_id(&self) -> Uuid {
        self.engine.id()
    }

    pub fn restore_snapshot(&self) -> RestoreSnapshot {
        let snap = self.base.snapshot();
        let error_text = snap
            .abort_cause
            .clone()
            .or_else(|| snap.errors.last().cloned());
        RestoreSnapshot {
            id: snap.id,
            finished: snap.finished(),
            aborted: snap.aborted(),
            bytes_total: self.progress.total(),
            bytes_done: self.progress.done(),
            error_text,
        }
    }

    async fn run(
        self: Arc<Self>,
        req: Request,
        rx: tokio::sync::oneshot::Receiver<Result<()>>,
    ) {
        let abort = self.base.abort_token();
        let outcome = tokio::select! {
            _ = abort.cancelled() => None,
            result = self.submit_and_wait(req, rx) => Some(result),
        };

        match outcome {
            Some(Ok(())) => {
                self.base.add_bytes(self.progress.done());
                self.base.inc_objects();
                info!(task = %self.base.name(), object = %self.object.cname(), "Object restored");
            }
            Some(Err(e)) => {
                self.base.add_err(&e);
                self.base.abort(&e.to_string());
            }
            None => {
                debug!(task = %self.base.name(), "Stopped waiting for restore");
            }
        }
        self.base.finish();
    }

    async fn submit_and_wait(
        &self,
        req: Request,
        rx: tokio::sync::oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        self.engine.submit(req).await?;
        let resolved = match self.options.timeout {
            Some(duration) => tokio::time::timeout(duration, rx).await.map_err(|_| {
                Error::Timeout {
                    what: self.object.cname(),
                    duration,
                }
            })?,
            None => rx.await,
        };
        resolved.map_err(|_| Error::Internal(format!("{}: result channel closed", self.object.cname())))?
    }
}

impl Task for ObjectRestore {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn start(self: Arc<Self>) -> Result<()> {
        let req = self.request.lock().take();
        let rx = self.rx.lock().take();
        let (Some(req), Some(rx)) = (req, rx) else {
            return Err(Error::Internal(format!("{} already started", self.base.name())));
        };
        self.base.set_running();
        self.base.set_in_bytes(self.object.size);
        tokio::spawn(self.clone().run(req, rx));
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn snapshot(&self) -> TaskSnapshot {
        let mut snap = self.base.snapshot();
        snap.bytes = self.progress.done();
        snap.ext = serde_json::to_value(self.restore_snapshot()).ok();
        snap
    }
}

impl std::fmt::Debug for ObjectRestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRestore")
            .field("base", &self.base)
            .field("object", &self.object.cname())
            .finish()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Factory for [`ObjectRestore`]; every call is its own job
pub struct RestoreJobFactory {
    locator: Arc<dyn ObjectLocator>,
}

impl RestoreJobFactory {
    pub fn new(locator: Arc<dyn ObjectLocator>) -> Self {
        Self { locator }
    }
}

#[async_trait]
impl TaskFactory for RestoreJobFactory {
    fn kind(&self) -> TaskKind {
        TaskKind::OBJECT_RESTORE
    }

    #[instrument(skip_all, fields(bucket = ?bucket))]
    async fn create(
        &self,
        registry: &Arc<TaskRegistry>,
        bucket: Option<&BucketRef>,
        args: &RenewArgs,
    ) -> Result<Arc<dyn Task>> {
        let bucket = bucket.ok_or_else(|| {
            Error::Config(format!("{} requires a bucket", TaskKind::OBJECT_RESTORE))
        })?;
        let job = args.custom::<RestoreJobArgs>().ok_or_else(|| {
            Error::Config(format!("{} requires an object name", TaskKind::OBJECT_RESTORE))
        })?;
        let object = self.locator.locate(bucket, &job.object)?;

        let renewal = registry
            .renew(
                TaskKind::EC_GET,
                Some(bucket),
                RenewArgs::new().with_custom(job.options.clone()),
            )
            .await?;
        let engine_id = renewal.task.id();
        let engine = downcast::<RestoreEngine>(renewal.task).ok_or_else(|| Error::TaskMismatch {
            task: engine_id.to_string(),
            expected: TaskKind::EC_GET.to_string(),
        })?;

        let progress = Arc::new(Progress::new(object.size));
        let (req, rx) = Request::restore(object.clone())
            .with_progress(progress.clone())
            .with_result_channel();

        Ok(Arc::new(ObjectRestore {
            base: TaskBase::new(&args.uuid_or_new(), TaskKind::OBJECT_RESTORE, Some(bucket.clone())),
            object,
            options: job.options.clone(),
            engine,
            progress,
            request: Mutex::new(Some(req)),
            rx: Mutex::new(Some(rx)),
        }))
    }

    fn when_prev_is_running(&self, _prev: &dyn Task) -> AdmissionDecision {
        AdmissionDecision::KeepAndStartNew
    }
}
