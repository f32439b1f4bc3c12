//! EC-GET Restore Engine
//!
//! Demand-based extended action that restores erasure-coded objects of one
//! bucket. It owns one [`Worker`] per local mount and a single coordinating
//! loop:
//!
//! ```text
//!                        ┌──────────────────────────┐
//!   submit(req) ───────► │  mount table (RwLock)    │──► Worker[m1] ──┐
//!                        │  MountId ─► Worker       │──► Worker[m2] ──┼─► PeerTransport
//!                        └──────────────────────────┘──► Worker[mN] ──┘
//!                                    ▲
//!   coordinating loop (select!):     │ attach / detach
//!     stats tick | mount event | idle timeout | control | abort
//!
//!   peer response ─► dispatch_resp ─► SliceResponseRouter ─► SliceWriter
//! ```
//!
//! Enqueueing waits while a worker's queue (capacity `burst_size`) is full.
//! A full queue stalls the submitting caller; no load is shed.
//!
//! Abort is local to this node. Fatal transfer errors (short reads) abort this
//! engine only; propagating an abort to other nodes is the control plane's
//! job.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::request::{MountId, Request};
use super::router::SliceResponseRouter;
use super::stats::{RestoreStats, RestoreStatsSnapshot};
use super::store::{LocalStore, MountState, Mounts};
use super::transport::{ObjHeader, PeerTransport};
use super::worker::Worker;
use super::writer::WriterRegistry;
use crate::error::{Error, Result};
use crate::metrics;
use crate::xact::{
    AdmissionDecision, BucketRef, DemandTracker, RenewArgs, Task, TaskBase, TaskFactory,
    TaskKind, TaskRegistry, TaskSnapshot,
};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a restore engine
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Capacity of each worker's queue
    pub burst_size: usize,

    /// Self-terminate after this long with nothing in flight
    pub idle_timeout: Duration,

    /// Period of the stats log line
    pub stats_interval: Duration,

    /// How long a worker waits for one object's slices
    pub slice_timeout: Duration,

    /// Read size when streaming a response into its writer
    pub chunk_size: usize,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            burst_size: 128,
            idle_timeout: Duration::from_secs(120),
            stats_interval: Duration::from_secs(10),
            slice_timeout: Duration::from_secs(5 * 60),
            chunk_size: 32 * 1024,
        }
    }
}

impl RestoreConfig {
    /// Fold per-call tuning into the configuration. Values are fixed once the
    /// engine exists.
    pub fn with_options(mut self, opts: &RestoreOptions) -> Self {
        if let Some(chunk_size) = opts.chunk_size {
            self.chunk_size = chunk_size.max(1);
        }
        if let Some(burst) = opts.burst {
            self.burst_size = burst.max(1);
        }
        self
    }
}

/// Per-call tuning of a restore
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    pub chunk_size: Option<usize>,

    /// Worker queue capacity
    pub burst: Option<usize>,

    /// Caller-side wait limit. Expiry fails the caller's job only.
    pub timeout: Option<Duration>,
}

/// Node collaborators shared by every engine on the node
#[derive(Clone)]
pub struct RestoreDeps {
    pub transport: Arc<dyn PeerTransport>,
    pub store: Arc<dyn LocalStore>,
    pub mounts: Arc<Mounts>,
}

impl std::fmt::Debug for RestoreDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreDeps")
            .field("mounts", &self.mounts)
            .finish()
    }
}

// =============================================================================
// Shared Core
// =============================================================================

/// State shared between the engine and its workers
pub(crate) struct EngineCore {
    pub(crate) base: TaskBase,
    pub(crate) config: RestoreConfig,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) writers: Arc<WriterRegistry>,
    pub(crate) stats: RestoreStats,
    pub(crate) demand: DemandTracker,
    stop_cause: Mutex<Option<String>>,
}

impl EngineCore {
    /// Error for a request the engine gave up on.
    pub(crate) fn stopped_error(&self, fallback: &str) -> Error {
        let cause = self.stop_cause.lock().clone();
        self.base
            .aborted_error(cause.as_deref().unwrap_or(fallback))
    }

    /// Deliver the terminal outcome of an accepted request.
    pub(crate) fn resolve(&self, req: Request, result: Result<()>) {
        let ok = result.is_ok();
        self.stats.record_object(req.enqueued_at.elapsed(), ok);
        match &result {
            Ok(()) => self.base.inc_objects(),
            Err(Error::Aborted { .. }) => {}
            Err(e) => self.base.add_err(e),
        }
        metrics::restore_resolved(ok, if ok { req.object.size } else { 0 });
        metrics::request_resolved();

        req.finish(result);
        if self.demand.dec() == 0 {
            self.base.set_idle(true);
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug)]
enum Control {
    EnableRequests,
    ClearRequests,
}

#[derive(Debug)]
enum MountEvent {
    Attach(MountId),
    Detach(MountId),
}

type Inboxes = (
    mpsc::UnboundedReceiver<Control>,
    mpsc::UnboundedReceiver<MountEvent>,
);

/// Extended stats block of an EC-GET snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EcGetStats {
    pub avg_decode_ms: f64,
    pub avg_object_ms: f64,
    pub avg_queue_len: f64,
    pub err_count: u64,
    pub is_idle: bool,
    pub requests_enabled: bool,
    pub mounts: usize,
    /// Requests routed to a mount the node had marked disabled
    pub disabled_dispatches: u64,
}

/// The EC-GET engine for one bucket
pub struct RestoreEngine {
    core: Arc<EngineCore>,
    router: SliceResponseRouter,

    /// Mutated only by `start` and the coordinating loop
    mounts: RwLock<HashMap<MountId, Arc<Worker>>>,
    initial_mounts: Vec<MountId>,
    node_mounts: Arc<Mounts>,
    disabled_dispatches: AtomicU64,

    enabled: AtomicBool,
    ctrl_tx: mpsc::UnboundedSender<Control>,
    mount_tx: mpsc::UnboundedSender<MountEvent>,
    inboxes: Mutex<Option<Inboxes>>,
}

impl RestoreEngine {
    /// Build an engine in `Init` state with workers to be created for every
    /// mount the node knows about, disabled ones included.
    pub fn new(
        id: &str,
        bucket: Option<BucketRef>,
        config: RestoreConfig,
        deps: &RestoreDeps,
    ) -> Self {
        let writers = Arc::new(WriterRegistry::new());
        let router = SliceResponseRouter::new(writers.clone(), config.chunk_size);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (mount_tx, mount_rx) = mpsc::unbounded_channel();

        let core = Arc::new(EngineCore {
            base: TaskBase::new(id, TaskKind::EC_GET, bucket),
            demand: DemandTracker::new(config.idle_timeout),
            config,
            transport: deps.transport.clone(),
            store: deps.store.clone(),
            writers,
            stats: RestoreStats::new(),
            stop_cause: Mutex::new(None),
        });

        Self {
            core,
            router,
            mounts: RwLock::new(HashMap::new()),
            initial_mounts: deps.mounts.all(),
            node_mounts: deps.mounts.clone(),
            disabled_dispatches: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
            ctrl_tx,
            mount_tx,
            inboxes: Mutex::new(Some((ctrl_rx, mount_rx))),
        }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.core.config
    }

    pub fn requests_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Mounts that currently have a worker
    pub fn mounts(&self) -> Vec<MountId> {
        let mut mounts: Vec<MountId> = self.mounts.read().keys().cloned().collect();
        mounts.sort();
        mounts
    }

    /// Requests accepted and not yet resolved
    pub fn pending(&self) -> u64 {
        self.core.demand.pending()
    }

    /// Writers waiting for a peer response
    pub fn pending_fetches(&self) -> usize {
        self.core.writers.len()
    }

    pub fn stats(&self) -> RestoreStatsSnapshot {
        self.core.stats.snapshot()
    }

    // =========================================================================
    // Request Dispatch
    // =========================================================================

    /// Route a request to the worker owning its mount.
    ///
    /// Rejections are delivered through the request's own result path and
    /// returned. An unknown mount aborts the engine: dispatch relies on the
    /// mount table being accurate.
    #[instrument(skip_all, fields(engine = %self.core.base.name(), object = %req.object.cname()))]
    pub async fn submit(&self, req: Request) -> Result<()> {
        let base = &self.core.base;
        if base.is_aborted() {
            return reject(req, || base.aborted_error("aborted"));
        }
        if !self.requests_enabled() || base.is_finished() {
            return reject(req, || Error::EcRequestsDisabled);
        }

        let mount = req.object.mount.clone();
        let worker = self.mounts.read().get(&mount).cloned();
        let Some(worker) = worker else {
            if !self.requests_enabled() {
                return reject(req, || Error::EcRequestsDisabled);
            }
            let unknown = || Error::UnknownMount {
                task: base.name(),
                mount: mount.to_string(),
            };
            error!(mount = %mount, "Request for unknown mountpath");
            base.add_err(&unknown());
            base.abort(&unknown().to_string());
            return reject(req, unknown);
        };

        if self.node_mounts.state(&mount) == Some(MountState::Disabled) {
            self.disabled_dispatches.fetch_add(1, Ordering::Relaxed);
            warn!(mount = %mount, "Dispatch to disabled mountpath");
        }
        self.core.stats.sample_queue_len(worker.queue_len());

        // Waits while the queue is full. The request counts as in flight only
        // once a slot is reserved, so dropping this future leaks nothing.
        let sender = worker.sender();
        let Ok(permit) = sender.reserve().await else {
            let fallback = format!("mountpath {} stopped", mount);
            return reject(req, || self.core.stopped_error(&fallback));
        };
        self.core.demand.inc();
        base.set_idle(false);
        metrics::request_accepted();
        permit.send(req);
        Ok(())
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Resume accepting requests. No-op when already enabled.
    pub fn enable_requests(&self) {
        self.send_control(Control::EnableRequests);
    }

    /// Stop accepting requests, fail everything pending, terminate.
    pub fn clear_requests(&self) {
        self.enabled.store(false, Ordering::Release);
        self.send_control(Control::ClearRequests);
    }

    pub fn attach_mount(&self, mount: MountId) {
        self.send_mount_event(MountEvent::Attach(mount));
    }

    pub fn detach_mount(&self, mount: MountId) {
        self.send_mount_event(MountEvent::Detach(mount));
    }

    fn send_control(&self, msg: Control) {
        if self.core.base.is_finished() || self.ctrl_tx.send(msg).is_err() {
            debug!(engine = %self.core.base.name(), "Engine finished, control message ignored");
        }
    }

    fn send_mount_event(&self, ev: MountEvent) {
        if self.core.base.is_finished() || self.mount_tx.send(ev).is_err() {
            debug!(engine = %self.core.base.name(), "Engine finished, mount event ignored");
        }
    }

    // =========================================================================
    // Responses
    // =========================================================================

    /// Hand an inbound peer response to the waiting writer.
    ///
    /// Every failure is recorded on the engine; a truncated transfer also
    /// aborts it.
    pub async fn dispatch_resp<R>(&self, hdr: &ObjHeader, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        match self.router.deliver(hdr, reader).await {
            Ok(n) => Ok(n),
            Err(e) => {
                self.core.base.add_err(&e);
                if e.is_fatal_transfer() {
                    error!(engine = %self.core.base.name(), error = %e, "Fatal transfer error");
                    self.core.base.abort(&e.to_string());
                } else {
                    warn!(engine = %self.core.base.name(), error = %e, "Failed to dispatch response");
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Coordinating Loop
    // =========================================================================

    async fn run(self: Arc<Self>, inboxes: Inboxes) {
        let (mut ctrl_rx, mut mount_rx) = inboxes;
        let abort = self.core.base.abort_token();
        let period = self.core.config.stats_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = abort.cancelled() => {
                    self.terminate(true, "aborted").await;
                    break;
                }
                _ = ticker.tick() => {
                    info!(engine = %self.core.base.name(), pending = self.pending(), "{}", self.stats());
                }
                Some(ev) = mount_rx.recv() => match ev {
                    MountEvent::Attach(mount) => self.add_mount(mount),
                    MountEvent::Detach(mount) => {
                        if let Err(e) = self.remove_mount(&mount) {
                            error!(engine = %self.core.base.name(), error = %e, "Detach failed");
                            self.core.base.add_err(&e);
                            self.core.base.abort(&e.to_string());
                        }
                    }
                },
                _ = self.core.demand.idle_expired() => {
                    info!(engine = %self.core.base.name(), idle = ?self.core.demand.idle_timeout(), "Idle, stopping");
                    self.terminate(false, "idle").await;
                    break;
                }
                Some(ctrl) = ctrl_rx.recv() => match ctrl {
                    Control::EnableRequests => {
                        if !self.enabled.swap(true, Ordering::AcqRel) {
                            info!(engine = %self.core.base.name(), "Requests enabled");
                        }
                    }
                    Control::ClearRequests => {
                        self.terminate(true, "requests cleared").await;
                        break;
                    }
                },
            }
        }

        self.core.base.finish();
    }

    fn add_mount(&self, mount: MountId) {
        let mut mounts = self.mounts.write();
        if mounts.contains_key(&mount) {
            warn!(engine = %self.core.base.name(), mount = %mount, "Mountpath already has a worker");
            return;
        }
        info!(engine = %self.core.base.name(), mount = %mount, "Attached mountpath");
        mounts.insert(mount.clone(), Worker::spawn(mount, self.core.clone()));
    }

    /// Stop the mount's worker gracefully. Its current item completes; what
    /// is still queued fails once the worker exits.
    fn remove_mount(&self, mount: &MountId) -> Result<()> {
        let worker = self
            .mounts
            .write()
            .remove(mount)
            .ok_or_else(|| Error::UnknownMount {
                task: self.core.base.name(),
                mount: mount.to_string(),
            })?;
        info!(engine = %self.core.base.name(), mount = %mount, "Detaching mountpath");
        worker.signal_stop(false);

        let core = self.core.clone();
        let cause = format!("mountpath {} detached", mount);
        tokio::spawn(async move {
            for req in worker.join().await {
                let err = core.base.aborted_error(&cause);
                core.resolve(req, Err(err));
            }
        });
        Ok(())
    }

    /// Stop every worker and fail everything they did not finish.
    async fn terminate(&self, abandon: bool, cause: &str) {
        self.enabled.store(false, Ordering::Release);
        self.core.stop_cause.lock().get_or_insert_with(|| cause.to_string());

        let workers: Vec<Arc<Worker>> = self.mounts.write().drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.signal_stop(abandon);
        }
        let mut failed = 0usize;
        for worker in workers {
            for req in worker.join().await {
                let err = self.core.stopped_error(cause);
                self.core.resolve(req, Err(err));
                failed += 1;
            }
        }
        info!(
            engine = %self.core.base.name(),
            cause = %cause,
            failed,
            stats = %self.stats(),
            "Engine stopped"
        );
    }
}

/// Report a rejection through the request and to the caller.
fn reject(req: Request, make: impl Fn() -> Error) -> Result<()> {
    req.finish(Err(make()));
    Err(make())
}

impl Task for RestoreEngine {
    fn base(&self) -> &TaskBase {
        &self.core.base
    }

    fn start(self: Arc<Self>) -> Result<()> {
        let inboxes = self
            .inboxes
            .lock()
            .take()
            .ok_or_else(|| Error::Internal(format!("{} already started", self.core.base.name())))?;
        {
            let mut mounts = self.mounts.write();
            for mount in &self.initial_mounts {
                mounts.insert(mount.clone(), Worker::spawn(mount.clone(), self.core.clone()));
            }
        }
        self.core.base.set_running();
        info!(
            engine = %self.core.base.name(),
            mounts = self.initial_mounts.len(),
            burst = self.core.config.burst_size,
            "Restore engine started"
        );
        tokio::spawn(self.clone().run(inboxes));
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn snapshot(&self) -> TaskSnapshot {
        let mut snap = self.core.base.snapshot();
        let stats = self.stats();
        let pending = self.pending();

        snap.idle = pending == 0;
        snap.bytes = stats.bytes;
        if !snap.finished() {
            snap.idle_deadline = self.core.demand.idle_deadline().map(|deadline| {
                let left = deadline.saturating_duration_since(Instant::now());
                Utc::now() + chrono::Duration::from_std(left).unwrap_or_else(|_| chrono::Duration::zero())
            });
        }
        let ext = EcGetStats {
            avg_decode_ms: stats.avg_decode.as_secs_f64() * 1e3,
            avg_object_ms: stats.avg_object.as_secs_f64() * 1e3,
            avg_queue_len: stats.avg_queue_len,
            err_count: self.core.base.err_count(),
            is_idle: pending == 0,
            requests_enabled: self.requests_enabled(),
            mounts: self.mounts.read().len(),
            disabled_dispatches: self.disabled_dispatches.load(Ordering::Relaxed),
        };
        snap.ext = serde_json::to_value(ext).ok();
        snap
    }
}

impl std::fmt::Debug for RestoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreEngine")
            .field("base", &self.core.base)
            .field("mounts", &self.mounts())
            .field("enabled", &self.requests_enabled())
            .finish()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Factory for [`RestoreEngine`]; one engine per bucket, shared by callers
#[derive(Debug)]
pub struct EcGetFactory {
    config: RestoreConfig,
    deps: RestoreDeps,
}

impl EcGetFactory {
    pub fn new(config: RestoreConfig, deps: RestoreDeps) -> Self {
        Self { config, deps }
    }
}

#[async_trait]
impl TaskFactory for EcGetFactory {
    fn kind(&self) -> TaskKind {
        TaskKind::EC_GET
    }

    async fn create(
        &self,
        _registry: &Arc<TaskRegistry>,
        bucket: Option<&BucketRef>,
        args: &RenewArgs,
    ) -> Result<Arc<dyn Task>> {
        let bucket = bucket
            .cloned()
            .ok_or_else(|| Error::Config(format!("{} requires a bucket", TaskKind::EC_GET)))?;
        let config = match args.custom::<RestoreOptions>() {
            Some(opts) => self.config.clone().with_options(opts),
            None => self.config.clone(),
        };
        Ok(Arc::new(RestoreEngine::new(
            &args.uuid_or_new(),
            Some(bucket),
            config,
            &self.deps,
        )))
    }

    fn when_prev_is_running(&self, _prev: &dyn Task) -> AdmissionDecision {
        AdmissionDecision::UsePrevious
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::request::{NodeId, ObjectRef};
    use crate::ec::store::InMemoryStore;
    use crate::ec::transport::{ChannelTransport, SliceFetch};
    use crate::xact::{downcast, RegistryConfig, TaskState};
    use assert_matches::assert_matches;

    struct Fixture {
        registry: Arc<TaskRegistry>,
        store: Arc<InMemoryStore>,
        mounts: Arc<Mounts>,
        fetches: mpsc::UnboundedReceiver<SliceFetch>,
    }

    fn fixture(config: RestoreConfig, mounts: &[&str]) -> Fixture {
        let (transport, fetches) = ChannelTransport::new();
        let store = Arc::new(InMemoryStore::new());
        let mounts = Arc::new(Mounts::with_mounts(mounts.iter().copied()));
        let deps = RestoreDeps {
            transport: Arc::new(transport),
            store: store.clone(),
            mounts: mounts.clone(),
        };
        let registry = TaskRegistry::new(RegistryConfig::default());
        registry.register(Arc::new(EcGetFactory::new(config, deps)));
        Fixture {
            registry,
            store,
            mounts,
            fetches,
        }
    }

    async fn engine(fx: &Fixture) -> Arc<RestoreEngine> {
        let renewal = fx
            .registry
            .renew(TaskKind::EC_GET, Some(&BucketRef::new("b")), RenewArgs::new())
            .await
            .unwrap();
        downcast::<RestoreEngine>(renewal.task).unwrap()
    }

    fn object(name: &str, mount: &str, size: u64) -> ObjectRef {
        ObjectRef {
            bucket: BucketRef::new("b"),
            name: name.to_string(),
            mount: MountId::from(mount),
            size,
            source: NodeId::from("t2"),
        }
    }

    #[tokio::test]
    async fn test_engine_running_on_return() {
        let fx = fixture(RestoreConfig::default(), &["m1", "m2"]);
        let engine = engine(&fx).await;

        assert_eq!(engine.base().state(), TaskState::Running);
        assert_eq!(engine.mounts(), vec![MountId::from("m1"), MountId::from("m2")]);
        assert!(engine.requests_enabled());
    }

    #[tokio::test]
    async fn test_one_engine_per_bucket() {
        let fx = fixture(RestoreConfig::default(), &["m1"]);
        let a = engine(&fx).await;
        let b = engine(&fx).await;
        assert_eq!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_restore_success() {
        let mut fx = fixture(RestoreConfig::default(), &["m1"]);
        let engine = engine(&fx).await;

        let (req, rx) = Request::restore(object("o1", "m1", 10)).with_result_channel();
        engine.submit(req).await.unwrap();

        let fetch = fx.fetches.recv().await.unwrap();
        let hdr = ObjHeader::slice_data(&fetch.uname(), 10);
        let mut body: &[u8] = b"0123456789";
        assert_eq!(engine.dispatch_resp(&hdr, &mut body).await.unwrap(), 10);

        rx.await.unwrap().unwrap();
        assert_eq!(engine.stats().decoded, 1);
        assert_eq!(
            fx.store.get(&BucketRef::new("b"), "o1").unwrap().as_ref(),
            b"0123456789"
        );
        assert_eq!(engine.pending_fetches(), 0);
    }

    #[tokio::test]
    async fn test_disabled_mount_still_serves() {
        let mut fx = fixture(RestoreConfig::default(), &["m1"]);
        let engine = engine(&fx).await;
        fx.mounts.disable(&MountId::from("m1")).unwrap();

        let (req, rx) = Request::restore(object("o1", "m1", 2)).with_result_channel();
        engine.submit(req).await.unwrap();
        let fetch = fx.fetches.recv().await.unwrap();
        let hdr = ObjHeader::slice_data(&fetch.uname(), 2);
        let mut body: &[u8] = b"ok";
        engine.dispatch_resp(&hdr, &mut body).await.unwrap();
        rx.await.unwrap().unwrap();

        let ext = engine.snapshot().ext.unwrap();
        assert_eq!(ext["disabled_dispatches"], 1);
        assert_eq!(ext["mounts"], 1);
    }

    #[tokio::test]
    async fn test_unknown_mount_aborts_engine() {
        let fx = fixture(RestoreConfig::default(), &["m1"]);
        let engine = engine(&fx).await;

        let (req, rx) = Request::restore(object("o2", "m9", 10)).with_result_channel();
        assert_matches!(
            engine.submit(req).await,
            Err(Error::UnknownMount { mount, .. }) if mount == "m9"
        );
        assert_matches!(rx.await.unwrap(), Err(Error::UnknownMount { .. }));

        engine.base().wait_finished().await;
        assert!(engine.snapshot().aborted());
    }

    #[tokio::test]
    async fn test_duplicate_attach_is_noop() {
        let fx = fixture(RestoreConfig::default(), &["m1"]);
        let engine = engine(&fx).await;

        engine.attach_mount(MountId::from("m1"));
        engine.attach_mount(MountId::from("m2"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(engine.mounts(), vec![MountId::from("m1"), MountId::from("m2")]);
        assert_eq!(engine.base().state(), TaskState::Running);
    }

    #[tokio::test]
    async fn test_detach_unknown_mount_aborts() {
        let fx = fixture(RestoreConfig::default(), &["m1"]);
        let engine = engine(&fx).await;

        engine.detach_mount(MountId::from("m7"));
        engine.base().wait_finished().await;
        let snap = engine.snapshot();
        assert!(snap.abort_cause.unwrap().contains("m7"));
    }

    #[tokio::test]
    async fn test_disabled_requests_reported_through_request() {
        let fx = fixture(RestoreConfig::default(), &["m1"]);
        let engine = engine(&fx).await;
        engine.clear_requests();

        let (req, rx) = Request::restore(object("o1", "m1", 10)).with_result_channel();
        assert_matches!(engine.submit(req).await, Err(Error::EcRequestsDisabled));
        assert_matches!(rx.await.unwrap(), Err(Error::EcRequestsDisabled));

        engine.base().wait_finished().await;
        assert!(!engine.snapshot().aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_engine_finishes() {
        let config = RestoreConfig {
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let fx = fixture(config, &["m1"]);
        let engine = engine(&fx).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!engine.base().is_finished());

        tokio::time::timeout(Duration::from_secs(3), engine.base().wait_finished())
            .await
            .unwrap();
        assert!(!engine.snapshot().aborted());
    }

    #[tokio::test]
    async fn test_snapshot_ext() {
        let fx = fixture(RestoreConfig::default(), &["m1"]);
        let engine = engine(&fx).await;

        let snap = engine.snapshot();
        assert!(snap.idle);
        assert!(snap.idle_deadline.is_some());
        let ext = snap.ext.unwrap();
        assert_eq!(ext["is_idle"], true);
        assert_eq!(ext["mounts"], 1);
    }

    #[test]
    fn test_with_options() {
        let config = RestoreConfig::default().with_options(&RestoreOptions {
            chunk_size: Some(4),
            burst: Some(0),
            timeout: None,
        });
        assert_eq!(config.chunk_size, 4);
        assert_eq!(config.burst_size, 1);
    }
}
