//! Task abstraction
//!
//! Every extended action implements [`Task`] and embeds a [`TaskBase`] that
//! owns its identity, lifecycle state, abort signal and generic counters.
//!
//! # Lifecycle
//!
//! ```text
//! Init ──► Running ◄──► Idle
//!             │           │
//!             ▼           ▼
//!          Aborting ──► Finished
//! ```
//!
//! `Finished` is terminal; `abort` after it is a no-op.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::kind::{BucketRef, TaskKind};
use crate::error::{Error, Result};
use crate::metrics;

/// Number of most recent error messages kept per task.
const MAX_KEPT_ERRORS: usize = 16;

// =============================================================================
// Task State
// =============================================================================

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Init,
    Running,
    Idle,
    Aborting,
    Finished,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Init => write!(f, "Init"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Idle => write!(f, "Idle"),
            TaskState::Aborting => write!(f, "Aborting"),
            TaskState::Finished => write!(f, "Finished"),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable point-in-time view of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub kind: TaskKind,
    pub bucket: Option<BucketRef>,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// When a demand-based task will self-terminate if nothing arrives
    pub idle_deadline: Option<DateTime<Utc>>,
    pub abort_cause: Option<String>,
    pub err_count: u64,
    pub errors: Vec<String>,
    /// Objects processed
    pub objects: u64,
    /// Bytes processed so far
    pub bytes: u64,
    /// Bytes expected in total (0 when unknown)
    pub in_bytes: u64,
    pub idle: bool,
    /// Kind-specific extension
    pub ext: Option<serde_json::Value>,
}

impl TaskSnapshot {
    pub fn finished(&self) -> bool {
        self.state == TaskState::Finished
    }

    pub fn aborted(&self) -> bool {
        self.abort_cause.is_some()
    }
}

// =============================================================================
// Task Trait
// =============================================================================

/// A long-running, registry-managed cluster operation.
pub trait Task: Send + Sync + 'static {
    /// Shared lifecycle state
    fn base(&self) -> &TaskBase;

    /// Transition from `Init` to `Running`; called by the registry before the
    /// handle is returned to anyone.
    fn start(self: Arc<Self>) -> Result<()>;

    /// Upcast used by [`downcast`].
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn id(&self) -> Uuid {
        self.base().id()
    }

    fn kind(&self) -> TaskKind {
        self.base().kind()
    }

    fn bucket(&self) -> Option<&BucketRef> {
        self.base().bucket()
    }

    fn snapshot(&self) -> TaskSnapshot {
        self.base().snapshot()
    }

    /// Request abort. Returns false when the task already finished or was
    /// already aborting.
    fn abort(&self, cause: &str) -> bool {
        self.base().abort(cause)
    }
}

/// Recover the concrete type of a registry handle.
pub fn downcast<T: Task>(task: Arc<dyn Task>) -> Option<Arc<T>> {
    task.as_any().downcast::<T>().ok()
}

// =============================================================================
// Task Base
// =============================================================================

/// Identity, lifecycle and counters shared by all task kinds
pub struct TaskBase {
    id: Uuid,
    kind: TaskKind,
    bucket: Option<BucketRef>,
    state: RwLock<TaskState>,
    started_at: DateTime<Utc>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
    abort: CancellationToken,
    abort_cause: Mutex<Option<String>>,
    finished: watch::Sender<bool>,
    errors: Mutex<Vec<String>>,
    err_count: AtomicU64,
    objects: AtomicU64,
    bytes: AtomicU64,
    in_bytes: AtomicU64,
}

impl TaskBase {
    /// Create the base for a task with the given id.
    ///
    /// # Panics
    ///
    /// If `id` is not a valid UUID. Task ids are generated by this process or
    /// validated by the control plane, so a malformed one is a bug.
    pub fn new(id: &str, kind: TaskKind, bucket: Option<BucketRef>) -> Self {
        let id = match Uuid::parse_str(id) {
            Ok(id) => id,
            Err(e) => panic!("{kind}: invalid task id {id:?}: {e}"),
        };
        let (finished, _) = watch::channel(false);
        Self {
            id,
            kind,
            bucket,
            state: RwLock::new(TaskState::Init),
            started_at: Utc::now(),
            ended_at: RwLock::new(None),
            abort: CancellationToken::new(),
            abort_cause: Mutex::new(None),
            finished,
            errors: Mutex::new(Vec::new()),
            err_count: AtomicU64::new(0),
            objects: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            in_bytes: AtomicU64::new(0),
        }
    }

    /// Create a base with a freshly generated id.
    pub fn generate(kind: TaskKind, bucket: Option<BucketRef>) -> Self {
        Self::new(&Uuid::new_v4().to_string(), kind, bucket)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn bucket(&self) -> Option<&BucketRef> {
        self.bucket.as_ref()
    }

    /// Human-readable name, e.g. `ec-get[6f1c...]`
    pub fn name(&self) -> String {
        format!("{}[{}]", self.kind, self.id)
    }

    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    pub fn set_running(&self) {
        let mut state = self.state.write();
        if *state == TaskState::Init {
            *state = TaskState::Running;
            drop(state);
            metrics::task_started(self.kind);
            debug!(task = %self.name(), "Task running");
        }
    }

    /// Toggle between `Running` and `Idle`; ignored in any other state.
    pub fn set_idle(&self, idle: bool) {
        let mut state = self.state.write();
        match (*state, idle) {
            (TaskState::Running, true) => *state = TaskState::Idle,
            (TaskState::Idle, false) => *state = TaskState::Running,
            _ => {}
        }
    }

    /// Signal abort. The first cause wins.
    pub fn abort(&self, cause: &str) -> bool {
        {
            let mut state = self.state.write();
            match *state {
                TaskState::Finished | TaskState::Aborting => return false,
                _ => *state = TaskState::Aborting,
            }
        }
        *self.abort_cause.lock() = Some(cause.to_string());
        self.abort.cancel();
        warn!(task = %self.name(), cause = %cause, "Task aborting");
        true
    }

    /// Mark the task finished. Idempotent; returns true on the first call.
    pub fn finish(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state == TaskState::Finished {
                return false;
            }
            *state = TaskState::Finished;
        }
        *self.ended_at.write() = Some(Utc::now());
        let cause = self.abort_cause();
        metrics::task_finished(self.kind, cause.is_some());
        self.finished.send_replace(true);
        match cause {
            Some(cause) => info!(task = %self.name(), cause = %cause, "Task finished (aborted)"),
            None => info!(task = %self.name(), "Task finished"),
        }
        true
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn abort_cause(&self) -> Option<String> {
        self.abort_cause.lock().clone()
    }

    /// Token cancelled on abort
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// The error a pending request receives when this task goes away.
    pub fn aborted_error(&self, fallback: &str) -> Error {
        Error::Aborted {
            task: self.name(),
            cause: self.abort_cause().unwrap_or_else(|| fallback.to_string()),
        }
    }

    /// Resolve once the task is `Finished`.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|finished| *finished).await;
    }

    // =========================================================================
    // Counters
    // =========================================================================

    pub fn add_err(&self, err: &Error) {
        self.err_count.fetch_add(1, Ordering::Relaxed);
        let mut errors = self.errors.lock();
        if errors.len() == MAX_KEPT_ERRORS {
            errors.remove(0);
        }
        errors.push(err.to_string());
    }

    pub fn err_count(&self) -> u64 {
        self.err_count.load(Ordering::Relaxed)
    }

    pub fn inc_objects(&self) {
        self.objects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_in_bytes(&self, n: u64) {
        self.in_bytes.store(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state();
        TaskSnapshot {
            id: self.id,
            kind: self.kind,
            bucket: self.bucket.clone(),
            state,
            started_at: self.started_at,
            ended_at: *self.ended_at.read(),
            idle_deadline: None,
            abort_cause: self.abort_cause(),
            err_count: self.err_count(),
            errors: self.errors.lock().clone(),
            objects: self.objects.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            idle: state == TaskState::Idle,
            ext: None,
        }
    }
}

impl std::fmt::Debug for TaskBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBase")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("bucket", &self.bucket)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
