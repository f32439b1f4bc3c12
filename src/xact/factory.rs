//! Task factories and admission policy
//!
//! One [`TaskFactory`] exists per [`TaskKind`]. The registry asks it to build
//! new instances and, when an instance for the same key is still alive, which
//! [`AdmissionDecision`] applies.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use super::kind::{BucketRef, TaskKind};
use super::registry::TaskRegistry;
use super::task::Task;
use crate::error::Result;

// =============================================================================
// Admission Decision
// =============================================================================

/// What to do when a task for the same (kind, bucket) is still alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdmissionDecision {
    /// Start a new instance next to the running one.
    ///
    /// For kinds whose invocations carry per-call parameters that must not be
    /// merged, e.g. inline transforms or single-object restores.
    KeepAndStartNew,

    /// Hand back the running instance; no new work is started.
    ///
    /// For self-contained passes where a second instance changes nothing,
    /// e.g. the per-bucket EC restore engine.
    UsePrevious,

    /// Abort the running instance, wait for it to finish, then start anew.
    AbortAndReplace,
}

impl std::fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionDecision::KeepAndStartNew => write!(f, "keep-and-start-new"),
            AdmissionDecision::UsePrevious => write!(f, "use-previous"),
            AdmissionDecision::AbortAndReplace => write!(f, "abort-and-replace"),
        }
    }
}

// =============================================================================
// Renew Arguments
// =============================================================================

/// Arguments of a renew call
#[derive(Clone, Default)]
pub struct RenewArgs {
    /// Caller-assigned task id; generated when absent
    pub uuid: Option<String>,

    /// Kind-specific payload
    pub custom: Option<Arc<dyn Any + Send + Sync>>,
}

impl RenewArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_custom<T: Any + Send + Sync>(mut self, custom: T) -> Self {
        self.custom = Some(Arc::new(custom));
        self
    }

    /// Kind-specific payload, if present and of type `T`
    pub fn custom<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.custom.as_deref()?.downcast_ref::<T>()
    }

    /// The caller's id, or a fresh one
    pub fn uuid_or_new(&self) -> String {
        self.uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

impl std::fmt::Debug for RenewArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewArgs")
            .field("uuid", &self.uuid)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

// =============================================================================
// Factory Trait
// =============================================================================

/// Constructor and admission policy for one task kind.
#[async_trait]
pub trait TaskFactory: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Build a new instance in `Init` state. The registry starts it.
    ///
    /// The registry is passed in so that composite tasks can renew the tasks
    /// they drive.
    async fn create(
        &self,
        registry: &Arc<TaskRegistry>,
        bucket: Option<&BucketRef>,
        args: &RenewArgs,
    ) -> Result<Arc<dyn Task>>;

    /// Policy when `prev` (same kind and bucket) is still alive.
    ///
    /// Must depend only on the kind and on `prev` being alive.
    fn when_prev_is_running(&self, prev: &dyn Task) -> AdmissionDecision;
}
