//! Inline ETL task
//!
//! Marker task for an inline (per-request) transform. It has no run loop of
//! its own: it exists so that the transform shows up in the registry and can
//! be aborted cluster-wide. Every invocation carries its own transform spec,
//! so instances are never merged.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::factory::{AdmissionDecision, RenewArgs, TaskFactory};
use super::kind::{BucketRef, TaskKind};
use super::registry::TaskRegistry;
use super::task::{Task, TaskBase, TaskSnapshot};
use crate::error::{Error, Result};

/// Transform specification passed as the custom renew argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlSpec {
    /// Transform name
    pub name: String,

    /// How the transformer is reached (e.g. `hpush://`)
    pub comm_type: String,
}

impl std::fmt::Display for EtlSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "etl[{}, {}]", self.name, self.comm_type)
    }
}

/// Inline transform task
pub struct EtlInline {
    base: TaskBase,
    spec: EtlSpec,
}

impl EtlInline {
    pub fn spec(&self) -> &EtlSpec {
        &self.spec
    }
}

impl Task for EtlInline {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn start(self: Arc<Self>) -> Result<()> {
        self.base.set_running();
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn snapshot(&self) -> TaskSnapshot {
        let mut snap = self.base.snapshot();
        snap.idle = true;
        snap.ext = serde_json::to_value(&self.spec).ok();
        snap
    }

    /// Nothing to drain: abort finishes immediately.
    fn abort(&self, cause: &str) -> bool {
        let aborted = self.base.abort(cause);
        if aborted {
            self.base.finish();
        }
        aborted
    }
}

/// Factory for [`EtlInline`]
#[derive(Debug, Default)]
pub struct EtlFactory;

#[async_trait]
impl TaskFactory for EtlFactory {
    fn kind(&self) -> TaskKind {
        TaskKind::ETL_INLINE
    }

    async fn create(
        &self,
        _registry: &Arc<TaskRegistry>,
        bucket: Option<&BucketRef>,
        args: &RenewArgs,
    ) -> Result<Arc<dyn Task>> {
        let id = args.uuid.as_deref().unwrap_or_default();
        assert!(
            Uuid::parse_str(id).is_ok(),
            "{}: caller must assign a valid task id, got {:?}",
            TaskKind::ETL_INLINE,
            id
        );
        let spec = args.custom::<EtlSpec>().cloned().ok_or_else(|| {
            Error::Config(format!("{}: missing transform spec", TaskKind::ETL_INLINE))
        })?;

        Ok(Arc::new(EtlInline {
            base: TaskBase::new(id, TaskKind::ETL_INLINE, bucket.cloned()),
            spec,
        }))
    }

    fn when_prev_is_running(&self, _prev: &dyn Task) -> AdmissionDecision {
        AdmissionDecision::KeepAndStartNew
    }
}
