//! Task Registry
//!
//! Node-wide table of extended actions keyed by (kind, bucket). Owned by the
//! node (constructed at startup, torn down at shutdown) and passed to
//! factories by reference.
//!
//! # Admission
//!
//! ```text
//! renew(kind, bucket, args)
//!   ├─► lock admission gate for (kind, bucket)
//!   ├─► no live task              ─► create + start
//!   ├─► live task is aborting     ─► wait Finished, create + start
//!   └─► live task, ask factory:
//!         ├─ UsePrevious          ─► return it
//!         ├─ KeepAndStartNew      ─► create + start alongside
//!         └─ AbortAndReplace      ─► abort, wait Finished, create + start
//! ```
//!
//! The gate is held while waiting for a replaced task to finish, so no other
//! admission on that key can slip in between.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::factory::{AdmissionDecision, RenewArgs, TaskFactory};
use super::kind::{BucketRef, RegistryKey, TaskKind};
use super::task::{Task, TaskSnapshot};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the task registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long finished tasks stay queryable by id
    pub finished_retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            finished_retention: Duration::from_secs(10 * 60),
        }
    }
}

// =============================================================================
// Renewal
// =============================================================================

/// Outcome of [`TaskRegistry::renew`]
#[derive(Clone)]
pub struct Renewal {
    /// The task the caller should use
    pub task: Arc<dyn Task>,

    /// Policy applied against a live previous instance; `None` when there was
    /// none
    pub decision: Option<AdmissionDecision>,
}

impl Renewal {
    /// True when `task` was created by this call
    pub fn is_new(&self) -> bool {
        self.decision != Some(AdmissionDecision::UsePrevious)
    }
}

impl std::fmt::Debug for Renewal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renewal")
            .field("task", &self.task.base().name())
            .field("decision", &self.decision)
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of live and recently finished tasks
pub struct TaskRegistry {
    config: RegistryConfig,

    /// Kind → constructor table
    factories: RwLock<HashMap<TaskKind, Arc<dyn TaskFactory>>>,

    /// Live tasks per key (more than one only under KeepAndStartNew)
    entries: Mutex<HashMap<RegistryKey, Vec<Arc<dyn Task>>>>,

    /// All tasks by id, including finished ones until evicted
    by_id: DashMap<Uuid, Arc<dyn Task>>,

    /// Per-key admission gates
    gates: DashMap<RegistryKey, Arc<tokio::sync::Mutex<()>>>,
}

impl TaskRegistry {
    /// Create a new, empty registry
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            factories: RwLock::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            by_id: DashMap::new(),
            gates: DashMap::new(),
        })
    }

    /// Register the factory for its kind, replacing any previous one
    pub fn register(&self, factory: Arc<dyn TaskFactory>) {
        let kind = factory.kind();
        if self.factories.write().insert(kind, factory).is_some() {
            warn!(kind = %kind, "Replaced task factory");
        } else {
            debug!(kind = %kind, "Registered task factory");
        }
    }

    /// Return a running task for (kind, bucket), creating or replacing one
    /// according to the kind's admission policy.
    #[instrument(skip_all, fields(kind = %kind, bucket = ?bucket))]
    pub async fn renew(
        self: &Arc<Self>,
        kind: TaskKind,
        bucket: Option<&BucketRef>,
        args: RenewArgs,
    ) -> Result<Renewal> {
        let factory = self
            .factories
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnknownTaskKind(kind.to_string()))?;

        let key = RegistryKey::new(kind, bucket.cloned());
        let gate = self.gates.entry(key.clone()).or_default().clone();
        let _admission = gate.lock().await;

        let decision = match self.latest_live(&key) {
            None => None,
            Some(prev) if prev.base().is_aborted() => {
                debug!(prev = %prev.base().name(), "Previous instance aborting, waiting");
                prev.base().wait_finished().await;
                None
            }
            Some(prev) => {
                let decision = factory.when_prev_is_running(prev.as_ref());
                debug!(prev = %prev.base().name(), decision = %decision, "Previous instance alive");
                match decision {
                    AdmissionDecision::UsePrevious => {
                        return Ok(Renewal {
                            task: prev,
                            decision: Some(decision),
                        });
                    }
                    AdmissionDecision::KeepAndStartNew => {}
                    AdmissionDecision::AbortAndReplace => {
                        prev.abort(&format!("replaced by a new {}", kind));
                        prev.base().wait_finished().await;
                    }
                }
                Some(decision)
            }
        };

        let task = factory.create(self, bucket, &args).await?;
        debug_assert_eq!(task.kind(), kind);
        task.clone().start()?;
        self.insert(key, task.clone());

        info!(task = %task.base().name(), "Started task");
        Ok(Renewal { task, decision })
    }

    fn insert(&self, key: RegistryKey, task: Arc<dyn Task>) {
        self.by_id.insert(task.id(), task.clone());
        let mut entries = self.entries.lock();
        let list = entries.entry(key).or_default();
        list.retain(|t| !t.base().is_finished());
        list.push(task);
    }

    /// Most recently started unfinished task for `key`; prunes finished ones.
    fn latest_live(&self, key: &RegistryKey) -> Option<Arc<dyn Task>> {
        let mut entries = self.entries.lock();
        let list = entries.get_mut(key)?;
        list.retain(|t| !t.base().is_finished());
        let latest = list.last().cloned();
        if list.is_empty() {
            entries.remove(key);
        }
        latest
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Live task for (kind, bucket), if any
    pub fn find(&self, kind: TaskKind, bucket: Option<&BucketRef>) -> Option<Arc<dyn Task>> {
        self.latest_live(&RegistryKey::new(kind, bucket.cloned()))
    }

    /// Task by id (finished tasks stay until evicted)
    pub fn get(&self, id: Uuid) -> Result<Arc<dyn Task>> {
        self.by_id
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn snapshot(&self, id: Uuid) -> Result<TaskSnapshot> {
        Ok(self.get(id)?.snapshot())
    }

    /// All unfinished tasks of a kind
    pub fn running(&self, kind: TaskKind) -> Vec<Arc<dyn Task>> {
        self.entries
            .lock()
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .flat_map(|(_, list)| list.iter())
            .filter(|t| !t.base().is_finished())
            .cloned()
            .collect()
    }

    /// Number of unfinished tasks
    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .flat_map(|list| list.iter())
            .filter(|t| !t.base().is_finished())
            .count()
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Abort one task. Returns false if it had already finished or was
    /// already aborting.
    pub fn stop(&self, id: Uuid, cause: &str) -> Result<bool> {
        let task = self.get(id)?;
        Ok(task.abort(cause))
    }

    /// Abort every live task, e.g. at node shutdown. Returns how many were
    /// signalled.
    pub fn abort_all(&self, cause: &str) -> usize {
        let live: Vec<Arc<dyn Task>> = self
            .entries
            .lock()
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect();
        let n = live.into_iter().filter(|t| t.abort(cause)).count();
        info!(count = n, cause = %cause, "Aborted all tasks");
        n
    }

    /// Drop finished tasks older than the retention window. Returns how many
    /// were evicted.
    pub fn evict_finished(&self) -> usize {
        let retention = self.config.finished_retention;
        let now = Utc::now();
        let before = self.by_id.len();
        self.by_id.retain(|_, task| {
            let snap = task.snapshot();
            match snap.ended_at {
                Some(ended) if snap.finished() => (now - ended)
                    .to_std()
                    .map(|age| age < retention)
                    .unwrap_or(true),
                _ => true,
            }
        });
        let evicted = before.saturating_sub(self.by_id.len());

        self.entries.lock().retain(|_, list| {
            list.retain(|t| !t.base().is_finished());
            !list.is_empty()
        });
        self.gates.retain(|_, gate| Arc::strong_count(gate) > 1);

        if evicted > 0 {
            debug!(evicted, "Evicted finished tasks");
        }
        evicted
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("config", &self.config)
            .field("kinds", &self.factories.read().keys().collect::<Vec<_>>())
            .field("tasks", &self.by_id.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xact::task::TaskBase;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::any::Any;

    /// Task that finishes as soon as it is aborted
    struct Scrub {
        base: TaskBase,
    }

    impl Task for Scrub {
        fn base(&self) -> &TaskBase {
            &self.base
        }

        fn start(self: Arc<Self>) -> Result<()> {
            self.base.set_running();
            let me = self.clone();
            tokio::spawn(async move {
                me.base.abort_token().cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                me.base.finish();
            });
            Ok(())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct ScrubFactory {
        kind: TaskKind,
        decision: AdmissionDecision,
    }

    #[async_trait]
    impl TaskFactory for ScrubFactory {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn create(
            &self,
            _registry: &Arc<TaskRegistry>,
            bucket: Option<&BucketRef>,
            args: &RenewArgs,
        ) -> Result<Arc<dyn Task>> {
            Ok(Arc::new(Scrub {
                base: TaskBase::new(&args.uuid_or_new(), self.kind, bucket.cloned()),
            }))
        }

        fn when_prev_is_running(&self, _prev: &dyn Task) -> AdmissionDecision {
            self.decision
        }
    }

    fn registry_with(kind: TaskKind, decision: AdmissionDecision) -> Arc<TaskRegistry> {
        let registry = TaskRegistry::new(RegistryConfig::default());
        registry.register(Arc::new(ScrubFactory { kind, decision }));
        registry
    }

    #[test]
    fn test_registry_config_default() {
        let config = RegistryConfig::default();
        assert_eq!(config.finished_retention, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let registry = TaskRegistry::new(RegistryConfig::default());
        let err = registry
            .renew(TaskKind::new("nope"), None, RenewArgs::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::UnknownTaskKind(k) if k == "nope");
    }

    #[tokio::test]
    async fn test_first_renew_starts_task() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::UsePrevious);
        let bck = BucketRef::new("b1");

        let renewal = registry.renew(kind, Some(&bck), RenewArgs::new()).await.unwrap();
        assert!(renewal.decision.is_none());
        assert!(renewal.is_new());
        assert_eq!(renewal.task.base().state(), crate::xact::TaskState::Running);
        assert_eq!(registry.live_count(), 1);
        assert!(registry.get(renewal.task.id()).is_ok());
    }

    #[tokio::test]
    async fn test_use_previous() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::UsePrevious);
        let bck = BucketRef::new("b1");

        let first = registry.renew(kind, Some(&bck), RenewArgs::new()).await.unwrap();
        let second = registry.renew(kind, Some(&bck), RenewArgs::new()).await.unwrap();

        assert_eq!(second.decision, Some(AdmissionDecision::UsePrevious));
        assert!(!second.is_new());
        assert_eq!(first.task.id(), second.task.id());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_buckets_are_separate_keys() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::UsePrevious);

        let a = registry
            .renew(kind, Some(&BucketRef::new("a")), RenewArgs::new())
            .await
            .unwrap();
        let b = registry
            .renew(kind, Some(&BucketRef::new("b")), RenewArgs::new())
            .await
            .unwrap();
        assert_ne!(a.task.id(), b.task.id());
        assert_eq!(registry.running(kind).len(), 2);
    }

    #[tokio::test]
    async fn test_keep_and_start_new() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::KeepAndStartNew);

        let first = registry.renew(kind, None, RenewArgs::new()).await.unwrap();
        let second = registry.renew(kind, None, RenewArgs::new()).await.unwrap();

        assert_eq!(second.decision, Some(AdmissionDecision::KeepAndStartNew));
        assert_ne!(first.task.id(), second.task.id());
        assert!(!first.task.base().is_aborted());
        assert_eq!(registry.live_count(), 2);
    }

    #[tokio::test]
    async fn test_abort_and_replace_waits_for_finish() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::AbortAndReplace);

        let first = registry.renew(kind, None, RenewArgs::new()).await.unwrap();
        let second = registry.renew(kind, None, RenewArgs::new()).await.unwrap();

        assert_eq!(second.decision, Some(AdmissionDecision::AbortAndReplace));
        assert!(first.task.base().is_finished());
        assert!(first.task.snapshot().aborted());
        assert!(!second.task.base().is_finished());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_use_previous_yields_one_task() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::UsePrevious);
        let bck = BucketRef::new("b1");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let bck = bck.clone();
                tokio::spawn(async move {
                    registry
                        .renew(kind, Some(&bck), RenewArgs::new())
                        .await
                        .unwrap()
                        .task
                        .id()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_aborting_previous_is_not_reused() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::UsePrevious);

        let first = registry.renew(kind, None, RenewArgs::new()).await.unwrap();
        first.task.abort("going away");

        let second = registry.renew(kind, None, RenewArgs::new()).await.unwrap();
        assert!(second.decision.is_none());
        assert_ne!(first.task.id(), second.task.id());
        assert!(first.task.base().is_finished());
    }

    #[tokio::test]
    async fn test_stop_and_abort_all() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::KeepAndStartNew);

        let a = registry.renew(kind, None, RenewArgs::new()).await.unwrap();
        let _b = registry.renew(kind, None, RenewArgs::new()).await.unwrap();

        assert!(registry.stop(a.task.id(), "user").unwrap());
        assert!(!registry.stop(a.task.id(), "again").unwrap());
        assert_matches!(registry.stop(Uuid::new_v4(), "x"), Err(Error::TaskNotFound(_)));

        assert_eq!(registry.abort_all("shutdown"), 1);
    }

    #[tokio::test]
    async fn test_evict_finished() {
        let kind = TaskKind::new("scrub");
        let registry = TaskRegistry::new(RegistryConfig {
            finished_retention: Duration::ZERO,
        });
        registry.register(Arc::new(ScrubFactory {
            kind,
            decision: AdmissionDecision::UsePrevious,
        }));

        let renewal = registry.renew(kind, None, RenewArgs::new()).await.unwrap();
        renewal.task.abort("done");
        renewal.task.base().wait_finished().await;

        assert_eq!(registry.evict_finished(), 1);
        assert!(matches!(
            registry.get(renewal.task.id()),
            Err(Error::TaskNotFound(_))
        ));
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_caller_uuid_is_used() {
        let kind = TaskKind::new("scrub");
        let registry = registry_with(kind, AdmissionDecision::KeepAndStartNew);
        let id = Uuid::new_v4();

        let renewal = registry
            .renew(kind, None, RenewArgs::new().with_uuid(id.to_string()))
            .await
            .unwrap();
        assert_eq!(renewal.task.id(), id);
    }
}
