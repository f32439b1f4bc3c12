//! Node-local collaborators of the restore engine
//!
//! - [`LocalStore`]: where reconstructed objects are persisted
//! - [`Mounts`]: the node's mount table as the storage layer sees it
//! - [`ObjectLocator`]: maps an object name to its mount, size and source
//!
//! Each comes with an in-memory implementation used by the node binary's
//! loopback mode and by tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::request::{MountId, ObjectRef};
use crate::error::{Error, Result};
use crate::xact::BucketRef;

// =============================================================================
// Local Store
// =============================================================================

/// Persistence for restored objects
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// True if the object is already present locally
    async fn contains(&self, bucket: &BucketRef, name: &str) -> bool;

    /// Persist a reconstructed object on its mount
    async fn put(&self, obj: &ObjectRef, data: Bytes) -> Result<()>;
}

/// Store keeping objects in memory, keyed by `bucket/object`
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: DashMap<String, (MountId, Bytes)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &BucketRef, name: &str) -> Option<Bytes> {
        self.objects
            .get(&bucket.cname(name))
            .map(|entry| entry.value().1.clone())
    }

    /// Mount the object was written to
    pub fn mount_of(&self, bucket: &BucketRef, name: &str) -> Option<MountId> {
        self.objects
            .get(&bucket.cname(name))
            .map(|entry| entry.value().0.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn contains(&self, bucket: &BucketRef, name: &str) -> bool {
        self.objects.contains_key(&bucket.cname(name))
    }

    async fn put(&self, obj: &ObjectRef, data: Bytes) -> Result<()> {
        debug!(object = %obj.cname(), mount = %obj.mount, bytes = data.len(), "Stored object");
        self.objects
            .insert(obj.cname(), (obj.mount.clone(), data));
        Ok(())
    }
}

// =============================================================================
// Mounts
// =============================================================================

/// State of one local mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Enabled,
    /// Known but currently unavailable (e.g. being re-scanned)
    Disabled,
}

/// Node mount table
#[derive(Debug, Default)]
pub struct Mounts {
    mounts: RwLock<BTreeMap<MountId, MountState>>,
}

impl Mounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mounts<I, M>(ids: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<MountId>,
    {
        let mounts = Self::new();
        for id in ids {
            mounts.attach(id.into());
        }
        mounts
    }

    /// Add (or re-enable) a mount. Returns false if it was already enabled.
    pub fn attach(&self, id: MountId) -> bool {
        let prev = self.mounts.write().insert(id.clone(), MountState::Enabled);
        if prev == Some(MountState::Enabled) {
            warn!(mount = %id, "Mount already attached");
            return false;
        }
        true
    }

    /// Remove a mount. Returns false if it was unknown.
    pub fn detach(&self, id: &MountId) -> bool {
        self.mounts.write().remove(id).is_some()
    }

    pub fn disable(&self, id: &MountId) -> Result<()> {
        match self.mounts.write().get_mut(id) {
            Some(state) => {
                *state = MountState::Disabled;
                Ok(())
            }
            None => Err(Error::Config(format!("unknown mount {}", id))),
        }
    }

    pub fn state(&self, id: &MountId) -> Option<MountState> {
        self.mounts.read().get(id).copied()
    }

    /// All known mounts, disabled ones included
    pub fn all(&self) -> Vec<MountId> {
        self.mounts.read().keys().cloned().collect()
    }

    /// Enabled mounts only
    pub fn available(&self) -> Vec<MountId> {
        self.mounts
            .read()
            .iter()
            .filter(|(_, state)| **state == MountState::Enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

// =============================================================================
// Object Locator
// =============================================================================

/// Resolves object names to their placement
pub trait ObjectLocator: Send + Sync {
    fn locate(&self, bucket: &BucketRef, name: &str) -> Result<ObjectRef>;
}

/// Locator backed by a fixed table
#[derive(Debug, Default)]
pub struct StaticLocator {
    objects: DashMap<String, ObjectRef>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, obj: ObjectRef) {
        self.objects.insert(obj.cname(), obj);
    }
}

impl ObjectLocator for StaticLocator {
    fn locate(&self, bucket: &BucketRef, name: &str) -> Result<ObjectRef> {
        let cname = bucket.cname(name);
        self.objects
            .get(&cname)
            .map(|entry| entry.value().clone())
            .ok_or(Error::ObjectNotFound(cname))
    }
}
