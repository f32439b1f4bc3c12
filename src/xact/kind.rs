//! Task kinds and bucket scopes
//!
//! Value objects that make up the registry key of an extended action.

use serde::{Deserialize, Serialize};

// =============================================================================
// Task Kind
// =============================================================================

/// Kind of an extended action.
///
/// The set is open: every kind with a registered factory is valid, the
/// constants below are the kinds this crate implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskKind(&'static str);

impl TaskKind {
    /// Demand-based EC restore engine (one per bucket)
    pub const EC_GET: TaskKind = TaskKind("ec-get");

    /// Restore of a single object, driven through the bucket's EC engine
    pub const OBJECT_RESTORE: TaskKind = TaskKind("ec-restore-obj");

    /// Inline (per-call) transform
    pub const ETL_INLINE: TaskKind = TaskKind("etl-inline");

    /// Create a kind from a static name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Bucket Reference
// =============================================================================

/// Bucket an extended action is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketRef(String);

impl BucketRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully qualified object name within this bucket.
    pub fn cname(&self, object: &str) -> String {
        format!("{}/{}", self.0, object)
    }
}

impl std::fmt::Display for BucketRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BucketRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BucketRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Registry Key
// =============================================================================

/// Registry key: at most one live task per key unless the kind's factory
/// keeps previous instances running.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub kind: TaskKind,
    pub bucket: Option<BucketRef>,
}

impl RegistryKey {
    pub fn new(kind: TaskKind, bucket: Option<BucketRef>) -> Self {
        Self { kind, bucket }
    }
}

impl std::fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.bucket {
            Some(bck) => write!(f, "{}[{}]", self.kind, bck),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_display() {
        assert_eq!(TaskKind::EC_GET.to_string(), "ec-get");
        assert_eq!(TaskKind::new("custom").as_str(), "custom");
        assert_ne!(TaskKind::EC_GET, TaskKind::OBJECT_RESTORE);
    }

    #[test]
    fn test_bucket_cname() {
        let bck = BucketRef::new("photos");
        assert_eq!(bck.cname("a/b.jpg"), "photos/a/b.jpg");
        assert_eq!(BucketRef::from("photos"), bck);
    }

    #[test]
    fn test_registry_key_display() {
        let key = RegistryKey::new(TaskKind::EC_GET, Some(BucketRef::new("b1")));
        assert_eq!(key.to_string(), "ec-get[b1]");

        let key = RegistryKey::new(TaskKind::ETL_INLINE, None);
        assert_eq!(key.to_string(), "etl-inline");
    }
}
