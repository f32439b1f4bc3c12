//! Restore requests
//!
//! A [`Request`] asks the worker owning an object's mount to reconstruct the
//! object from peer slices. It is consumed exactly once and delivers at most
//! one terminal value through its result channel and callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::xact::BucketRef;

// =============================================================================
// Identifiers
// =============================================================================

/// Local storage mount (one disk or volume)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountId(String);

impl MountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Cluster node holding the slices of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Object Reference
// =============================================================================

/// An object to restore and where it belongs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: BucketRef,
    pub name: String,

    /// Mount the object is assigned to on this node
    pub mount: MountId,

    /// Full object size in bytes
    pub size: u64,

    /// Peer that serves the reconstructed object
    pub source: NodeId,
}

impl ObjectRef {
    /// `bucket/object`
    pub fn cname(&self) -> String {
        self.bucket.cname(&self.name)
    }
}

/// What the worker does with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    /// Fetch the object's slices from peers and persist the result locally
    Restore,
}

// =============================================================================
// Progress
// =============================================================================

/// Bytes received for a request, shared with whoever reports on it
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicU64,
    done: AtomicU64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            done: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn add(&self, n: u64) {
        self.done.fetch_add(n, Ordering::Relaxed);
    }
}

// =============================================================================
// Request
// =============================================================================

/// Completion callback: the object and the error, if any
pub type Callback = Box<dyn FnOnce(&ObjectRef, Option<&Error>) + Send>;

/// A unit of restore work for one object
pub struct Request {
    pub object: ObjectRef,
    pub action: Action,
    pub enqueued_at: Instant,
    result_tx: Option<oneshot::Sender<Result<()>>>,
    callback: Option<Callback>,
    progress: Option<Arc<Progress>>,
}

impl Request {
    /// A restore request with no result path attached
    pub fn restore(object: ObjectRef) -> Self {
        Self {
            object,
            action: Action::Restore,
            enqueued_at: Instant::now(),
            result_tx: None,
            callback: None,
            progress: None,
        }
    }

    /// Attach a result channel; the receiver gets exactly one value.
    pub fn with_result_channel(mut self) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        self.result_tx = Some(tx);
        (self, rx)
    }

    pub fn with_callback(
        mut self,
        callback: impl FnOnce(&ObjectRef, Option<&Error>) + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn progress(&self) -> Option<&Arc<Progress>> {
        self.progress.as_ref()
    }

    /// Deliver the terminal outcome: callback first, then the channel.
    pub fn finish(mut self, result: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(&self.object, result.as_ref().err());
        }
        if let Some(tx) = self.result_tx.take() {
            // receiver may have given up (caller-side timeout)
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("object", &self.object.cname())
            .field("mount", &self.object.mount)
            .field("action", &self.action)
            .field("result_channel", &self.result_tx.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

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
    async fn test_finish_delivers_once_to_both_paths() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();

        let (req, rx) = Request::restore(object("o1", "m1", 10))
            .with_callback(move |obj, err| {
                seen_cb
                    .lock()
                    .unwrap()
                    .push((obj.cname(), err.map(|e| e.to_string())));
            })
            .with_result_channel();

        req.finish(Err(Error::EcRequestsDisabled));

        assert_matches!(rx.await.unwrap(), Err(Error::EcRequestsDisabled));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "b/o1");
        assert!(seen[0].1.as_deref().unwrap().contains("disabled"));
    }

    #[test]
    fn test_finish_tolerates_dropped_receiver() {
        let (req, rx) = Request::restore(object("o1", "m1", 10)).with_result_channel();
        drop(rx);
        req.finish(Ok(()));
    }

    #[test]
    fn test_progress() {
        let progress = Progress::new(10);
        progress.add(4);
        progress.add(6);
        assert_eq!(progress.total(), 10);
        assert_eq!(progress.done(), 10);
    }
}
