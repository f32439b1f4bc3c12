//! Pending slice writers
//!
//! A [`SliceWriter`] collects the bytes of one in-flight fetch. It is
//! registered under its [`UniqueName`] before the fetch goes out and removed
//! once the fetch resolves. The [`WriterRegistry`] is the only structure both
//! workers and the response router mutate; every operation on it is a single
//! short critical section with no I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::request::{NodeId, ObjectRef, Progress};
use crate::error::{Error, Result};
use crate::xact::BucketRef;

// =============================================================================
// Unique Name
// =============================================================================

/// Correlation key between an outbound fetch and its inbound response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueName {
    pub source: NodeId,
    pub bucket: BucketRef,
    pub object: String,
}

impl UniqueName {
    pub fn new(source: NodeId, bucket: BucketRef, object: impl Into<String>) -> Self {
        Self {
            source,
            bucket,
            object: object.into(),
        }
    }

    pub fn for_object(obj: &ObjectRef) -> Self {
        Self::new(obj.source.clone(), obj.bucket.clone(), obj.name.clone())
    }
}

impl std::fmt::Display for UniqueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.bucket, self.object)
    }
}

// =============================================================================
// Slice Writer
// =============================================================================

/// Receiving end of one fetch
pub struct SliceWriter {
    uname: UniqueName,
    size: u64,
    buf: Mutex<BytesMut>,
    received: AtomicU64,
    done: Mutex<Option<oneshot::Sender<Result<Bytes>>>>,
    progress: Option<Arc<Progress>>,
}

impl SliceWriter {
    /// Create a writer expecting `size` bytes. The receiver resolves with the
    /// assembled bytes or the failure.
    pub fn new(
        uname: UniqueName,
        size: u64,
        progress: Option<Arc<Progress>>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        let writer = Arc::new(Self {
            uname,
            size,
            buf: Mutex::new(BytesMut::with_capacity(size.min(1 << 20) as usize)),
            received: AtomicU64::new(0),
            done: Mutex::new(Some(tx)),
            progress,
        });
        (writer, rx)
    }

    pub fn uname(&self) -> &UniqueName {
        &self.uname
    }

    /// Bytes expected
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes written so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// True once completed or failed
    pub fn is_resolved(&self) -> bool {
        self.done.lock().is_none()
    }

    pub fn write(&self, chunk: &[u8]) {
        self.buf.lock().extend_from_slice(chunk);
        let n = chunk.len() as u64;
        self.received.fetch_add(n, Ordering::AcqRel);
        if let Some(progress) = &self.progress {
            progress.add(n);
        }
    }

    /// Resolve with the assembled bytes. Returns false if already resolved.
    pub fn complete(&self) -> bool {
        let Some(tx) = self.done.lock().take() else {
            return false;
        };
        let data = std::mem::take(&mut *self.buf.lock()).freeze();
        debug!(uname = %self.uname, bytes = data.len(), "Slice writer complete");
        // the worker may have stopped waiting (abandoned or timed out)
        let _ = tx.send(Ok(data));
        true
    }

    /// Resolve with an error. Returns false if already resolved.
    pub fn fail(&self, err: Error) -> bool {
        let Some(tx) = self.done.lock().take() else {
            return false;
        };
        debug!(uname = %self.uname, error = %err, "Slice writer failed");
        let _ = tx.send(Err(err));
        true
    }
}

impl std::fmt::Debug for SliceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceWriter")
            .field("uname", &self.uname)
            .field("size", &self.size)
            .field("received", &self.received())
            .finish()
    }
}

// =============================================================================
// Writer Registry
// =============================================================================

/// Writers awaiting a response, keyed by unique name
#[derive(Debug, Default)]
pub struct WriterRegistry {
    writers: Mutex<HashMap<UniqueName, Arc<SliceWriter>>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a writer. A second writer for the same name is rejected.
    pub fn register(&self, writer: Arc<SliceWriter>) -> Result<()> {
        let mut writers = self.writers.lock();
        if writers.contains_key(writer.uname()) {
            warn!(uname = %writer.uname(), "Duplicate slice writer");
            return Err(Error::Internal(format!(
                "slice writer for {} already registered",
                writer.uname()
            )));
        }
        writers.insert(writer.uname().clone(), writer);
        Ok(())
    }

    pub fn lookup(&self, uname: &UniqueName) -> Option<Arc<SliceWriter>> {
        self.writers.lock().get(uname).cloned()
    }

    pub fn unregister(&self, uname: &UniqueName) -> Option<Arc<SliceWriter>> {
        self.writers.lock().remove(uname)
    }

    pub fn len(&self) -> usize {
        self.writers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn uname(object: &str) -> UniqueName {
        UniqueName::new(NodeId::from("t2"), BucketRef::new("b"), object)
    }

    #[tokio::test]
    async fn test_writer_assembles_chunks() {
        let progress = Arc::new(Progress::new(10));
        let (writer, rx) = SliceWriter::new(uname("o1"), 10, Some(progress.clone()));

        writer.write(b"hello");
        writer.write(b"world");
        assert_eq!(writer.received(), 10);
        assert!(writer.complete());
        assert!(!writer.complete());
        assert!(writer.is_resolved());

        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"helloworld"));
        assert_eq!(progress.done(), 10);
    }

    #[test]
    fn test_result_pending_until_resolved() {
        let (writer, rx) = SliceWriter::new(uname("o1"), 4, None);
        let mut rx = tokio_test::task::spawn(rx);
        tokio_test::assert_pending!(rx.poll());

        writer.write(b"ab");
        tokio_test::assert_pending!(rx.poll());

        assert!(writer.fail(Error::Internal("peer gone".into())));
        assert!(rx.is_woken());
        let result = tokio_test::assert_ready!(rx.poll());
        assert_matches!(result, Ok(Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_fail_after_complete_is_ignored() {
        let (writer, rx) = SliceWriter::new(uname("o1"), 0, None);
        assert!(writer.complete());
        assert!(!writer.fail(Error::Internal("late".into())));
        assert!(rx.await.unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = WriterRegistry::new();
        let (a, _rx_a) = SliceWriter::new(uname("o1"), 1, None);
        let (b, _rx_b) = SliceWriter::new(uname("o1"), 1, None);

        registry.register(a).unwrap();
        assert_matches!(registry.register(b), Err(Error::Internal(_)));
        assert_eq!(registry.len(), 1);

        assert!(registry.lookup(&uname("o1")).is_some());
        assert!(registry.lookup(&uname("o2")).is_none());
        assert!(registry.unregister(&uname("o1")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unique_name_includes_source() {
        let a = UniqueName::new(NodeId::from("t1"), BucketRef::new("b"), "o");
        let b = UniqueName::new(NodeId::from("t2"), BucketRef::new("b"), "o");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "t1/b/o");
    }
}
