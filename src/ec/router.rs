//! Slice response router
//!
//! Demultiplexes inbound peer responses to the writer waiting for them.
//!
//! ```text
//! ObjHeader + stream
//!   ├─► opcode != SliceData        ─► InvalidOpcode
//!   ├─► no writer for unique name  ─► NoWriter (nothing mutated)
//!   └─► writer found: read chunk_size at a time
//!         ├─ all object bytes      ─► writer.complete()
//!         └─ fewer (stream ends early
//!            or header declares less) ─► writer.fail(ShortRead), ShortRead
//! ```
//!
//! Escalation of fatal errors (engine abort) is up to the caller.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::transport::{ObjHeader, Opcode};
use super::writer::WriterRegistry;
use crate::error::{Error, Result};

/// Routes responses into registered [`SliceWriter`](super::writer::SliceWriter)s
#[derive(Debug, Clone)]
pub struct SliceResponseRouter {
    writers: Arc<WriterRegistry>,
    chunk_size: usize,
}

impl SliceResponseRouter {
    pub fn new(writers: Arc<WriterRegistry>, chunk_size: usize) -> Self {
        Self {
            writers,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Stream one response into its writer. Returns the bytes delivered.
    pub async fn deliver<R>(&self, hdr: &ObjHeader, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        match Opcode::try_from(hdr.opcode)? {
            Opcode::SliceData => {}
        }

        let uname = hdr.uname();
        let Some(writer) = self.writers.lookup(&uname) else {
            warn!(uname = %uname, "No slice writer for response");
            return Err(Error::NoWriter {
                uname: uname.to_string(),
            });
        };

        // the object size the writer was registered with is authoritative
        let expected = writer.size();
        if hdr.attrs.size > expected {
            warn!(uname = %uname, declared = hdr.attrs.size, expected, "Response larger than object");
        }
        let size = hdr.attrs.size.min(expected);
        let short_read = |received| Error::ShortRead {
            uname: uname.to_string(),
            expected,
            received,
        };

        let mut buf = vec![0u8; self.chunk_size];
        let mut received = 0u64;
        while received < size {
            let want = (size - received).min(buf.len() as u64) as usize;
            let n = match reader.read(&mut buf[..want]).await {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
                Err(e) => {
                    writer.fail(Error::Transport(format!("reading {}: {}", uname, e)));
                    return Err(Error::Io(e));
                }
            };
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]);
            received += n as u64;
        }
        if received < expected {
            writer.fail(short_read(received));
            return Err(short_read(received));
        }

        writer.complete();
        debug!(uname = %uname, bytes = received, "Delivered slice response");
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::request::NodeId;
    use crate::ec::writer::{SliceWriter, UniqueName};
    use crate::xact::BucketRef;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn uname(object: &str) -> UniqueName {
        UniqueName::new(NodeId::from("t2"), BucketRef::new("b"), object)
    }

    fn router() -> (SliceResponseRouter, Arc<WriterRegistry>) {
        let writers = Arc::new(WriterRegistry::new());
        (SliceResponseRouter::new(writers.clone(), 4), writers)
    }

    #[tokio::test]
    async fn test_deliver_in_chunks() {
        let (router, writers) = router();
        let (writer, rx) = SliceWriter::new(uname("o1"), 10, None);
        writers.register(writer).unwrap();

        let hdr = ObjHeader::slice_data(&uname("o1"), 10);
        let mut body: &[u8] = b"0123456789";
        assert_eq!(router.deliver(&hdr, &mut body).await.unwrap(), 10);
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"0123456789"));
    }

    #[tokio::test]
    async fn test_short_read_fails_writer() {
        let (router, writers) = router();
        let (writer, rx) = SliceWriter::new(uname("o1"), 10, None);
        writers.register(writer).unwrap();

        let hdr = ObjHeader::slice_data(&uname("o1"), 10);
        let mut body: &[u8] = b"0123";
        let err = router.deliver(&hdr, &mut body).await.unwrap_err();
        assert_matches!(err, Error::ShortRead { expected: 10, received: 4, .. });
        assert!(err.is_fatal_transfer());
        assert_matches!(
            rx.await.unwrap(),
            Err(Error::ShortRead { expected: 10, received: 4, .. })
        );
    }

    #[tokio::test]
    async fn test_short_declared_size_fails_writer() {
        let (router, writers) = router();
        let (writer, rx) = SliceWriter::new(uname("o1"), 10, None);
        writers.register(writer.clone()).unwrap();

        let hdr = ObjHeader::slice_data(&uname("o1"), 4);
        let mut body: &[u8] = b"0123";
        assert_matches!(
            router.deliver(&hdr, &mut body).await,
            Err(Error::ShortRead { expected: 10, received: 4, .. })
        );
        assert_eq!(writer.received(), 4);
        assert_matches!(
            rx.await.unwrap(),
            Err(Error::ShortRead { expected: 10, received: 4, .. })
        );
    }

    #[tokio::test]
    async fn test_oversized_response_is_capped() {
        let (router, writers) = router();
        let (writer, rx) = SliceWriter::new(uname("o1"), 3, None);
        writers.register(writer).unwrap();

        let hdr = ObjHeader::slice_data(&uname("o1"), 6);
        let mut body: &[u8] = b"abcdef";
        assert_eq!(router.deliver(&hdr, &mut body).await.unwrap(), 3);
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_unregistered_name_mutates_nothing() {
        let (router, writers) = router();
        let (writer, _rx) = SliceWriter::new(uname("o1"), 10, None);
        writers.register(writer.clone()).unwrap();

        let hdr = ObjHeader::slice_data(&uname("other"), 3);
        let mut body: &[u8] = b"abc";
        assert_matches!(
            router.deliver(&hdr, &mut body).await,
            Err(Error::NoWriter { uname }) if uname == "t2/b/other"
        );
        assert_eq!(writer.received(), 0);
        assert!(!writer.is_resolved());
        assert_eq!(writers.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_opcode() {
        let (router, _) = router();
        let mut hdr = ObjHeader::slice_data(&uname("o1"), 3);
        hdr.opcode = 42;
        let mut body: &[u8] = b"abc";
        assert_matches!(
            router.deliver(&hdr, &mut body).await,
            Err(Error::InvalidOpcode(42))
        );
    }
}
