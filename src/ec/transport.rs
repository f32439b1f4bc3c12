//! Peer slice protocol
//!
//! Outbound, a worker asks the node holding an object's slices to send the
//! reconstructed object ([`SliceFetch`]). Inbound, the response arrives as an
//! [`ObjHeader`] followed by a byte stream, handed to the engine's router.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::request::NodeId;
use super::writer::UniqueName;
use crate::error::{Error, Result};
use crate::xact::BucketRef;

/// Message opcodes of the slice protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Slice or full replica data
    SliceData = 1,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Opcode::SliceData),
            other => Err(Error::InvalidOpcode(other)),
        }
    }
}

/// Object attributes carried by a response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjAttrs {
    /// Bytes that follow the header
    pub size: u64,
    pub checksum: Option<String>,
}

/// Header of an inbound response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjHeader {
    /// Raw opcode; validated by the router
    pub opcode: u8,
    pub source: NodeId,
    pub bucket: BucketRef,
    pub object: String,
    pub attrs: ObjAttrs,
}

impl ObjHeader {
    pub fn slice_data(uname: &UniqueName, size: u64) -> Self {
        Self {
            opcode: Opcode::SliceData as u8,
            source: uname.source.clone(),
            bucket: uname.bucket.clone(),
            object: uname.object.clone(),
            attrs: ObjAttrs {
                size,
                checksum: None,
            },
        }
    }

    pub fn uname(&self) -> UniqueName {
        UniqueName::new(self.source.clone(), self.bucket.clone(), self.object.clone())
    }
}

/// Outbound fetch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceFetch {
    /// Node asked to serve the data
    pub source: NodeId,
    pub bucket: BucketRef,
    pub object: String,
}

impl SliceFetch {
    pub fn uname(&self) -> UniqueName {
        UniqueName::new(self.source.clone(), self.bucket.clone(), self.object.clone())
    }
}

impl From<&UniqueName> for SliceFetch {
    fn from(uname: &UniqueName) -> Self {
        Self {
            source: uname.source.clone(),
            bucket: uname.bucket.clone(),
            object: uname.object.clone(),
        }
    }
}

/// Sends fetches to peers. Responses come back through the router, not
/// through this trait.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_fetch(&self, fetch: SliceFetch) -> Result<()>;
}

/// Transport that hands fetches to an in-process channel (loopback peers,
/// tests)
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<SliceFetch>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SliceFetch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PeerTransport for ChannelTransport {
    async fn send_fetch(&self, fetch: SliceFetch) -> Result<()> {
        self.tx
            .send(fetch)
            .map_err(|e| Error::Transport(format!("peer channel closed, dropped {:?}", e.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_opcode_parse() {
        assert_eq!(Opcode::try_from(1).unwrap(), Opcode::SliceData);
        assert_matches!(Opcode::try_from(7), Err(Error::InvalidOpcode(7)));
    }

    #[test]
    fn test_header_correlates_with_fetch() {
        let uname = UniqueName::new(NodeId::from("t2"), BucketRef::new("b"), "o1");
        let fetch = SliceFetch::from(&uname);
        let hdr = ObjHeader::slice_data(&fetch.uname(), 10);
        assert_eq!(hdr.uname(), uname);
        assert_eq!(hdr.attrs.size, 10);
    }

    #[tokio::test]
    async fn test_channel_transport_closed() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let fetch = SliceFetch {
            source: NodeId::from("t2"),
            bucket: BucketRef::new("b"),
            object: "o1".to_string(),
        };
        assert_matches!(transport.send_fetch(fetch).await, Err(Error::Transport(_)));
    }
}
