//! Erasure-Coded Object Restore
//!
//! The EC-GET engine restores objects missing on this node by fetching their
//! reconstructed content from the peers holding the slices.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     RestoreEngine (one per bucket)                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  submit ──► mount table ──► ┌──────────┐ ┌──────────┐ ┌──────────┐      │
//! │                             │Worker[m1]│ │Worker[m2]│ │Worker[mN]│      │
//! │                             └────┬─────┘ └────┬─────┘ └────┬─────┘      │
//! │                                  └────────────┼────────────┘            │
//! │                                               ▼                         │
//! │                       WriterRegistry ◄── register / fetch               │
//! │                              ▲                │                         │
//! │                              │                ▼                         │
//! │   peer response ──► SliceResponseRouter    PeerTransport ──► peers      │
//! │                                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Engine** (`engine.rs`): lifecycle, coordinating loop, dispatch,
//!   `EcGetFactory`
//! - **Worker** (`worker.rs`): per-mount sequential request processing
//! - **Request** (`request.rs`): restore requests and their result paths
//! - **Writer** (`writer.rs`): pending fetch targets keyed by unique name
//! - **Router** (`router.rs`): inbound response demultiplexing
//! - **Transport** (`transport.rs`): peer slice protocol types
//! - **Store** (`store.rs`): local store, mount table, object locator
//! - **Stats** (`stats.rs`): engine counters
//! - **Job** (`job.rs`): single-object restore task used by the control plane

pub mod engine;
pub mod job;
pub mod request;
pub mod router;
pub mod stats;
pub mod store;
pub mod transport;
pub mod worker;
pub mod writer;

#[cfg(test)]
mod proptest;

pub use engine::{EcGetFactory, EcGetStats, RestoreConfig, RestoreDeps, RestoreEngine, RestoreOptions};
pub use job::{ObjectRestore, RestoreJobArgs, RestoreJobFactory, RestoreSnapshot};
pub use request::{Action, Callback, MountId, NodeId, ObjectRef, Progress, Request};
pub use router::SliceResponseRouter;
pub use stats::{RestoreStats, RestoreStatsSnapshot};
pub use store::{InMemoryStore, LocalStore, MountState, Mounts, ObjectLocator, StaticLocator};
pub use transport::{ChannelTransport, ObjAttrs, ObjHeader, Opcode, PeerTransport, SliceFetch};
pub use worker::Worker;
pub use writer::{SliceWriter, UniqueName, WriterRegistry};
