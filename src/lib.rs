//! ecrestore - Erasure-Coded Object Restore for Clustered Storage Nodes
//!
//! The EC restore engine of a storage node, together with the registry that
//! admits, deduplicates and tears down the node's long-running background
//! operations ("extended actions").
//!
//! # Architecture
//!
//! ```text
//! ControlPlane ──► TaskRegistry ──► RestoreEngine (per bucket) ──► Workers (per mount)
//!                                         ▲                              │
//!                 peer responses ─────────┘ SliceResponseRouter ◄── peer fetches
//! ```
//!
//! # Modules
//!
//! - [`control`] - Node control plane (start / watch / stop restores)
//! - [`ec`] - EC-GET restore engine, workers, response routing
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`xact`] - Extended-action lifecycle and registry

pub mod control;
pub mod ec;
pub mod error;
pub mod metrics;
pub mod xact;

// Re-export commonly used types
pub use control::ControlPlane;
pub use ec::{RestoreConfig, RestoreDeps, RestoreEngine, RestoreOptions, RestoreSnapshot};
pub use error::{Error, Result};
pub use xact::{AdmissionDecision, RegistryConfig, Task, TaskKind, TaskRegistry};
