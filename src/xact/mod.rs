//! Extended Actions
//!
//! Lifecycle management for long-running background cluster operations
//! ("extended actions"): a registry that admits, reuses or supersedes tasks
//! keyed by (kind, bucket), the factories that build them, and the shared
//! task state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            TaskRegistry                                  │
//! │   kind ──► TaskFactory          (kind, bucket) ──► [live Task, ...]      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  ┌──────────────┐    ┌──────────────────┐    ┌───────────────────────┐  │
//! │  │ EcGetFactory │    │ RestoreJobFactory│    │      EtlFactory       │  │
//! │  │ UsePrevious  │    │ KeepAndStartNew  │    │   KeepAndStartNew     │  │
//! │  └──────┬───────┘    └────────┬─────────┘    └───────────┬───────────┘  │
//! │         ▼                     ▼                          ▼              │
//! │   RestoreEngine          ObjectRestore               EtlInline          │
//! │         └─────────────────────┴──────────────────────────┘              │
//! │                          TaskBase (id, state,                            │
//! │                          abort, counters)                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Kinds** (`kind.rs`): `TaskKind`, `BucketRef`, registry keys
//! - **Task** (`task.rs`): the `Task` trait, `TaskBase` state machine and
//!   snapshots
//! - **Demand** (`demand.rs`): idle detection for demand-based tasks
//! - **Factory** (`factory.rs`): `TaskFactory` and `AdmissionDecision`
//! - **Registry** (`registry.rs`): admission, lookup, teardown
//! - **ETL** (`etl.rs`): inline transform marker task

pub mod demand;
pub mod etl;
pub mod factory;
pub mod kind;
pub mod registry;
pub mod task;

pub use demand::DemandTracker;
pub use etl::{EtlFactory, EtlInline, EtlSpec};
pub use factory::{AdmissionDecision, RenewArgs, TaskFactory};
pub use kind::{BucketRef, RegistryKey, TaskKind};
pub use registry::{RegistryConfig, Renewal, TaskRegistry};
pub use task::{downcast, Task, TaskBase, TaskSnapshot, TaskState};
