//! Property-Based Tests for the Restore Path
//!
//! # Test Properties
//!
//! 1. **Admission Determinism**: a factory's decision depends only on the
//!    kind, never on the previous instance's state or counters
//! 2. **Stats Monotonicity**: counters never decrease under any sequence of
//!    updates
//! 3. **Unique Names**: distinct (source, bucket, object) triples never
//!    collide
//! 4. **Chunked Delivery**: any chunk size delivers the exact payload

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use super::engine::{EcGetFactory, RestoreConfig, RestoreDeps};
use super::job::RestoreJobFactory;
use super::request::NodeId;
use super::router::SliceResponseRouter;
use super::stats::RestoreStats;
use super::store::{InMemoryStore, Mounts, StaticLocator};
use super::transport::{ChannelTransport, ObjHeader};
use super::writer::{SliceWriter, UniqueName, WriterRegistry};
use crate::xact::{
    AdmissionDecision, BucketRef, EtlFactory, Task, TaskBase, TaskFactory, TaskKind,
};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum StatsOp {
    Decode(u64, u64),
    Object(u64, bool),
    Queue(usize),
}

fn stats_op_strategy() -> impl Strategy<Value = StatsOp> {
    prop_oneof![
        (0u64..1_000, 0u64..1_000_000).prop_map(|(ms, bytes)| StatsOp::Decode(ms, bytes)),
        (0u64..1_000, any::<bool>()).prop_map(|(ms, ok)| StatsOp::Object(ms, ok)),
        (0usize..256).prop_map(StatsOp::Queue),
    ]
}

fn name_strategy() -> impl Strategy<Value = (String, String, String)> {
    ("[a-c]{1,2}", "[a-c/]{1,3}", "[a-c/]{1,3}")
}

/// Bare task whose state a property can drive
struct Prev {
    base: TaskBase,
}

impl Task for Prev {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn start(self: Arc<Self>) -> crate::error::Result<()> {
        self.base.set_running();
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

fn factories() -> Vec<(Arc<dyn TaskFactory>, AdmissionDecision)> {
    let (transport, _rx) = ChannelTransport::new();
    let deps = RestoreDeps {
        transport: Arc::new(transport),
        store: Arc::new(InMemoryStore::new()),
        mounts: Arc::new(Mounts::new()),
    };
    vec![
        (
            Arc::new(EcGetFactory::new(RestoreConfig::default(), deps)),
            AdmissionDecision::UsePrevious,
        ),
        (
            Arc::new(RestoreJobFactory::new(Arc::new(StaticLocator::new()))),
            AdmissionDecision::KeepAndStartNew,
        ),
        (Arc::new(EtlFactory), AdmissionDecision::KeepAndStartNew),
    ]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the admission decision is a function of the kind alone.
    #[test]
    fn prop_admission_is_deterministic(
        idle in any::<bool>(),
        errors in 0usize..5,
        objects in 0u64..10,
    ) {
        for (factory, expected) in factories() {
            let prev = Prev { base: TaskBase::generate(factory.kind(), Some(BucketRef::new("b"))) };
            prev.base.set_running();
            prev.base.set_idle(idle);
            for i in 0..errors {
                prev.base.add_err(&crate::error::Error::Internal(format!("e{}", i)));
            }
            for _ in 0..objects {
                prev.base.inc_objects();
            }
            prop_assert_eq!(factory.when_prev_is_running(&prev), expected);
        }
    }

    /// Property: no snapshot counter ever decreases.
    #[test]
    fn prop_stats_are_monotone(ops in prop::collection::vec(stats_op_strategy(), 1..64)) {
        let stats = RestoreStats::new();
        let mut last = stats.snapshot();
        for op in ops {
            match op {
                StatsOp::Decode(ms, bytes) => stats.record_decode(Duration::from_millis(ms), bytes),
                StatsOp::Object(ms, ok) => stats.record_object(Duration::from_millis(ms), ok),
                StatsOp::Queue(len) => stats.sample_queue_len(len),
            }
            let snap = stats.snapshot();
            prop_assert!(snap.decoded >= last.decoded);
            prop_assert!(snap.objects >= last.objects);
            prop_assert!(snap.errors >= last.errors);
            prop_assert!(snap.bytes >= last.bytes);
            prop_assert!(snap.errors <= snap.objects);
            last = snap;
        }
    }

    /// Property: unique names are injective over their triple.
    #[test]
    fn prop_unique_names_do_not_collide(a in name_strategy(), b in name_strategy()) {
        let ua = UniqueName::new(NodeId::new(a.0.clone()), BucketRef::new(a.1.clone()), a.2.clone());
        let ub = UniqueName::new(NodeId::new(b.0.clone()), BucketRef::new(b.1.clone()), b.2.clone());
        prop_assert_eq!(ua == ub, a == b);
    }

    /// Property: chunked delivery reassembles the exact payload.
    #[test]
    fn prop_chunked_delivery_is_exact(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        chunk in 1usize..512,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let writers = Arc::new(WriterRegistry::new());
        let router = SliceResponseRouter::new(writers.clone(), chunk);
        let uname = UniqueName::new(NodeId::from("t2"), BucketRef::new("b"), "o");
        let (writer, rx) = SliceWriter::new(uname.clone(), payload.len() as u64, None);
        writers.register(writer).unwrap();

        let hdr = ObjHeader::slice_data(&uname, payload.len() as u64);
        let mut body: &[u8] = &payload;
        let delivered = rt.block_on(router.deliver(&hdr, &mut body)).unwrap();
        let data = rt.block_on(rx).unwrap().unwrap();

        prop_assert_eq!(delivered, payload.len() as u64);
        prop_assert_eq!(data.as_ref(), payload.as_slice());
    }
}

#[test]
fn test_kinds_are_distinct() {
    let kinds: Vec<TaskKind> = factories().iter().map(|(f, _)| f.kind()).collect();
    assert_eq!(kinds.len(), 3);
    assert!(kinds.windows(2).all(|w| w[0] != w[1]));
}
