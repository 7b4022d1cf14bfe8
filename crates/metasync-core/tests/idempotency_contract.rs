//! Contract Test: Idempotency
//!
//! This test verifies that reconciling an unchanged desired set performs no
//! external writes.
//!
//! Constraints verified:
//! - A target already holding the desired CIDRs is not written
//! - A second cycle with the same ranges performs zero writes
//! - A change in published ranges produces exactly one write
//! - Duplicate CIDRs across sources are written once
//!
//! If this test fails, targets will be rewritten every cycle.

mod common;

use common::*;
use metasync_core::{EngineEvent, SourceReference, SyncContext, SyncSpec, TargetReference};

fn spec() -> SyncSpec {
    SyncSpec::new("spec")
        .with_source(SourceReference::new("github"))
        .with_target(TargetReference::new("edge"))
}

#[tokio::test]
async fn target_already_holding_desired_set_is_not_written() {
    let harness = Harness::new();
    let source = MockSource::new("github", ranges(&[("10.0.0.0/8", "web")]));
    let target = MockTarget::holding("edge", ranges(&[("10.0.0.0/8", "")]));
    harness.source(&source).await;
    harness.target(&target).await;

    let status = harness.engine.reconcile(&SyncContext::background(), &spec()).await;

    assert!(status.is_ready());
    assert_eq!(target.apply_count(), 1);
    assert_eq!(target.write_count(), 0);
}

#[tokio::test]
async fn repeated_cycles_write_once() {
    let harness = Harness::new();
    let source = MockSource::new(
        "github",
        ranges(&[("192.30.252.0/22", "hooks"), ("185.199.108.0/22", "pages")]),
    );
    let target = MockTarget::new("edge");
    harness.source(&source).await;
    harness.target(&target).await;

    for _ in 0..3 {
        let status = harness.engine.reconcile(&SyncContext::background(), &spec()).await;
        assert!(status.is_ready());
    }

    assert_eq!(target.write_count(), 1, "only the first cycle writes");
    assert_eq!(target.apply_count(), 3);
}

#[tokio::test]
async fn changed_ranges_are_written_once() {
    let harness = Harness::new();
    let source = MockSource::new("github", ranges(&[("10.0.0.0/8", "web")]));
    let target = MockTarget::new("edge");
    harness.source(&source).await;
    harness.target(&target).await;
    let (engine, mut events) = metasync_core::SyncEngine::new(
        std::sync::Arc::new(harness.store.clone()),
        std::sync::Arc::clone(&harness.registry),
    )
    .with_events(32);

    engine.reconcile(&SyncContext::background(), &spec()).await;
    source.set_ranges(ranges(&[("10.0.0.0/8", "web"), ("172.16.0.0/12", "web")]));
    engine.reconcile(&SyncContext::background(), &spec()).await;
    engine.reconcile(&SyncContext::background(), &spec()).await;

    assert_eq!(target.write_count(), 2);
    assert_eq!(target.applied_cidrs(), vec!["10.0.0.0/8", "172.16.0.0/12"]);

    let mut applied = Vec::new();
    let mut unchanged = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::TargetApplied { added, removed, .. } => applied.push((added, removed)),
            EngineEvent::TargetUnchanged { .. } => unchanged += 1,
            _ => {}
        }
    }
    assert_eq!(applied, vec![(1, 0), (1, 0)]);
    assert_eq!(unchanged, 1);
}

#[tokio::test]
async fn duplicate_cidrs_across_sources_are_written_once() {
    let harness = Harness::new();
    let first = MockSource::new("github", ranges(&[("10.0.0.0/8", "web")]));
    let second = MockSource::new("mirror", ranges(&[("10.0.0.0/8", "api"), ("10.2.0.0/16", "api")]));
    let target = MockTarget::new("edge");
    harness.source(&first).await;
    harness.source(&second).await;
    harness.target(&target).await;

    let spec = spec().with_source(SourceReference::new("mirror"));
    let status = harness.engine.reconcile(&SyncContext::background(), &spec).await;

    assert!(status.is_ready());
    assert_eq!(status.desired_count, 2);
    assert_eq!(target.applied_cidrs(), vec!["10.0.0.0/8", "10.2.0.0/16"]);
}
