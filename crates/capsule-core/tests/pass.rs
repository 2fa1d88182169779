mod common;

use capsule_core::telemetry::{EVENT_PASS_ASSIST, EVENT_PASS_DEPTH_EXCEEDED, EVENT_PASS_RESUME};
use capsule_core::{
    Capsule, CapsuleMetrics, CapsuleOutput, CapsuleResult, FailureKind, Need, PassReason, PassRequest,
    ResourceSnapshot, ASSIST_CONTEXT_HEADER, DEFAULT_MAX_PASS_DEPTH, MAX_PASS_DEPTH_EXCEEDED,
};
use common::{government, harness, harness_with, CallKind};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn plenty() -> ResourceSnapshot {
    ResourceSnapshot::safe(64_000)
}

fn blocked_without_needs(capsule: &Capsule) -> CapsuleResult {
    CapsuleResult::blocked(
        &capsule.id,
        CapsuleOutput::default(),
        PassRequest {
            reason: PassReason::LowOutputConfidence,
            needs: vec![],
            critique: None,
            original: "a weak reply".to_string(),
            score: Some(0.2),
        },
        CapsuleMetrics::default(),
    )
}

#[tokio::test]
async fn empty_needs_redispatch_exactly_once() {
    let h = harness(plenty()).await;
    let capsule = Capsule::chat("c-empty", "explain tides");

    let result = h
        .engine
        .broker()
        .resolve(&capsule, blocked_without_needs(&capsule), &CancellationToken::new())
        .await;

    assert!(result.ok, "{:?}", result);
    assert_eq!(result.metrics.pass_depth, 1);
    assert_eq!(h.backend.count(CallKind::Assist), 0);
    let dispatches = h.backend.calls_of(CallKind::Dispatch);
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].request.prompt, "explain tides");
}

#[tokio::test]
async fn always_low_confidence_stops_after_max_depth_resumptions() {
    let h = harness(plenty()).await;
    h.backend.set_score("0.1");
    let capsule = Capsule::chat("c-loop", "explain tides");

    let result = h.engine.submit(&capsule, &CancellationToken::new()).await;

    assert!(!result.ok);
    assert!(!result.blocked);
    assert_eq!(result.failure, Some(FailureKind::DepthExceeded));
    assert_eq!(result.error.as_deref(), Some(MAX_PASS_DEPTH_EXCEEDED));
    assert_eq!(result.metrics.pass_depth, DEFAULT_MAX_PASS_DEPTH);
    // One initial pass plus one per resumption.
    assert_eq!(h.backend.count(CallKind::Dispatch), DEFAULT_MAX_PASS_DEPTH as usize + 1);
    assert_eq!(h.telemetry.count(EVENT_PASS_RESUME), DEFAULT_MAX_PASS_DEPTH as usize);
    assert_eq!(h.telemetry.count(EVENT_PASS_DEPTH_EXCEEDED), 1);
    assert_eq!(h.engine.load_balancer().total_committed_mb(), 0);
}

#[tokio::test]
async fn custom_max_depth_is_honored() {
    let mut config = government();
    config.pass.max_depth = 1;
    let h = harness_with(config, plenty(), None).await;
    h.backend.set_score("0.1");

    let result = h.engine.submit(&Capsule::chat("c-d1", "explain tides"), &CancellationToken::new()).await;

    assert_eq!(result.failure, Some(FailureKind::DepthExceeded));
    assert_eq!(h.backend.count(CallKind::Dispatch), 2);
}

#[tokio::test]
async fn assists_are_appended_to_the_original_goal() {
    let h = harness(plenty()).await;
    h.backend.push_scores(&["0.3"]);
    *h.backend.assist_text.lock().unwrap() = "Tides follow the moon's gravity.".to_string();
    let capsule = Capsule::chat("c-tides", "explain tides");

    let result = h.engine.submit(&capsule, &CancellationToken::new()).await;

    assert!(result.ok, "{:?}", result);
    assert_eq!(result.metrics.pass_depth, 1);
    let dispatches = h.backend.calls_of(CallKind::Dispatch);
    assert_eq!(dispatches.len(), 2);
    let resumed = &dispatches[1].request.prompt;
    assert!(resumed.starts_with("explain tides"));
    assert!(resumed.contains(ASSIST_CONTEXT_HEADER));
    assert!(resumed.contains("[Intelligence via Intelligence Analyst] Tides follow the moon's gravity."));
    // The caller's capsule is never rewritten.
    assert_eq!(capsule.goal, "explain tides");
    assert_eq!(h.telemetry.count(EVENT_PASS_ASSIST), 1);
}

#[tokio::test]
async fn contradiction_gathers_from_mapped_resolvers_then_clears() {
    let h = harness(plenty()).await;
    h.backend.push_critiques(&["The reply says 5 but the arithmetic gives 4."]);
    let capsule = Capsule::task("c-22", "2+2").with_arbiter(true);

    let result = h.engine.submit(&capsule, &CancellationToken::new()).await;

    assert!(result.ok, "{:?}", result);
    let assists = h.backend.calls_of(CallKind::Assist);
    let backends: Vec<&str> = assists.iter().map(|a| a.request.backend_id.as_str()).collect();
    assert_eq!(backends, vec!["checker", "analyst"]);
    assert!(assists[0].request.prompt.contains("CRITIQUE"));
    assert!(assists[0].request.prompt.contains("arithmetic gives 4"));
    assert_eq!(h.backend.count(CallKind::Arbiter), 2);
}

#[tokio::test]
async fn resource_downgrade_asks_the_simplifier() {
    let h = harness(ResourceSnapshot::safe(4_000)).await;
    let capsule = Capsule::chat("c-big", "plan a strategy for next year");

    let result = h.engine.submit(&capsule, &CancellationToken::new()).await;

    // The simplifier fits; the strategist and the President never do.
    let assists = h.backend.calls_of(CallKind::Assist);
    assert!(!assists.is_empty());
    assert!(assists.iter().all(|a| a.request.backend_id == "tiny"));
    assert_eq!(result.failure, Some(FailureKind::DepthExceeded));
    assert_eq!(h.backend.count(CallKind::Dispatch), 0);
}

#[tokio::test]
async fn resolver_order_is_map_then_capability_then_cabinet() {
    let h = harness(plenty()).await;
    let broker = h.engine.broker();

    let cancel = CancellationToken::new();

    let mapped = broker.resolver_for(&Need::new("truth", "check it"), &cancel).await.unwrap();
    assert_eq!(mapped.title, "Fact Checker");

    let by_capability = broker.resolver_for(&Need::new("strategy", "plan it"), &cancel).await.unwrap();
    assert_eq!(by_capability.title, "Chief Strategist");

    let by_cabinet = broker.resolver_for(&Need::new("Reviewer", "simplify the wording"), &cancel).await.unwrap();
    assert_eq!(by_cabinet.title, "Simplifier");
}

#[tokio::test]
async fn cabinet_lookup_honours_cancellation() {
    let h = harness(plenty()).await;
    let broker = h.engine.broker();
    let cancel = CancellationToken::new();
    cancel.cancel();

    // Map and capability lookups never wait, so they still answer.
    let mapped = broker.resolver_for(&Need::new("truth", "check it"), &cancel).await.unwrap();
    assert_eq!(mapped.title, "Fact Checker");

    let err = broker
        .resolver_for(&Need::new("Reviewer", "simplify the wording"), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn cancellation_mid_dispatch_releases_load() {
    let h = harness(plenty()).await;
    h.backend.delay_dispatch(Duration::from_secs(10));
    let capsule = Capsule::chat("c-cancel", "explain tides");
    let cancel = CancellationToken::new();

    let (result, committed_while_running) = tokio::join!(h.engine.submit(&capsule, &cancel), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let committed = h.engine.load_balancer().total_committed_mb();
        cancel.cancel();
        committed
    });

    assert_eq!(committed_while_running, 4_700);
    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    assert!(!result.blocked);
    assert_eq!(h.engine.load_balancer().total_committed_mb(), 0);
}

#[tokio::test]
async fn cancelled_token_stops_resolution_before_assists() {
    let h = harness(plenty()).await;
    let capsule = Capsule::chat("c-pre", "explain tides");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h.engine.broker().resolve(&capsule, blocked_without_needs(&capsule), &cancel).await;

    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    assert!(h.backend.calls().is_empty());
}
