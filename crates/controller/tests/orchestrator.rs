//! Intake loop behavior: dispatch, bad payloads, broker outages, shutdown

mod common;

use common::{completed_build_pod, ready_signal, Harness};
use launchpad_controller::Orchestrator;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wait (in virtual time) until `done` holds
async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_create_and_delete_intents_are_dispatched() {
    let h = Harness::new();
    h.provider.script_pods(vec![completed_build_pod("build-webdep-7-a1b2c")]);
    h.provider
        .signal_on_submit(h.queue.clone(), "status:web", ready_signal("web", "dep-7"));
    h.provider.seed_app("old");

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(h.ctx.clone());
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    h.queue.push_now(
        "create_queue",
        &json!({ "gitrepo": "https://example/web.git", "DepId": "dep-7", "appName": "web" })
            .to_string(),
    );
    h.queue.push_now(
        "delete_queue",
        &json!({ "userId": "u-1", "appname": "old", "force": true }).to_string(),
    );

    let provider = h.provider.clone();
    eventually(move || {
        provider.exists("route/web/web-route") && !provider.exists("namespace/old")
    })
    .await;

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_malformed_intent_is_reported_and_loop_continues() {
    let h = Harness::new();

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(h.ctx.clone());
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    h.queue.push_now("create_queue", "{not json");
    h.queue.push_now(
        "create_queue",
        &json!({ "gitrepo": "https://example/web.git", "DepId": "Dep 1!", "appName": "web" })
            .to_string(),
    );
    h.queue.push_now(
        "delete_queue",
        &json!({ "userId": "u-1", "appname": "gone", "force": true }).to_string(),
    );

    let provider = h.provider.clone();
    eventually(move || !provider.calls_of(&["delete_namespace"]).is_empty()).await;

    assert!(h
        .bus
        .lines("logs:web")
        .iter()
        .any(|line| line.starts_with("[SYSTEM] ❌ Request rejected")));
    assert!(h.provider.calls_of(&["submit_job"]).is_empty());

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_broker_outage_is_retried() {
    let h = Harness::new();
    h.queue.fail_pops(3);
    h.queue.push_now(
        "delete_queue",
        &json!({ "userId": "u-1", "appname": "demo", "force": true }).to_string(),
    );

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(h.ctx.clone());
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    let provider = h.provider.clone();
    eventually(move || !provider.calls_of(&["delete_namespace"]).is_empty()).await;

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_pipeline() {
    let h = Harness::new();
    h.provider.seed_app("demo");
    h.provider.delay("scale_workload", Duration::from_secs(5));

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(h.ctx.clone());
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    h.queue.push_now(
        "delete_queue",
        &json!({ "userId": "u-1", "appname": "demo", "force": false }).to_string(),
    );
    let provider = h.provider.clone();
    eventually(move || !provider.calls_of(&["scale_workload"]).is_empty()).await;

    shutdown.cancel();
    running.await.unwrap();

    // Drained, not abandoned
    assert!(!h.provider.exists("namespace/demo"));
}

#[tokio::test(start_paused = true)]
async fn test_create_payload_on_delete_queue_deletes_nothing() {
    let h = Harness::new();
    h.provider.seed_app("demo");
    h.provider.seed_app("old");

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(h.ctx.clone());
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    h.queue.push_now(
        "delete_queue",
        &json!({ "gitrepo": "https://example/demo.git", "DepId": "dep-1", "appName": "demo" })
            .to_string(),
    );
    h.queue.push_now(
        "delete_queue",
        &json!({ "userId": "u-1", "appname": "old", "force": true }).to_string(),
    );

    let provider = h.provider.clone();
    eventually(move || !provider.exists("namespace/old")).await;

    assert!(h.provider.calls().iter().all(|call| !call.contains("demo")));
    assert!(h.provider.exists("namespace/demo"));
    assert!(h.provider.exists("workload/demo/demo"));
    assert!(h
        .bus
        .lines("logs:demo")
        .iter()
        .any(|line| line.starts_with("[SYSTEM] ❌ Request rejected")));

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_pipeline_leaves_intake_running() {
    let h = Harness::new();
    h.provider.seed_app("boom");
    h.provider.seed_app("old");
    h.provider.panic_on("scale_workload");

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(h.ctx.clone());
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    // Graceful delete scales first and hits the panic
    h.queue.push_now(
        "delete_queue",
        &json!({ "userId": "u-1", "appname": "boom", "force": false }).to_string(),
    );
    let bus = h.bus.clone();
    eventually(move || {
        bus.lines("logs:boom")
            .iter()
            .any(|line| line.starts_with("[SYSTEM] ❌ Internal error while processing delete"))
    })
    .await;

    h.queue.push_now(
        "delete_queue",
        &json!({ "userId": "u-1", "appname": "old", "force": true }).to_string(),
    );
    let provider = h.provider.clone();
    eventually(move || !provider.exists("namespace/old")).await;

    assert!(h.provider.exists("namespace/boom"));

    shutdown.cancel();
    running.await.unwrap();
}
