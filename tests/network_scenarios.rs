//! End-to-end coverage of the scenarios `spec.md` §8 calls out explicitly:
//! a public peer appearing, a private peer being filtered, latency
//! recording, a stale sweep, and restart-driven identity churn.

use std::net::Ipv4Addr;

use telemetry_server::interpreter::{interpret, InterpretOptions, LogRecord};
use telemetry_server::model::{NetworkModel, OpKind, LIVE_WINDOW_NS};
use telemetry_server::{cleanup, config::Config, moderation::{Classifier, LocalClassifier}, name_store::NameStore, state::AppState};
use serde_json::json;
use std::collections::HashMap;

fn record(event_type: &str, body: serde_json::Value, timestamp: i64) -> LogRecord {
    let mut attrs = HashMap::new();
    attrs.insert("event_type".to_owned(), json!(event_type));
    LogRecord { timestamp, attributes: attrs, body }
}

#[tokio::test]
async fn public_peer_connect_is_modeled_and_broadcastable() {
    let mut model = NetworkModel::new(vec![]);
    let body = json!({
        "this_peer": "A@203.0.113.5:4000 (@ 0.1)",
        "connected_peer": "B@198.51.100.9:4000 (@ 0.2)",
    });
    let outbound = interpret(&record("connect", body, 0), &mut model, InterpretOptions { store_history: true });
    assert!(outbound.is_some());
    assert_eq!(model.peers.len(), 2);
    assert_eq!(model.connections.len(), 1);
}

#[tokio::test]
async fn private_ip_peer_never_enters_the_model() {
    let mut model = NetworkModel::new(vec![]);
    let body = json!({
        "this_peer": "A@10.0.0.5:4000 (@ 0.1)",
        "connected_peer": "B@10.0.0.6:4000 (@ 0.2)",
    });
    let outbound = interpret(&record("connect", body, 0), &mut model, InterpretOptions { store_history: true });
    assert!(outbound.is_none());
    assert!(model.peers.is_empty());
}

#[tokio::test]
async fn restart_with_new_identity_clears_old_contract_state() {
    let mut model = NetworkModel::new(vec![]);
    let ip = Ipv4Addr::new(203, 0, 113, 9);
    model.record_peer(ip, Some("IDENTITY-1"), 0.1, 0);
    model.update_contract_state("contract-a", "IDENTITY-1", "hash1".to_owned(), 0, "put_success");

    // The peer restarts: its IP is observed again under a new identity.
    // The interpreter is responsible for calling cleanup_stale_peer_id
    // before re-registering; this test exercises the model contract
    // directly since the log-replay path is covered by the tailer tests.
    model.cleanup_stale_peer_id("IDENTITY-1");
    model.record_peer(ip, Some("IDENTITY-2"), 0.1, 1_000_000);

    assert!(!model.contract_states["contract-a"].contains_key("IDENTITY-1"));
    assert_eq!(model.identity_for_ip(ip), Some("IDENTITY-2"));
}

#[tokio::test]
async fn stale_peer_sweep_removes_peer_and_broadcasts_removal() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        log_path: dir.path().join("telemetry.jsonl"),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        name_map_path: dir.path().join("names.json"),
        gateway_ips: vec![],
        moderator_endpoint: None,
    };
    let name_store = NameStore::load(config.name_map_path.clone()).unwrap();
    let state = AppState::new(config, name_store, Classifier::Local(LocalClassifier));

    let ip = Ipv4Addr::new(203, 0, 113, 44);
    {
        let mut model = state.model.write().await;
        model.record_peer(ip, Some("OLD"), 0.1, 0);
    }

    let (_id, queue) = state.fanout.register_session().await;
    cleanup::sweep_once_at(&state, LIVE_WINDOW_NS * 10).await;

    let removal = tokio::time::timeout(std::time::Duration::from_secs(1), queue.pop())
        .await
        .expect("expected a removal broadcast");
    match removal {
        tn_protocol::WsMessage::PeersRemoved(msg) => {
            assert_eq!(msg.peer_ids, vec!["OLD".to_owned()]);
            assert_eq!(msg.peers, vec![telemetry_server::identity::anonymize_ip(ip)]);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    let model = state.model.read().await;
    assert!(model.peers.is_empty());
}

#[tokio::test]
async fn put_latency_is_recorded_between_request_and_success() {
    let mut model = NetworkModel::new(vec![]);
    let tx_id = "C".repeat(26);
    let request = record(
        "put_request",
        json!({"id": tx_id, "this_peer": "A@203.0.113.5:4000 (@ 0.1)", "contract_key": "contract-xyz"}),
        0,
    );
    interpret(&request, &mut model, InterpretOptions { store_history: true });

    let success = record(
        "put_success",
        json!({
            "id": tx_id,
            "this_peer": "A@203.0.113.5:4000 (@ 0.1)",
            "contract_key": "contract-xyz",
            "state_hash_after": "abc123",
        }),
        25_000_000,
    );
    interpret(&success, &mut model, InterpretOptions { store_history: true });

    let counter = &model.op_counters[&OpKind::Put];
    assert_eq!(counter.latencies.len(), 1);
    assert!((counter.latencies[0] - 25.0).abs() < 1e-9);
}
