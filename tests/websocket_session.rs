//! Integration tests driving the server the way a real dashboard would:
//! over a real TCP socket with `tn_test_utils::MockWsClient`. Mirrors the
//! teacher's `start_server` + `MockWsClient::connect` test shape.

use std::net::SocketAddr;

use telemetry_server::config::Config;
use telemetry_server::moderation::{Classifier, LocalClassifier};
use telemetry_server::name_store::NameStore;
use telemetry_server::state::AppState;
use tn_protocol::{ClientMessage, SetPeerName, WsMessage};
use tn_test_utils::MockWsClient;

async fn start_server() -> (AppState, SocketAddr) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        log_path: dir.path().join("telemetry.jsonl"),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        name_map_path: dir.path().join("names.json"),
        gateway_ips: vec!["5.9.111.215".parse().unwrap()],
        moderator_endpoint: None,
    };
    let name_store = NameStore::load(config.name_map_path.clone()).unwrap();
    let state = AppState::new(config, name_store, Classifier::Local(LocalClassifier));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = telemetry_server::http::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    // std::mem::forget the tempdir path lifetime concern: the dir must
    // outlive the server, so leak it for the duration of the test process.
    std::mem::forget(dir);
    (state, addr)
}

#[tokio::test]
async fn client_receives_state_then_history_on_connect() {
    let (_state, addr) = start_server().await;
    let mut client = MockWsClient::connect(&format!("ws://{addr}/ws")).await.unwrap();

    let first = client.recv().await.unwrap();
    assert!(matches!(first, WsMessage::State(_)));

    let second = client.recv().await.unwrap();
    assert!(matches!(second, WsMessage::History(_)));
}

#[tokio::test]
async fn set_peer_name_round_trips_to_rename_result_and_broadcast() {
    let (_state, addr) = start_server().await;
    let mut client = MockWsClient::connect(&format!("ws://{addr}/ws")).await.unwrap();
    let _state_msg = client.recv().await.unwrap();
    let _history_msg = client.recv().await.unwrap();

    client
        .send(&ClientMessage::SetPeerName(SetPeerName {
            name: "swift-fox".to_owned(),
        }))
        .await
        .unwrap();

    let mut saw_result = false;
    let mut saw_broadcast = false;
    for _ in 0..2 {
        match client.recv().await.unwrap() {
            WsMessage::NameSetResult(result) => {
                assert!(result.success);
                assert_eq!(result.name.as_deref(), Some("swift-fox"));
                saw_result = true;
            }
            WsMessage::PeerNameUpdate(update) => {
                assert_eq!(update.name, "swift-fox");
                saw_broadcast = true;
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert!(saw_result && saw_broadcast);
}

#[tokio::test]
async fn empty_peer_name_is_rejected() {
    let (_state, addr) = start_server().await;
    let mut client = MockWsClient::connect(&format!("ws://{addr}/ws")).await.unwrap();
    let _ = client.recv().await.unwrap();
    let _ = client.recv().await.unwrap();

    client
        .send(&ClientMessage::SetPeerName(SetPeerName { name: "   ".to_owned() }))
        .await
        .unwrap();

    match client.recv().await.unwrap() {
        WsMessage::NameSetResult(result) => {
            assert!(!result.success);
            assert!(result.error.is_some());
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (_state, addr) = start_server().await;
    let body = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

