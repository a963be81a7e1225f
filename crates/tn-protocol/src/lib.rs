//! tn-protocol: wire types for the telemetry aggregator's WebSocket protocol.
//!
//! Every server -> client message carries a top-level `type` discriminant
//! (`WsMessage`); every client -> server control message carries the same
//! shape (`ClientMessage`). Field names and nesting mirror the JSON
//! documented in the system's external-interface table exactly, since the
//! dashboard consuming this protocol is not under our control.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// A single peer as exposed in a `state` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerView {
    pub id: String,
    pub ip_hash: String,
    pub location: f64,
    pub neighbors: Vec<String>,
    pub last_seen: i64,
    pub identity: Option<String>,
    pub is_gateway: bool,
}

/// An undirected connection, rendered as a two-element anonymous-id pair.
pub type ConnectionPair = (String, String);

/// Per-(contract, peer) seeding record as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedingView {
    pub peer_id: String,
    pub is_seeding: bool,
    pub upstream: Option<String>,
    pub downstream: Vec<String>,
    pub downstream_count: u32,
}

/// Subscription tree for one contract, as exposed in a `state` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub short_key: String,
    pub subscribers: Vec<String>,
    /// sender peer-id -> target peer-ids
    pub tree: HashMap<String, Vec<String>>,
    pub seeding: Vec<SeedingView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutStats {
    pub total: u64,
    pub success_rate: Option<f64>,
    pub latency: LatencyPercentiles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetStats {
    pub total: u64,
    pub success_rate: Option<f64>,
    pub not_found: u64,
    pub latency: LatencyPercentiles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStats {
    pub total: u64,
    pub success_rate: Option<f64>,
    pub broadcasts: u64,
    pub latency: LatencyPercentiles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeStats {
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpStats {
    pub put: PutStats,
    pub get: GetStats,
    pub update: UpdateStats,
    pub subscribe: SubscribeStats,
}

/// Lifecycle record for one telemetry identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLifecycleView {
    pub identity: String,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub is_gateway: bool,
    pub startup_time: i64,
    pub shutdown_time: Option<i64>,
    pub graceful_shutdown: Option<bool>,
    pub shutdown_reason: Option<String>,
}

/// A transport-layer transfer completion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub timestamp: i64,
    pub peer_id: String,
    pub direction: String,
    pub bytes: u64,
    pub throughput_bps: f64,
    pub window: u64,
    pub rtt_ms: f64,
    pub slowdowns: u32,
    pub timeouts: u32,
}

/// Currently-tracked propagation state for one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationView {
    pub short_key: String,
    pub current_hash: Option<String>,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
    pub peer_count: usize,
    pub previous_propagation_ms: Option<f64>,
}

/// One event in a transaction's ordered lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub timestamp: i64,
    pub event_type: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionView {
    pub tx_id: String,
    pub op: String,
    pub contract: Option<String>,
    pub contract_full: Option<String>,
    pub start_ns: i64,
    pub end_ns: i64,
    pub duration_ms: Option<f64>,
    pub status: String,
    pub events: Vec<TransactionEvent>,
}

/// A single outbound event, as pushed individually or batched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub timestamp: i64,
    pub event_type: String,
    pub peer_id: String,
    pub peer_ip_hash: String,
    pub location: Option<f64>,
    pub time_str: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_peer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_location: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_location: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnection: Option<ConnectionPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_full: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresenceView {
    pub identity: String,
    pub ip_hash: String,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Server -> client messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub peers: Vec<PeerView>,
    pub connections: Vec<ConnectionPair>,
    pub subscriptions: HashMap<String, SubscriptionView>,
    pub op_stats: OpStats,
    pub peer_lifecycle: Vec<PeerLifecycleView>,
    pub peer_names: HashMap<String, String>,
    pub transfers: Vec<TransferEvent>,
    pub propagation: HashMap<String, PropagationView>,
    pub your_ip_hash: String,
    pub your_peer_id: String,
    pub gateway_peer_id: String,
    pub gateway_ip_hash: String,
    pub you_are_peer: bool,
    pub your_name: Option<String>,
    pub priority_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub events: Vec<OutboundEvent>,
    pub transactions: Vec<TransactionView>,
    pub peer_presence: Vec<PeerPresenceView>,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatchMessage {
    pub events: Vec<OutboundEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeersRemovedMessage {
    pub peers: Vec<String>,
    pub peer_ids: Vec<String>,
    pub connections: Vec<ConnectionPair>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerNameUpdateMessage {
    pub ip_hash: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameSetResultMessage {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    State(StateMessage),
    History(HistoryMessage),
    Event(OutboundEvent),
    EventBatch(EventBatchMessage),
    PeersRemoved(PeersRemovedMessage),
    PeerNameUpdate(PeerNameUpdateMessage),
    NameSetResult(NameSetResultMessage),
}

// ---------------------------------------------------------------------------
// Client -> server messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPeerName {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SetPeerName(SetPeerName),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_message_serializes_with_type_tag() {
        let msg = WsMessage::PeerNameUpdate(PeerNameUpdateMessage {
            ip_hash: "abc123".to_owned(),
            name: "gardener".to_owned(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "peer_name_update");
        assert_eq!(json["ip_hash"], "abc123");
    }

    #[test]
    fn client_message_round_trips() {
        let raw = r#"{"type":"set_peer_name","name":"swift-fox"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SetPeerName(SetPeerName {
                name: "swift-fox".to_owned()
            })
        );
    }

    #[test]
    fn name_set_result_omits_absent_fields() {
        let msg = NameSetResultMessage {
            success: true,
            name: Some("x".to_owned()),
            error: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("error").is_none());
    }
}
