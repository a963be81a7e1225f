//! Turns one parsed telemetry record into network-model mutations and, when
//! the record is externally interesting, an [`OutboundEvent`] to broadcast.
//!
//! Mirrors the event-kind dispatch of the reference telemetry dashboard this
//! system replaces, extended with the contract-state, propagation, transfer,
//! and lifecycle tracking `spec.md` §4.1 adds on top of it.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde_json::Value;
use tn_protocol::OutboundEvent;

use crate::identity::{anonymize_ip, is_public_ip, parse_peer_string};
use crate::model::{HistoryEntry, NetworkModel, OpKind, TransactionStatus};

/// A single decoded `logRecords[]` entry, already lifted out of the OTEL
/// envelope by the tailer.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: i64,
    pub attributes: HashMap<String, Value>,
    pub body: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct InterpretOptions {
    pub store_history: bool,
}

/// Null transaction id sentinel emitted by telemetry producers that haven't
/// allocated a real one yet.
const NULL_TX_ID: &str = "00000000000000000000000000";

fn time_str(timestamp_ns: i64) -> String {
    let secs = timestamp_ns.div_euclid(1_000_000_000);
    let dt = chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default();
    dt.format("%H:%M:%S").to_string()
}

fn truncate_contract(key: &str) -> String {
    if key.len() > 12 {
        format!("{}...", &key[..12])
    } else {
        key.to_owned()
    }
}

fn str_attr<'a>(attrs: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    attrs.get(key).and_then(Value::as_str)
}

fn body_str<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

/// Probes a set of body fields, in order, for a `peer@ip:port (@loc)`
/// string whose IP is public. First match wins.
fn probe_other_peer(body: &Value) -> Option<(String, Ipv4Addr, f64)> {
    for field in ["connected_peer", "target", "requester", "subscriber", "upstream"] {
        if let Some(raw) = body_str(body, field) {
            if let Some(parts) = parse_peer_string(raw) {
                if is_public_ip(parts.ip) {
                    return Some((parts.peer_id, parts.ip, parts.location));
                }
            }
        }
    }
    None
}

fn this_peer(body: &Value) -> Option<(String, Ipv4Addr, f64)> {
    let raw = body_str(body, "this_peer")?;
    let parts = parse_peer_string(raw)?;
    Some((parts.peer_id, parts.ip, parts.location))
}

/// Address-only fields that update a known peer's last-seen without
/// carrying enough information (no port/location) to create a new record.
const ADDR_ONLY_FIELDS: [&str; 6] = [
    "from_addr",
    "to_addr",
    "peer_addr",
    "this_peer_addr",
    "from_peer_addr",
    "connected_peer_addr",
];

fn addr_field(body: &Value, field: &str) -> Option<Ipv4Addr> {
    body_str(body, field)?.parse().ok()
}

fn touch_peers_from_addr_fields(body: &Value, model: &mut NetworkModel, timestamp: i64) {
    for field in ADDR_ONLY_FIELDS {
        if let Some(ip) = addr_field(body, field) {
            model.touch_peer(ip, timestamp);
        }
    }
}

/// Event kinds that are broadcast live but never retained in the history
/// buffer: high frequency, low archival value.
fn is_history_eligible(event_type: &str) -> bool {
    !matches!(event_type, "transfer_progress" | "keepalive" | "heartbeat")
}

pub fn interpret(
    record: &LogRecord,
    model: &mut NetworkModel,
    opts: InterpretOptions,
) -> Option<OutboundEvent> {
    let event_type = str_attr(&record.attributes, "event_type")
        .map(str::to_owned)
        .or_else(|| body_str(&record.body, "type").map(str::to_owned))
        .unwrap_or_default();
    if event_type.is_empty() {
        return None;
    }

    let tx_id = body_str(&record.body, "id")
        .or_else(|| str_attr(&record.attributes, "transaction_id"))
        .filter(|id| *id != NULL_TX_ID)
        .map(str::to_owned);

    let contract_key = body_str(&record.body, "contract_key")
        .or_else(|| body_str(&record.body, "key"))
        .map(str::to_owned);

    let timestamp = record.timestamp;

    // Peer lifecycle and transfer events carry their own identity/ip shape,
    // update the model, and never produce a broadcastable event of their
    // own: clients observe them through the `state`/`history` snapshots.
    if handle_lifecycle(&event_type, &record.body, model, timestamp) {
        return None;
    }
    if handle_transfer(&event_type, &record.body, model, timestamp) {
        return None;
    }

    touch_peers_from_addr_fields(&record.body, model, timestamp);

    let this = this_peer(&record.body);
    let other = probe_other_peer(&record.body);

    if let Some((identity, ip, location)) = &this {
        if is_public_ip(*ip) {
            model.record_peer(*ip, Some(identity), *location, timestamp);
        }
    }
    if let Some((_, ip, location)) = &other {
        if is_public_ip(*ip) {
            model.touch_peer(*ip, timestamp);
            if !model.peers.contains_key(ip) {
                model.record_peer(*ip, None, *location, timestamp);
            }
        }
    }

    let (this_ip, this_public) = this
        .as_ref()
        .map(|(_, ip, _)| (Some(*ip), is_public_ip(*ip)))
        .unwrap_or((None, false));
    let (other_ip, other_public) = other
        .as_ref()
        .map(|(_, ip, _)| (Some(*ip), is_public_ip(*ip)))
        .unwrap_or((None, false));

    match event_type.as_str() {
        "connect" | "connected" | "connect_connected" => {
            if let (Some(a), true, Some(b), true) = (this_ip, this_public, other_ip, other_public) {
                model.record_edge(a, b);
            }
        }
        "disconnect" => {
            if let (Some(a), true) = (this_ip, this_public) {
                if let Some(b) = addr_field(&record.body, "from_peer_addr").filter(|ip| is_public_ip(*ip)) {
                    model.remove_edge(a, b);
                }
            }
        }
        _ => {}
    }

    if let Some(key) = &contract_key {
        handle_subscription_and_state(&event_type, key, &record.body, model, &this, timestamp);
    }

    if let Some(op) = OpKind::from_prefix(&event_type) {
        handle_op_lifecycle(&event_type, op, tx_id.as_deref(), contract_key.as_deref(), model, timestamp, &this);
    }

    // display peer: prefer this_ip if public, else other_ip if public.
    let (display_ip, display_loc) = if this_public {
        (this_ip, this.as_ref().map(|(_, _, l)| *l))
    } else if other_public {
        (other_ip, other.as_ref().map(|(_, _, l)| *l))
    } else {
        (None, None)
    };
    let Some(display_ip) = display_ip else {
        return None;
    };

    let outbound = OutboundEvent {
        timestamp,
        event_type: event_type.clone(),
        peer_id: anonymize_ip(display_ip),
        peer_ip_hash: model
            .peers
            .get(&display_ip)
            .map(|p| p.self_id_hash.clone())
            .unwrap_or_default(),
        location: display_loc,
        time_str: time_str(timestamp),
        from_peer: other_public.then(|| anonymize_ip(other_ip.unwrap())),
        from_location: other.as_ref().map(|(_, _, l)| *l).filter(|_| other_public),
        to_peer: this_public.then(|| anonymize_ip(this_ip.unwrap())),
        to_location: this.as_ref().map(|(_, _, l)| *l).filter(|_| this_public),
        connection: (matches!(event_type.as_str(), "connect" | "connected")
            && this_public
            && other_public)
            .then(|| (anonymize_ip(this_ip.unwrap()), anonymize_ip(other_ip.unwrap()))),
        disconnection: (matches!(event_type.as_str(), "disconnect" | "disconnected")
            && this_public
            && other_public)
            .then(|| (anonymize_ip(this_ip.unwrap()), anonymize_ip(other_ip.unwrap()))),
        contract: contract_key.clone(),
        contract_full: contract_key.as_deref().map(truncate_contract),
        state_hash: None,
        tx_id: tx_id.clone(),
    };

    if let Some(tx_id) = &tx_id {
        if let Some(op) = OpKind::from_prefix(&event_type) {
            let (is_terminal, status) = terminal_status(&event_type);
            model.accrue_transaction(
                tx_id,
                op,
                &event_type,
                timestamp,
                &outbound.peer_id,
                contract_key.as_deref(),
                is_terminal,
                status,
            );
        }
    }

    finish(outbound, model, opts, &event_type, timestamp)
}

fn finish(
    outbound: OutboundEvent,
    model: &mut NetworkModel,
    opts: InterpretOptions,
    event_type: &str,
    timestamp: i64,
) -> Option<OutboundEvent> {
    if opts.store_history && is_history_eligible(event_type) {
        model.push_history(HistoryEntry {
            timestamp,
            event_type: outbound.event_type.clone(),
            peer_id: outbound.peer_id.clone(),
            peer_ip_hash: outbound.peer_ip_hash.clone(),
            location: outbound.location,
            time_str: outbound.time_str.clone(),
            from_peer: outbound.from_peer.clone(),
            from_location: outbound.from_location,
            to_peer: outbound.to_peer.clone(),
            to_location: outbound.to_location,
            connection: outbound.connection.clone(),
            disconnection: outbound.disconnection.clone(),
            contract_full: outbound.contract_full.clone(),
            state_hash: outbound.state_hash.clone(),
            tx_id: outbound.tx_id.clone(),
        });
    }
    Some(outbound)
}

fn terminal_status(event_type: &str) -> (bool, TransactionStatus) {
    match event_type {
        "put_success" | "update_success" | "subscribed" => (true, TransactionStatus::Success),
        "get_success" => (true, TransactionStatus::Success),
        "get_not_found" => (true, TransactionStatus::NotFound),
        "put_request" | "get_request" | "update_request" | "subscribe_request" => {
            (false, TransactionStatus::Pending)
        }
        _ => (false, TransactionStatus::Pending),
    }
}

fn handle_op_lifecycle(
    event_type: &str,
    op: OpKind,
    tx_id: Option<&str>,
    contract_key: Option<&str>,
    model: &mut NetworkModel,
    timestamp: i64,
    this: &Option<(String, Ipv4Addr, f64)>,
) {
    let _ = (contract_key, this);
    match event_type {
        "put_request" | "get_request" | "update_request" | "subscribe_request" => {
            model.record_request(op, tx_id, timestamp);
        }
        "put_success" | "update_success" | "get_success" | "subscribed" => {
            model.record_success(op, tx_id, timestamp);
        }
        "get_not_found" => {
            model.record_not_found(tx_id);
        }
        "broadcast_emitted" | "update_broadcast_emitted" => {
            model.record_broadcast_emitted();
        }
        _ => {}
    }
}

fn handle_subscription_and_state(
    event_type: &str,
    contract_key: &str,
    body: &Value,
    model: &mut NetworkModel,
    this: &Option<(String, Ipv4Addr, f64)>,
    timestamp: i64,
) {
    let this_id = this.as_ref().map(|(id, _, _)| id.clone());

    if let Some(broadcast_to) = body.get("broadcast_to").and_then(Value::as_array) {
        let sender = body_str(body, "sender").map(str::to_owned).or(this_id.clone());
        if let Some(sender) = sender {
            let sender_anon = anonymize_for_identity(model, &sender);
            let targets: Vec<String> = broadcast_to
                .iter()
                .filter_map(Value::as_str)
                .map(|t| anonymize_for_identity(model, t))
                .collect();
            let sub = model.subscription_mut(contract_key);
            let entry = sub.tree.entry(sender_anon).or_default();
            for t in targets {
                entry.insert(t);
            }
        }
    }

    // Contract-state hash updates: six triggering kinds, `*_after` preferred
    // over `*_before`/`state_hash` when both are present, and
    // `update_broadcast_applied` wins over `update_broadcast_received` since
    // it reflects the post-merge state rather than the pre-merge one.
    if matches!(
        event_type,
        "put_success"
            | "get_success"
            | "update_success"
            | "broadcast_emitted"
            | "update_broadcast_received"
            | "update_broadcast_applied"
    ) {
        if let Some(hash) = body
            .get("state_hash_after")
            .and_then(Value::as_str)
            .or_else(|| body.get("state_hash").and_then(Value::as_str))
        {
            if let Some(id) = &this_id {
                model.update_contract_state(contract_key, id, hash.to_owned(), timestamp, event_type);
            }
        }
    }

    // Propagation tracks state *spreading*: only the three update-family
    // kinds, never plain put/get traffic.
    if matches!(
        event_type,
        "update_success" | "update_broadcast_applied" | "update_broadcast_emitted"
    ) {
        if let Some(hash) = body
            .get("state_hash_after")
            .and_then(Value::as_str)
            .or_else(|| body.get("state_hash").and_then(Value::as_str))
        {
            if let Some(id) = &this_id {
                let anon = anonymize_for_identity(model, id);
                model.track_propagation(contract_key, &anon, hash, timestamp);
            }
        }
    }

    if matches!(event_type, "subscribed" | "subscribe_success") {
        if let Some(id) = &this_id {
            let anon = anonymize_for_identity(model, id);
            model.subscription_mut(contract_key).subscribers.insert(anon);
        }
    }

    match event_type {
        "seeding_started" => {
            if let Some(id) = &this_id {
                model.seeding_mut(contract_key, id).is_seeding = true;
            }
        }
        "seeding_stopped" => {
            if let Some(id) = &this_id {
                model.seeding_mut(contract_key, id).is_seeding = false;
            }
        }
        "upstream_set" => {
            if let Some(id) = &this_id {
                let upstream = body_str(body, "upstream").map(str::to_owned);
                model.seeding_mut(contract_key, id).upstream = upstream;
            }
        }
        "downstream_added" => {
            if let Some(id) = &this_id {
                if let Some(downstream) = body_str(body, "downstream") {
                    let downstream = downstream.to_owned();
                    let state = model.seeding_mut(contract_key, id);
                    if !state.downstream.contains(&downstream) {
                        state.downstream.push(downstream);
                    }
                    state.downstream_count = state.downstream.len() as u32;
                }
            }
        }
        "downstream_removed" => {
            if let Some(id) = &this_id {
                if let Some(downstream) = body_str(body, "downstream") {
                    let state = model.seeding_mut(contract_key, id);
                    state.downstream.retain(|d| d != downstream);
                    state.downstream_count = state.downstream.len() as u32;
                }
            }
        }
        "unsubscribed" => {
            if let Some(id) = &this_id {
                let anon = anonymize_for_identity(model, id);
                model.subscription_mut(contract_key).subscribers.remove(&anon);
                model.subscription_mut(contract_key).seeding.remove(id);
            }
        }
        "subscription_state" => {
            if let Some(id) = &this_id {
                let state = model.seeding_mut(contract_key, id);
                if let Some(is_seeding) = body.get("is_seeding").and_then(Value::as_bool) {
                    state.is_seeding = is_seeding;
                }
                if let Some(upstream) = body_str(body, "upstream") {
                    state.upstream = Some(upstream.to_owned());
                }
                if let Some(downstream) = body.get("downstream").and_then(Value::as_array) {
                    state.downstream = downstream.iter().filter_map(Value::as_str).map(str::to_owned).collect();
                    state.downstream_count = state.downstream.len() as u32;
                }
            }
        }
        _ => {}
    }
}

fn anonymize_for_identity(model: &NetworkModel, identity: &str) -> String {
    model
        .identity_to_ip
        .get(identity)
        .map(|ip| anonymize_ip(*ip))
        .unwrap_or_else(|| identity.to_owned())
}

/// Returns `true` if this record was a lifecycle event (handled, whether or
/// not it carried a usable identity field).
fn handle_lifecycle(event_type: &str, body: &Value, model: &mut NetworkModel, timestamp: i64) -> bool {
    match event_type {
        "peer_started" | "startup" => {
            let Some(identity) = body_str(body, "identity") else {
                return true;
            };
            let identity = identity.to_owned();
            let record = model.lifecycle_mut(&identity);
            record.version = body_str(body, "version").map(str::to_owned);
            record.arch = body_str(body, "arch").map(str::to_owned);
            record.os = body_str(body, "os").map(str::to_owned);
            record.os_version = body_str(body, "os_version").map(str::to_owned);
            record.startup_time = timestamp;
            record.shutdown_time = None;
            true
        }
        "peer_shutdown" | "shutdown" => {
            let Some(identity) = body_str(body, "identity") else {
                return true;
            };
            let identity = identity.to_owned();
            let graceful = body.get("graceful").and_then(Value::as_bool);
            let reason = body_str(body, "reason").map(str::to_owned);
            let record = model.lifecycle_mut(&identity);
            record.shutdown_time = Some(timestamp);
            record.graceful_shutdown = graceful;
            record.shutdown_reason = reason;
            true
        }
        _ => false,
    }
}

/// Returns `true` if this record was a transfer-progress event.
fn handle_transfer(event_type: &str, body: &Value, model: &mut NetworkModel, timestamp: i64) -> bool {
    if event_type != "transfer_progress" {
        return false;
    }
    let Some(identity) = body_str(body, "identity") else {
        return true;
    };
    model.push_transfer(crate::model::TransferRecord {
        timestamp,
        identity: identity.to_owned(),
        direction: body_str(body, "direction").unwrap_or("unknown").to_owned(),
        bytes: body.get("bytes").and_then(Value::as_u64).unwrap_or(0),
        throughput_bps: body.get("throughput_bps").and_then(Value::as_f64).unwrap_or(0.0),
        window: body.get("window").and_then(Value::as_u64).unwrap_or(0),
        rtt_ms: body.get("rtt_ms").and_then(Value::as_f64).unwrap_or(0.0),
        slowdowns: body.get("slowdowns").and_then(Value::as_u64).unwrap_or(0) as u32,
        timeouts: body.get("timeouts").and_then(Value::as_u64).unwrap_or(0) as u32,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(event_type: &str, body: Value, timestamp: i64) -> LogRecord {
        let mut attrs = HashMap::new();
        attrs.insert("event_type".to_owned(), json!(event_type));
        LogRecord { timestamp, attributes: attrs, body }
    }

    #[test]
    fn connect_records_edge_between_public_peers() {
        let mut model = NetworkModel::new(vec![]);
        let body = json!({
            "this_peer": "A@1.2.3.4:4000 (@ 0.1)",
            "connected_peer": "B@5.6.7.8:4000 (@ 0.2)",
        });
        let rec = record("connect", body, 1_000_000_000);
        let outbound = interpret(&rec, &mut model, InterpretOptions { store_history: true });
        assert!(outbound.is_some());
        assert_eq!(model.connections.len(), 1);
    }

    #[test]
    fn private_other_peer_is_not_modeled() {
        let mut model = NetworkModel::new(vec![]);
        let body = json!({
            "this_peer": "A@1.2.3.4:4000 (@ 0.1)",
            "connected_peer": "B@192.168.1.5:4000 (@ 0.2)",
        });
        let rec = record("connect", body, 1_000_000_000);
        interpret(&rec, &mut model, InterpretOptions { store_history: true });
        assert!(model.connections.is_empty());
        assert_eq!(model.peers.len(), 1);
    }

    #[test]
    fn put_request_then_success_records_latency() {
        let mut model = NetworkModel::new(vec![]);
        let tx_id = "A".repeat(26);
        let req_body = json!({
            "id": tx_id,
            "this_peer": "A@1.2.3.4:4000 (@ 0.1)",
            "contract_key": "contractABCDEFGH1234",
        });
        let req = record("put_request", req_body, 0);
        interpret(&req, &mut model, InterpretOptions { store_history: true });

        let ok_body = json!({
            "id": tx_id,
            "this_peer": "A@1.2.3.4:4000 (@ 0.1)",
            "contract_key": "contractABCDEFGH1234",
            "state_hash_after": "deadbeef",
        });
        let ok = record("put_success", ok_body, 50_000_000);
        let outbound = interpret(&ok, &mut model, InterpretOptions { store_history: true });
        assert!(outbound.is_some());

        let counter = &model.op_counters[&OpKind::Put];
        assert_eq!(counter.requests, 1);
        assert_eq!(counter.successes, 1);
        assert_eq!(counter.latencies.len(), 1);
        assert!((counter.latencies[0] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn get_not_found_increments_not_found_counter_without_latency() {
        let mut model = NetworkModel::new(vec![]);
        let tx_id = "B".repeat(26);
        let req = record(
            "get_request",
            json!({"id": tx_id, "this_peer": "A@1.2.3.4:4000 (@ 0.1)"}),
            0,
        );
        interpret(&req, &mut model, InterpretOptions { store_history: true });
        let nf = record(
            "get_not_found",
            json!({"id": tx_id, "this_peer": "A@1.2.3.4:4000 (@ 0.1)"}),
            1_000_000,
        );
        interpret(&nf, &mut model, InterpretOptions { store_history: true });

        let counter = &model.op_counters[&OpKind::Get];
        assert_eq!(counter.not_found, 1);
        assert!(counter.latencies.is_empty());
    }

    #[test]
    fn null_transaction_id_is_ignored() {
        let mut model = NetworkModel::new(vec![]);
        let body = json!({
            "id": "00000000000000000000000000",
            "this_peer": "A@1.2.3.4:4000 (@ 0.1)",
        });
        let rec = record("put_request", body, 0);
        interpret(&rec, &mut model, InterpretOptions { store_history: true });
        assert!(model.pending_ops.is_empty());
    }

    #[test]
    fn lifecycle_startup_then_shutdown_marks_inactive() {
        let mut model = NetworkModel::new(vec![]);
        let up = record("peer_started", json!({"identity": "ID1", "version": "0.9"}), 0);
        interpret(&up, &mut model, InterpretOptions { store_history: true });
        assert!(model.lifecycle["ID1"].shutdown_time.is_none());

        let down = record(
            "peer_shutdown",
            json!({"identity": "ID1", "graceful": true, "reason": "sigterm"}),
            500,
        );
        interpret(&down, &mut model, InterpretOptions { store_history: true });
        assert_eq!(model.lifecycle["ID1"].shutdown_time, Some(500));
        assert_eq!(model.lifecycle["ID1"].graceful_shutdown, Some(true));
    }

    #[test]
    fn history_is_not_stored_when_disabled() {
        let mut model = NetworkModel::new(vec![]);
        let body = json!({
            "this_peer": "A@1.2.3.4:4000 (@ 0.1)",
            "connected_peer": "B@5.6.7.8:4000 (@ 0.2)",
        });
        let rec = record("connect", body, 0);
        interpret(&rec, &mut model, InterpretOptions { store_history: false });
        assert!(model.event_history.is_empty());
    }
}
