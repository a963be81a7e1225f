//! Builds the wire-level snapshots (`state`, `history`) from the live
//! [`NetworkModel`]. Kept separate from `model.rs` so the model itself has
//! no dependency on the wire protocol crate.

use std::collections::{HashMap, HashSet};

use tn_protocol::{
    GetStats, HistoryMessage, LatencyPercentiles, OpStats, PeerLifecycleView, PeerPresenceView,
    PeerView, PropagationView, PutStats, SeedingView, StateMessage, SubscribeStats,
    SubscriptionView, TimeRange, TransactionEvent, TransactionView, TransferEvent, UpdateStats,
};

use crate::identity::{anonymize_ip, self_id_hash};
use crate::model::{
    LifecycleRecord, NetworkModel, OpKind, CONTRACT_SNAPSHOT_CAP, HISTORY_INITIAL_SEND,
    LIFECYCLE_SNAPSHOT_CAP, NEIGHBOR_OUTPUT_CAP, TRANSACTION_INITIAL_SEND,
};

fn latency_view(counter: &crate::model::OpCounter) -> LatencyPercentiles {
    let (p50, p95, p99) = counter.percentiles();
    LatencyPercentiles { p50, p95, p99 }
}

fn success_rate(successes: u64, total: u64) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some((successes as f64 / total as f64 * 100.0 * 10.0).round() / 10.0)
    }
}

fn short_key(key: &str) -> String {
    if key.len() > 12 {
        format!("{}...", &key[..12])
    } else {
        key.to_owned()
    }
}

pub fn build_op_stats(model: &NetworkModel) -> OpStats {
    let empty = crate::model::OpCounter::default();
    let put = model.op_counters.get(&OpKind::Put).unwrap_or(&empty);
    let get = model.op_counters.get(&OpKind::Get).unwrap_or(&empty);
    let update = model.op_counters.get(&OpKind::Update).unwrap_or(&empty);
    let subscribe = model.op_counters.get(&OpKind::Subscribe).unwrap_or(&empty);

    OpStats {
        put: PutStats {
            total: put.requests,
            success_rate: success_rate(put.successes, put.requests),
            latency: latency_view(put),
        },
        get: GetStats {
            // The reference implementation counts a get as "total" when
            // either a request was seen or a success landed without one,
            // so unmatched successes aren't silently dropped from the rate.
            total: get.requests + get.successes,
            success_rate: success_rate(get.successes, get.requests + get.successes),
            not_found: get.not_found,
            latency: latency_view(get),
        },
        update: UpdateStats {
            total: update.requests,
            success_rate: success_rate(update.successes, update.requests),
            broadcasts: update.broadcasts,
            latency: latency_view(update),
        },
        subscribe: SubscribeStats {
            total: subscribe.successes,
        },
    }
}

/// Anonymous ids of peers currently within the live window, used by every
/// snapshot builder below to filter to `get_network_state()`'s "only live
/// peers" contract (`spec.md` §4.2).
fn live_anon_ids(model: &NetworkModel, now: i64) -> HashSet<String> {
    model
        .peers
        .values()
        .filter(|p| p.is_live(now))
        .map(|p| p.anon_id.clone())
        .collect()
}

pub fn build_peer_views(model: &NetworkModel, now: i64) -> Vec<PeerView> {
    model
        .peers
        .values()
        .filter(|peer| peer.is_live(now))
        .map(|peer| {
            let mut neighbors: Vec<String> =
                peer.neighbors.iter().map(|ip| anonymize_ip(*ip)).collect();
            neighbors.sort_unstable();
            neighbors.truncate(NEIGHBOR_OUTPUT_CAP);
            PeerView {
                id: peer.anon_id.clone(),
                ip_hash: peer.self_id_hash.clone(),
                location: peer.location,
                neighbors,
                last_seen: peer.last_seen,
                identity: peer.identity.clone(),
                is_gateway: model.is_gateway(peer.ip),
            }
        })
        .collect()
}

pub fn build_connection_pairs(model: &NetworkModel, now: i64) -> Vec<(String, String)> {
    model
        .connections
        .iter()
        .filter(|(a, b)| {
            model.peers.get(a).is_some_and(|p| p.is_live(now))
                && model.peers.get(b).is_some_and(|p| p.is_live(now))
        })
        .map(|(a, b)| (anonymize_ip(*a), anonymize_ip(*b)))
        .collect()
}

pub fn build_subscription_views(model: &NetworkModel, now: i64) -> HashMap<String, SubscriptionView> {
    let live = live_anon_ids(model, now);

    let mut ranked: Vec<(&String, &crate::model::Subscription, usize)> = model
        .subscriptions
        .iter()
        .filter(|(_, sub)| !sub.subscribers.is_empty() || !sub.tree.is_empty())
        .map(|(key, sub)| {
            let active = sub.subscribers.iter().filter(|id| live.contains(*id)).count();
            (key, sub, active)
        })
        .collect();
    ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(b.0)));

    ranked
        .into_iter()
        .take(CONTRACT_SNAPSHOT_CAP)
        .map(|(key, sub, _)| {
            let tree = sub
                .tree
                .iter()
                .map(|(from, targets)| (from.clone(), targets.iter().cloned().collect()))
                .collect();
            let seeding = sub
                .seeding
                .iter()
                .map(|(identity, state)| SeedingView {
                    peer_id: model
                        .identity_to_ip
                        .get(identity)
                        .map(|ip| anonymize_ip(*ip))
                        .unwrap_or_else(|| identity.clone()),
                    is_seeding: state.is_seeding,
                    upstream: state.upstream.clone(),
                    downstream: state.downstream.clone(),
                    downstream_count: state.downstream_count,
                })
                .collect();
            (
                key.clone(),
                SubscriptionView {
                    short_key: short_key(key),
                    subscribers: sub.subscribers.iter().cloned().collect(),
                    tree,
                    seeding,
                },
            )
        })
        .collect()
}

fn lifecycle_view(model: &NetworkModel, record: &LifecycleRecord) -> PeerLifecycleView {
    PeerLifecycleView {
        identity: record.identity.clone(),
        version: record.version.clone(),
        arch: record.arch.clone(),
        os: record.os.clone(),
        os_version: record.os_version.clone(),
        is_gateway: model
            .identity_to_ip
            .get(&record.identity)
            .map(|ip| model.is_gateway(*ip))
            .unwrap_or(false),
        startup_time: record.startup_time,
        shutdown_time: record.shutdown_time,
        graceful_shutdown: record.graceful_shutdown,
        shutdown_reason: record.shutdown_reason.clone(),
    }
}

/// Identities backing live topology peers come first, then the list is
/// filled to `LIFECYCLE_SNAPSHOT_CAP` with other still-active lifecycle
/// records (`spec.md` §4.2).
pub fn build_lifecycle_views(model: &NetworkModel, now: i64) -> Vec<PeerLifecycleView> {
    let live_topology_identities: HashSet<&str> = model
        .peers
        .values()
        .filter(|p| p.is_live(now))
        .filter_map(|p| p.identity.as_deref())
        .collect();

    let mut primary: Vec<&LifecycleRecord> = model
        .lifecycle
        .values()
        .filter(|r| live_topology_identities.contains(r.identity.as_str()))
        .collect();
    primary.sort_by(|a, b| a.identity.cmp(&b.identity));

    let mut rest: Vec<&LifecycleRecord> = model
        .lifecycle
        .values()
        .filter(|r| !live_topology_identities.contains(r.identity.as_str()) && r.shutdown_time.is_none())
        .collect();
    rest.sort_by(|a, b| a.identity.cmp(&b.identity));

    primary
        .into_iter()
        .chain(rest)
        .take(LIFECYCLE_SNAPSHOT_CAP)
        .map(|record| lifecycle_view(model, record))
        .collect()
}

pub fn build_transfer_views(model: &NetworkModel) -> Vec<TransferEvent> {
    model
        .transfers
        .iter()
        .map(|t| TransferEvent {
            timestamp: t.timestamp,
            peer_id: model
                .identity_to_ip
                .get(&t.identity)
                .map(|ip| anonymize_ip(*ip))
                .unwrap_or_else(|| t.identity.clone()),
            direction: t.direction.clone(),
            bytes: t.bytes,
            throughput_bps: t.throughput_bps,
            window: t.window,
            rtt_ms: t.rtt_ms,
            slowdowns: t.slowdowns,
            timeouts: t.timeouts,
        })
        .collect()
}

pub fn build_propagation_views(model: &NetworkModel) -> HashMap<String, PropagationView> {
    model
        .propagation
        .iter()
        .map(|(key, timeline)| {
            (
                key.clone(),
                PropagationView {
                    short_key: short_key(key),
                    current_hash: timeline.current_hash.clone(),
                    first_seen: timeline.first_seen,
                    last_seen: timeline.last_seen,
                    peer_count: timeline.peer_first_seen.len(),
                    previous_propagation_ms: timeline.previous.as_ref().map(|p| p.propagation_ms),
                },
            )
        })
        .collect()
}

pub fn build_transaction_views(model: &NetworkModel, limit: usize) -> Vec<TransactionView> {
    model
        .transaction_order
        .iter()
        .rev()
        .take(limit)
        .rev()
        .filter_map(|tx_id| {
            model.transactions.get(tx_id).map(|tx| TransactionView {
                tx_id: tx_id.clone(),
                op: tx.op.as_str().to_owned(),
                contract: tx.contract.clone(),
                contract_full: tx.contract.as_deref().map(short_key),
                start_ns: tx.start,
                end_ns: tx.end,
                duration_ms: Some((tx.end - tx.start) as f64 / 1_000_000.0),
                status: tx.status.as_str().to_owned(),
                events: tx
                    .events
                    .iter()
                    .map(|(ts, event_type, peer_id)| TransactionEvent {
                        timestamp: *ts,
                        event_type: event_type.clone(),
                        peer_id: peer_id.clone(),
                    })
                    .collect(),
            })
        })
        .collect()
}

pub fn build_peer_presence(model: &NetworkModel) -> Vec<PeerPresenceView> {
    model
        .lifecycle
        .values()
        .map(|record| PeerPresenceView {
            identity: record.identity.clone(),
            ip_hash: model
                .identity_to_ip
                .get(&record.identity)
                .map(|ip| self_id_hash(*ip))
                .unwrap_or_default(),
            active: record.shutdown_time.is_none(),
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub fn build_state_message(
    model: &NetworkModel,
    now: i64,
    peer_names: HashMap<String, String>,
    your_ip_hash: String,
    your_peer_id: String,
    you_are_peer: bool,
    your_name: Option<String>,
    priority_token: String,
) -> StateMessage {
    let gateway_ip = model.gateway_ips.first().copied();
    StateMessage {
        peers: build_peer_views(model, now),
        connections: build_connection_pairs(model, now),
        subscriptions: build_subscription_views(model, now),
        op_stats: build_op_stats(model),
        peer_lifecycle: build_lifecycle_views(model, now),
        peer_names,
        transfers: build_transfer_views(model),
        propagation: build_propagation_views(model),
        your_ip_hash,
        your_peer_id,
        gateway_peer_id: gateway_ip.map(anonymize_ip).unwrap_or_default(),
        gateway_ip_hash: gateway_ip.map(self_id_hash).unwrap_or_default(),
        you_are_peer,
        your_name,
        priority_token,
    }
}

pub fn build_history_message(model: &NetworkModel, now: i64) -> HistoryMessage {
    let events: Vec<_> = model
        .event_history
        .iter()
        .rev()
        .take(HISTORY_INITIAL_SEND)
        .rev()
        .map(|entry| tn_protocol::OutboundEvent {
            timestamp: entry.timestamp,
            event_type: entry.event_type.clone(),
            peer_id: entry.peer_id.clone(),
            peer_ip_hash: entry.peer_ip_hash.clone(),
            location: entry.location,
            time_str: entry.time_str.clone(),
            from_peer: entry.from_peer.clone(),
            from_location: entry.from_location,
            to_peer: entry.to_peer.clone(),
            to_location: entry.to_location,
            connection: entry.connection.clone(),
            disconnection: entry.disconnection.clone(),
            contract: None,
            contract_full: entry.contract_full.clone(),
            state_hash: entry.state_hash.clone(),
            tx_id: entry.tx_id.clone(),
        })
        .collect();

    let time_range = TimeRange {
        start: model.event_history.front().map(|e| e.timestamp).unwrap_or(now),
        end: model.event_history.back().map(|e| e.timestamp).unwrap_or(now),
    };

    HistoryMessage {
        events,
        transactions: build_transaction_views(model, TRANSACTION_INITIAL_SEND),
        peer_presence: build_peer_presence(model),
        time_range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn op_stats_latency_is_monotonic_across_percentiles() {
        let mut model = NetworkModel::new(vec![]);
        for i in 1..=20 {
            model.record_request(OpKind::Put, Some(&i.to_string()), 0);
            model.record_success(OpKind::Put, Some(&i.to_string()), i * 1_000_000);
        }
        let stats = build_op_stats(&model);
        let (p50, p95, p99) = (
            stats.put.latency.p50.unwrap(),
            stats.put.latency.p95.unwrap(),
            stats.put.latency.p99.unwrap(),
        );
        assert!(p50 <= p95);
        assert!(p95 <= p99);
    }

    #[test]
    fn state_message_reflects_known_peers() {
        let mut model = NetworkModel::new(vec![Ipv4Addr::new(5, 9, 111, 215)]);
        model.record_peer(Ipv4Addr::new(1, 2, 3, 4), Some("ID1"), 0.3, 10);
        let msg = build_state_message(
            &model,
            10,
            HashMap::new(),
            "abc".to_owned(),
            "peer-abc".to_owned(),
            false,
            None,
            "tok".to_owned(),
        );
        assert_eq!(msg.peers.len(), 1);
        assert!(!msg.gateway_peer_id.is_empty());
    }

    #[test]
    fn state_message_excludes_stale_peers() {
        let mut model = NetworkModel::new(vec![]);
        model.record_peer(Ipv4Addr::new(1, 2, 3, 4), Some("ID1"), 0.3, 0);
        let now = crate::model::LIVE_WINDOW_NS * 10;
        let msg = build_state_message(
            &model,
            now,
            HashMap::new(),
            "abc".to_owned(),
            "peer-abc".to_owned(),
            false,
            None,
            "tok".to_owned(),
        );
        assert!(msg.peers.is_empty());
    }
}
