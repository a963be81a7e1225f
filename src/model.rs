//! The in-memory network model: every index the event interpreter, the
//! cleanup sweeper, and session snapshot builders mutate or read.
//!
//! `NetworkModel` is the single owner of this state (`spec.md` §9's
//! "module-global mutable state maps to a single value"); callers hold it
//! behind `AppState`'s `RwLock` (see `state.rs` and `spec.md` §5).

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;

use crate::identity::{anonymize_ip, is_gateway_ip, self_id_hash};

pub const LIVE_WINDOW_NS: i64 = 30 * 60 * 1_000_000_000;
pub const PENDING_OP_TIMEOUT_NS: i64 = 5 * 60 * 1_000_000_000;
pub const PROPAGATION_CATCHUP_WINDOW_NS: i64 = 5 * 60 * 1_000_000_000;
pub const PROPAGATION_STALE_NS: i64 = LIVE_WINDOW_NS;
pub const HISTORY_MAX_ENTRIES: usize = 50_000;
pub const HISTORY_MAX_AGE_NS: i64 = 2 * 60 * 60 * 1_000_000_000;
pub const HISTORY_INITIAL_SEND: usize = 20_000;
pub const TRANSACTION_MAX_RETAINED: usize = 10_000;
pub const TRANSACTION_INITIAL_SEND: usize = 2_000;
pub const LATENCY_SAMPLE_CAP: usize = 1_000;
pub const TRANSFER_EVENT_CAP: usize = 1_000;
pub const NEIGHBOR_OUTPUT_CAP: usize = 20;
pub const CONTRACT_SNAPSHOT_CAP: usize = 50;
pub const LIFECYCLE_SNAPSHOT_CAP: usize = 50;

/// Undirected pair, stored canonically (lower IP first) so the set never
/// carries both orderings of the same edge.
pub type Edge = (Ipv4Addr, Ipv4Addr);

fn canonical_edge(a: Ipv4Addr, b: Ipv4Addr) -> Edge {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub anon_id: String,
    pub self_id_hash: String,
    pub location: f64,
    pub last_seen: i64,
    pub neighbors: HashSet<Ipv4Addr>,
    pub identity: Option<String>,
}

impl Peer {
    pub fn is_live(&self, now: i64) -> bool {
        now - self.last_seen <= LIVE_WINDOW_NS
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeedingState {
    pub is_seeding: bool,
    pub upstream: Option<String>,
    pub downstream: Vec<String>,
    pub downstream_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Subscription {
    /// Anonymous peer ids subscribed to this contract.
    pub subscribers: HashSet<String>,
    /// sender peer-id -> target peer-ids.
    pub tree: HashMap<String, HashSet<String>>,
    /// telemetry-identity -> seeding state for this contract.
    pub seeding: HashMap<String, SeedingState>,
}

impl Subscription {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.tree.is_empty() && self.seeding.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ContractStateRecord {
    pub hash: String,
    pub timestamp: i64,
    pub event_kind: String,
}

#[derive(Debug, Clone)]
pub struct PropagationArchive {
    pub hash: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub propagation_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PropagationTimeline {
    pub current_hash: Option<String>,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
    pub peer_first_seen: HashMap<String, i64>,
    pub previous: Option<PropagationArchive>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Put,
    Get,
    Update,
    Subscribe,
    Connect,
    Disconnect,
    Broadcast,
    Other,
}

impl OpKind {
    pub fn from_prefix(event_type: &str) -> Option<Self> {
        if event_type.starts_with("put") {
            Some(Self::Put)
        } else if event_type.starts_with("get") {
            Some(Self::Get)
        } else if event_type.starts_with("update") {
            Some(Self::Update)
        } else if event_type.starts_with("subscribe") || event_type.starts_with("subscribed") {
            Some(Self::Subscribe)
        } else if event_type.starts_with("connect") {
            Some(Self::Connect)
        } else if event_type.starts_with("disconnect") {
            Some(Self::Disconnect)
        } else if event_type.starts_with("broadcast") {
            Some(Self::Broadcast)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Update => "update",
            Self::Subscribe => "subscribe",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Broadcast => "broadcast",
            Self::Other => "other",
        }
    }

    /// Only these op kinds are retained in the transaction log.
    pub fn is_retained(self) -> bool {
        matches!(self, Self::Put | Self::Get | Self::Update | Self::Broadcast)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Success,
    NotFound,
    Complete,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub op: OpKind,
    pub contract: Option<String>,
    pub events: Vec<(i64, String, String)>,
    pub start: i64,
    pub end: i64,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct PendingOp {
    pub op: OpKind,
    pub start: i64,
}

#[derive(Debug, Clone, Default)]
pub struct OpCounter {
    pub requests: u64,
    pub successes: u64,
    pub not_found: u64,
    pub broadcasts: u64,
    pub latencies: VecDeque<f64>,
}

impl OpCounter {
    fn push_latency(&mut self, latency_ms: f64) {
        if latency_ms > 0.0 && latency_ms < 300_000.0 {
            self.latencies.push_back(latency_ms);
            while self.latencies.len() > LATENCY_SAMPLE_CAP {
                self.latencies.pop_front();
            }
        }
    }

    pub fn percentiles(&self) -> (Option<f64>, Option<f64>, Option<f64>) {
        if self.latencies.is_empty() {
            return (None, None, None);
        }
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = sorted.len();
        let p50 = sorted[(n as f64 * 0.50) as usize];
        let p95 = if n > 1 {
            Some(sorted[((n as f64 * 0.95) as usize).min(n - 1)])
        } else {
            None
        };
        let p99 = if n > 2 {
            Some(sorted[((n as f64 * 0.99) as usize).min(n - 1)])
        } else {
            None
        };
        (Some(p50), p95, p99)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleRecord {
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

impl LifecycleRecord {
    pub fn is_active(&self, bound_to_public_ip: bool) -> bool {
        self.shutdown_time.is_none() && bound_to_public_ip
    }
}

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub timestamp: i64,
    pub identity: String,
    pub direction: String,
    pub bytes: u64,
    pub throughput_bps: f64,
    pub window: u64,
    pub rtt_ms: f64,
    pub slowdowns: u32,
    pub timeouts: u32,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub event_type: String,
    pub peer_id: String,
    pub peer_ip_hash: String,
    pub location: Option<f64>,
    pub time_str: String,
    pub from_peer: Option<String>,
    pub from_location: Option<f64>,
    pub to_peer: Option<String>,
    pub to_location: Option<f64>,
    pub connection: Option<(String, String)>,
    pub disconnection: Option<(String, String)>,
    pub contract_full: Option<String>,
    pub state_hash: Option<String>,
    pub tx_id: Option<String>,
}

/// Result of a stale-peer sweep, used by the fan-out layer to emit a single
/// coherent `peers_removed` broadcast.
#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub removed_anon_ids: Vec<String>,
    pub removed_edges: Vec<(String, String)>,
    pub removed_identities: Vec<String>,
}

#[derive(Default)]
pub struct NetworkModel {
    pub peers: HashMap<Ipv4Addr, Peer>,
    pub connections: HashSet<Edge>,
    pub ip_to_identity: HashMap<Ipv4Addr, String>,
    pub identity_to_ip: HashMap<String, Ipv4Addr>,
    pub subscriptions: HashMap<String, Subscription>,
    pub contract_states: HashMap<String, HashMap<String, ContractStateRecord>>,
    pub propagation: HashMap<String, PropagationTimeline>,
    pub transactions: HashMap<String, TransactionRecord>,
    pub transaction_order: VecDeque<String>,
    pub pending_ops: HashMap<String, PendingOp>,
    pub lifecycle: HashMap<String, LifecycleRecord>,
    pub event_history: VecDeque<HistoryEntry>,
    pub transfers: VecDeque<TransferRecord>,
    pub op_counters: HashMap<OpKind, OpCounter>,
    pub gateway_ips: Vec<Ipv4Addr>,
}

impl NetworkModel {
    pub fn new(gateway_ips: Vec<Ipv4Addr>) -> Self {
        Self {
            gateway_ips,
            ..Default::default()
        }
    }

    fn counter_mut(&mut self, op: OpKind) -> &mut OpCounter {
        self.op_counters.entry(op).or_default()
    }

    // -- peer & topology mutation ------------------------------------------------

    /// Records (creating or updating) a peer observation. If the peer's
    /// telemetry identity changed since the last observation, the caller
    /// must invoke `cleanup_stale_peer_id` with the old identity *before*
    /// this call (the interpreter does this).
    pub fn record_peer(
        &mut self,
        ip: Ipv4Addr,
        identity: Option<&str>,
        location: f64,
        timestamp: i64,
    ) {
        let entry = self.peers.entry(ip).or_insert_with(|| Peer {
            ip,
            anon_id: anonymize_ip(ip),
            self_id_hash: self_id_hash(ip),
            location,
            last_seen: timestamp,
            neighbors: HashSet::new(),
            identity: None,
        });
        entry.location = location;
        entry.last_seen = timestamp;
        if let Some(identity) = identity {
            entry.identity = Some(identity.to_owned());
            self.ip_to_identity.insert(ip, identity.to_owned());
            self.identity_to_ip.insert(identity.to_owned(), ip);
        }
    }

    /// Refreshes `last_seen` for an already-known peer without creating one.
    pub fn touch_peer(&mut self, ip: Ipv4Addr, timestamp: i64) {
        if let Some(peer) = self.peers.get_mut(&ip) {
            if timestamp > peer.last_seen {
                peer.last_seen = timestamp;
            }
        }
    }

    /// Returns the peer's currently known identity, if any has been observed.
    pub fn identity_for_ip(&self, ip: Ipv4Addr) -> Option<&str> {
        self.ip_to_identity.get(&ip).map(String::as_str)
    }

    pub fn record_edge(&mut self, a: Ipv4Addr, b: Ipv4Addr) -> bool {
        let edge = canonical_edge(a, b);
        if self.connections.insert(edge) {
            if let Some(peer) = self.peers.get_mut(&a) {
                peer.neighbors.insert(b);
            }
            if let Some(peer) = self.peers.get_mut(&b) {
                peer.neighbors.insert(a);
            }
            true
        } else {
            false
        }
    }

    pub fn remove_edge(&mut self, a: Ipv4Addr, b: Ipv4Addr) -> bool {
        let edge = canonical_edge(a, b);
        if self.connections.remove(&edge) {
            if let Some(peer) = self.peers.get_mut(&a) {
                peer.neighbors.remove(&b);
            }
            if let Some(peer) = self.peers.get_mut(&b) {
                peer.neighbors.remove(&a);
            }
            true
        } else {
            false
        }
    }

    /// Purges every per-(contract, peer) index entry keyed on a stale
    /// telemetry identity, without touching topology. Called when a peer's
    /// IP is observed carrying a new identity (a restart).
    pub fn cleanup_stale_peer_id(&mut self, old_identity: &str) {
        for sub in self.subscriptions.values_mut() {
            sub.seeding.remove(old_identity);
        }
        for states in self.contract_states.values_mut() {
            states.remove(old_identity);
        }
        self.lifecycle.remove(old_identity);
        if let Some(ip) = self.identity_to_ip.remove(old_identity) {
            if self.ip_to_identity.get(&ip) == Some(&old_identity.to_owned()) {
                self.ip_to_identity.remove(&ip);
            }
        }
    }

    /// Invariant-preserving sweep: removes every peer whose `last_seen` is
    /// older than `LIVE_WINDOW_NS`, together with every index entry keyed on
    /// that peer's IP or any telemetry identity it ever carried.
    pub fn cleanup_stale_peers(&mut self, now: i64) -> CleanupResult {
        let stale_ips: Vec<Ipv4Addr> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.is_live(now))
            .map(|(ip, _)| *ip)
            .collect();

        let mut result = CleanupResult::default();
        if stale_ips.is_empty() {
            return result;
        }

        let mut stale_identities: HashSet<String> = HashSet::new();
        for ip in &stale_ips {
            if let Some(identity) = self.ip_to_identity.get(ip) {
                stale_identities.insert(identity.clone());
            }
        }
        // Also sweep any identity that currently maps back to a stale IP,
        // even if ip_to_identity already lost the forward mapping.
        for (identity, ip) in &self.identity_to_ip {
            if stale_ips.contains(ip) {
                stale_identities.insert(identity.clone());
            }
        }

        let stale_ip_set: HashSet<Ipv4Addr> = stale_ips.iter().copied().collect();

        // Remove edges touching stale IPs and repair surviving neighbors.
        let removed_edges: Vec<Edge> = self
            .connections
            .iter()
            .filter(|(a, b)| stale_ip_set.contains(a) || stale_ip_set.contains(b))
            .copied()
            .collect();
        for (a, b) in &removed_edges {
            self.connections.remove(&(*a, *b));
            if !stale_ip_set.contains(a) {
                if let Some(peer) = self.peers.get_mut(a) {
                    peer.neighbors.remove(b);
                }
            }
            if !stale_ip_set.contains(b) {
                if let Some(peer) = self.peers.get_mut(b) {
                    peer.neighbors.remove(a);
                }
            }
            result
                .removed_edges
                .push((anonymize_ip(*a), anonymize_ip(*b)));
        }

        for ip in &stale_ips {
            if let Some(peer) = self.peers.remove(ip) {
                result.removed_anon_ids.push(peer.anon_id);
            }
            self.ip_to_identity.remove(ip);
        }
        for identity in &stale_identities {
            self.identity_to_ip.remove(identity);
            self.lifecycle.remove(identity);
            for sub in self.subscriptions.values_mut() {
                sub.seeding.remove(identity);
            }
            for states in self.contract_states.values_mut() {
                states.remove(identity);
            }
        }
        result.removed_identities = stale_identities.into_iter().collect();

        let removed_anon_set: HashSet<&String> = result.removed_anon_ids.iter().collect();
        for sub in self.subscriptions.values_mut() {
            sub.subscribers.retain(|id| !removed_anon_set.contains(id));
            sub.tree.retain(|from, _| !removed_anon_set.contains(from));
            for targets in sub.tree.values_mut() {
                targets.retain(|id| !removed_anon_set.contains(id));
            }
        }
        self.subscriptions.retain(|_, sub| !sub.is_empty());
        for timeline in self.propagation.values_mut() {
            timeline
                .peer_first_seen
                .retain(|id, _| !removed_anon_set.contains(id));
        }

        result
    }

    pub fn cleanup_stale_pending_ops(&mut self, now: i64) {
        self.pending_ops
            .retain(|_, op| now - op.start < PENDING_OP_TIMEOUT_NS);
    }

    /// Resets propagation windows that have gone quiet for longer than
    /// `PROPAGATION_STALE_NS`, so a contract nobody is updating anymore
    /// doesn't hold a timeline forever. Resolves the open question in
    /// `spec.md` §4.2 about propagation's eviction policy: we reuse the
    /// peer liveness window for consistency rather than inventing a new
    /// constant.
    pub fn cleanup_stale_propagation(&mut self, now: i64) {
        self.propagation.retain(|_, timeline| {
            match timeline.last_seen {
                Some(last_seen) => now - last_seen < PROPAGATION_STALE_NS,
                None => true,
            }
        });
    }

    // -- contract state & propagation ---------------------------------------

    pub fn update_contract_state(
        &mut self,
        contract_key: &str,
        identity: &str,
        hash: String,
        timestamp: i64,
        event_kind: &str,
    ) {
        let states = self.contract_states.entry(contract_key.to_owned()).or_default();
        let replace = match states.get(identity) {
            Some(existing) => {
                timestamp > existing.timestamp
                    || (timestamp == existing.timestamp
                        && event_kind == "update_broadcast_applied"
                        && existing.event_kind == "update_broadcast_received")
            }
            None => true,
        };
        if replace {
            states.insert(
                identity.to_owned(),
                ContractStateRecord {
                    hash,
                    timestamp,
                    event_kind: event_kind.to_owned(),
                },
            );
        }
    }

    /// Tracks propagation for the three update-family kinds that represent
    /// state *spreading*. Returns the propagation duration in ms if this
    /// observation closed out the previous hash's window.
    pub fn track_propagation(
        &mut self,
        contract_key: &str,
        peer_id: &str,
        hash: &str,
        timestamp: i64,
    ) {
        let timeline = self.propagation.entry(contract_key.to_owned()).or_default();
        match &timeline.current_hash {
            Some(current) if current == hash => {
                if let Some(first_seen) = timeline.first_seen {
                    if timestamp - first_seen <= PROPAGATION_CATCHUP_WINDOW_NS {
                        timeline
                            .peer_first_seen
                            .entry(peer_id.to_owned())
                            .or_insert(timestamp);
                        if timestamp > timeline.last_seen.unwrap_or(i64::MIN) {
                            timeline.last_seen = Some(timestamp);
                        }
                    }
                }
            }
            Some(current) => {
                let propagation_ms = timeline
                    .first_seen
                    .zip(timeline.last_seen)
                    .map(|(first, last)| (last - first) as f64 / 1e6)
                    .unwrap_or(0.0);
                timeline.previous = Some(PropagationArchive {
                    hash: current.clone(),
                    first_seen: timeline.first_seen.unwrap_or(timestamp),
                    last_seen: timeline.last_seen.unwrap_or(timestamp),
                    propagation_ms,
                });
                timeline.current_hash = Some(hash.to_owned());
                timeline.first_seen = Some(timestamp);
                timeline.last_seen = Some(timestamp);
                timeline.peer_first_seen.clear();
                timeline.peer_first_seen.insert(peer_id.to_owned(), timestamp);
            }
            None => {
                timeline.current_hash = Some(hash.to_owned());
                timeline.first_seen = Some(timestamp);
                timeline.last_seen = Some(timestamp);
                timeline.peer_first_seen.insert(peer_id.to_owned(), timestamp);
            }
        }
    }

    // -- subscriptions --------------------------------------------------------

    pub fn subscription_mut(&mut self, contract_key: &str) -> &mut Subscription {
        self.subscriptions.entry(contract_key.to_owned()).or_default()
    }

    pub fn seeding_mut(&mut self, contract_key: &str, identity: &str) -> &mut SeedingState {
        self.subscription_mut(contract_key)
            .seeding
            .entry(identity.to_owned())
            .or_default()
    }

    // -- op stats & pending ops -------------------------------------------------

    pub fn record_request(&mut self, op: OpKind, tx_id: Option<&str>, timestamp: i64) {
        self.counter_mut(op).requests += 1;
        if let Some(tx_id) = tx_id {
            self.pending_ops
                .insert(tx_id.to_owned(), PendingOp { op, start: timestamp });
        }
    }

    pub fn record_success(&mut self, op: OpKind, tx_id: Option<&str>, timestamp: i64) {
        self.counter_mut(op).successes += 1;
        self.complete_pending(op, tx_id, timestamp);
    }

    pub fn record_not_found(&mut self, tx_id: Option<&str>) {
        self.counter_mut(OpKind::Get).not_found += 1;
        if let Some(tx_id) = tx_id {
            self.pending_ops.remove(tx_id);
        }
    }

    pub fn record_broadcast_emitted(&mut self) {
        self.counter_mut(OpKind::Update).broadcasts += 1;
    }

    fn complete_pending(&mut self, op: OpKind, tx_id: Option<&str>, timestamp: i64) {
        let Some(tx_id) = tx_id else { return };
        if let Some(pending) = self.pending_ops.remove(tx_id) {
            let latency_ms = (timestamp - pending.start) as f64 / 1_000_000.0;
            self.counter_mut(op).push_latency(latency_ms);
        }
    }

    // -- transactions -----------------------------------------------------------

    pub fn accrue_transaction(
        &mut self,
        tx_id: &str,
        op: OpKind,
        event_type: &str,
        timestamp: i64,
        peer_id: &str,
        contract_key: Option<&str>,
        is_terminal: bool,
        status: TransactionStatus,
    ) {
        if !op.is_retained() {
            return;
        }
        if !self.transactions.contains_key(tx_id) {
            self.transactions.insert(
                tx_id.to_owned(),
                TransactionRecord {
                    op,
                    contract: contract_key.map(str::to_owned),
                    events: Vec::new(),
                    start: timestamp,
                    end: timestamp,
                    status: TransactionStatus::Pending,
                },
            );
            self.transaction_order.push_back(tx_id.to_owned());
            while self.transaction_order.len() > TRANSACTION_MAX_RETAINED {
                if let Some(oldest) = self.transaction_order.pop_front() {
                    self.transactions.remove(&oldest);
                }
            }
        }
        if let Some(tx) = self.transactions.get_mut(tx_id) {
            tx.events.push((timestamp, event_type.to_owned(), peer_id.to_owned()));
            if timestamp < tx.start {
                tx.start = timestamp;
            }
            if is_terminal {
                tx.end = timestamp;
                tx.status = status;
            } else if timestamp > tx.end {
                tx.end = timestamp;
            }
            if contract_key.is_some() && tx.contract.is_none() {
                tx.contract = contract_key.map(str::to_owned);
            }
        }
    }

    // -- lifecycle ----------------------------------------------------------------

    pub fn lifecycle_mut(&mut self, identity: &str) -> &mut LifecycleRecord {
        self.lifecycle.entry(identity.to_owned()).or_insert_with(|| LifecycleRecord {
            identity: identity.to_owned(),
            ..Default::default()
        })
    }

    // -- history & transfers --------------------------------------------------------

    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.event_history.push_back(entry);
        if self.event_history.len() % 100 == 0 {
            self.prune_history(entry_now(&self.event_history));
        }
        while self.event_history.len() > HISTORY_MAX_ENTRIES {
            self.event_history.pop_front();
        }
    }

    pub fn prune_history(&mut self, now: i64) {
        let cutoff = now - HISTORY_MAX_AGE_NS;
        while let Some(front) = self.event_history.front() {
            if front.timestamp < cutoff {
                self.event_history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn push_transfer(&mut self, record: TransferRecord) {
        self.transfers.push_back(record);
        while self.transfers.len() > TRANSFER_EVENT_CAP {
            self.transfers.pop_front();
        }
    }

    pub fn is_gateway(&self, ip: Ipv4Addr) -> bool {
        is_gateway_ip(ip, &self.gateway_ips)
    }
}

fn entry_now(history: &VecDeque<HistoryEntry>) -> i64 {
    history.back().map(|e| e.timestamp).unwrap_or(0)
}
