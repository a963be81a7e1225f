//! Periodic sweeper that evicts peers gone quiet for longer than the live
//! window, together with stale pending ops and propagation timelines.
//!
//! Runs on a fixed tick from `supervisor.rs`, mirroring how the teacher
//! workspace drives its heartbeat/timeout checks from a single interval
//! inside `select!` rather than spawning one timer task per concern.

use std::time::Duration;

use tn_protocol::{PeersRemovedMessage, WsMessage};
use tracing::debug;

use crate::model::CleanupResult;
use crate::state::AppState;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(state: AppState) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        sweep_once(&state).await;
    }
}

pub async fn sweep_once(state: &AppState) {
    sweep_once_at(state, crate::tailer::now_unix_nanos()).await;
}

/// Sweeps using a caller-supplied timestamp instead of the wall clock, so
/// tests can exercise the live-window boundary deterministically.
pub async fn sweep_once_at(state: &AppState, now: i64) {
    let result = {
        let mut model = state.model.write().await;
        model.cleanup_stale_pending_ops(now);
        model.cleanup_stale_propagation(now);
        model.cleanup_stale_peers(now)
    };

    if !has_removals(&result) {
        return;
    }

    debug!(
        removed_peers = result.removed_anon_ids.len(),
        removed_edges = result.removed_edges.len(),
        "sweeping stale peers"
    );

    let message = WsMessage::PeersRemoved(PeersRemovedMessage {
        peer_ids: result.removed_identities,
        peers: result.removed_anon_ids,
        connections: result.removed_edges,
    });
    state.fanout.broadcast_immediate(message).await;
}

fn has_removals(result: &CleanupResult) -> bool {
    !result.removed_anon_ids.is_empty() || !result.removed_edges.is_empty()
}
