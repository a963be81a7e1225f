//! Shared application state, handed to every axum handler via
//! `State<AppState>`. Mirrors the teacher's `AppState` shape: a handful of
//! `Arc`-wrapped subsystems cloned cheaply per request/session.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::fanout::FanoutLayer;
use crate::model::NetworkModel;
use crate::moderation::Classifier;
use crate::name_store::NameStore;

pub const MAX_SESSIONS: usize = 300;
pub const PRIORITY_RESERVED: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub model: Arc<RwLock<NetworkModel>>,
    pub fanout: Arc<FanoutLayer>,
    pub name_store: Arc<NameStore>,
    pub classifier: Arc<Classifier>,
    pub active_sessions: Arc<AtomicUsize>,
    pub gateway_ips: Arc<Vec<Ipv4Addr>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, name_store: NameStore, classifier: Classifier) -> Self {
        let gateway_ips = config.gateway_ips.clone();
        Self {
            model: Arc::new(RwLock::new(NetworkModel::new(gateway_ips.clone()))),
            fanout: Arc::new(FanoutLayer::default()),
            name_store: Arc::new(name_store),
            classifier: Arc::new(classifier),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            gateway_ips: Arc::new(gateway_ips),
            config: Arc::new(config),
        }
    }

    /// Reserves one admission slot for a connecting client. Rejects once
    /// the total cap is reached, and reserves the top slice of slots for
    /// priority (token-bearing or already-known-peer) sessions.
    pub fn try_admit(&self, is_priority: bool) -> bool {
        loop {
            let current = self.active_sessions.load(Ordering::SeqCst);
            if current >= MAX_SESSIONS {
                return false;
            }
            if !is_priority && current >= MAX_SESSIONS - PRIORITY_RESERVED {
                return false;
            }
            if self
                .active_sessions
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_session(&self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::LocalClassifier;

    fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            log_path: dir.path().join("telemetry.jsonl"),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            name_map_path: dir.path().join("names.json"),
            gateway_ips: vec![Ipv4Addr::new(5, 9, 111, 215)],
            moderator_endpoint: None,
        };
        let name_store = NameStore::load(config.name_map_path.clone()).unwrap();
        AppState::new(config, name_store, Classifier::Local(LocalClassifier))
    }

    #[test]
    fn admission_rejects_past_the_hard_cap() {
        let state = test_state();
        state.active_sessions.store(MAX_SESSIONS, Ordering::SeqCst);
        assert!(!state.try_admit(true));
        assert!(!state.try_admit(false));
    }

    #[test]
    fn non_priority_admission_respects_reserved_slice() {
        let state = test_state();
        state
            .active_sessions
            .store(MAX_SESSIONS - PRIORITY_RESERVED, Ordering::SeqCst);
        assert!(!state.try_admit(false));
        assert!(state.try_admit(true));
    }
}
