//! Fan-out layer: batches live events and delivers them to every connected
//! session over a bounded, explicitly drop-oldest queue.
//!
//! `spec.md` §4.4 treats "never block the tailer, never stall a slow
//! client" as load-bearing, so this intentionally does not lean on
//! `tokio::sync::mpsc`'s native backpressure (which blocks the sender
//! instead of discarding) or `broadcast`'s lag semantics (which surface a
//! `Lagged` error the receiver has to reconcile). A small hand-rolled ring
//! makes the drop policy explicit and observable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tn_protocol::{EventBatchMessage, OutboundEvent, WsMessage};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

pub const SESSION_QUEUE_CAPACITY: usize = 100;
pub const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// A bounded queue that drops the oldest entry on overflow instead of
/// blocking the producer or rejecting the new entry.
pub struct BoundedDropOldest<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedDropOldest<T> {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub async fn push(&self, item: T) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 50 == 0 {
                debug!(dropped, capacity = self.capacity, "session queue dropping oldest entries");
            }
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> T {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(item) = queue.pop_front() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub type SessionId = u64;

pub struct FanoutLayer {
    sessions: RwLock<HashMap<SessionId, Arc<BoundedDropOldest<WsMessage>>>>,
    batch_buffer: Mutex<Vec<OutboundEvent>>,
    next_id: AtomicU64,
}

impl Default for FanoutLayer {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            batch_buffer: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl FanoutLayer {
    pub async fn register_session(&self) -> (SessionId, Arc<BoundedDropOldest<WsMessage>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(BoundedDropOldest::new(SESSION_QUEUE_CAPACITY));
        self.sessions.write().await.insert(id, queue.clone());
        (id, queue)
    }

    pub async fn unregister_session(&self, id: SessionId) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Appends an event to the shared batch buffer; it is delivered on the
    /// next periodic flush rather than immediately.
    pub async fn enqueue_event(&self, event: OutboundEvent) {
        self.batch_buffer.lock().await.push(event);
    }

    /// Delivers a message to every connected session right away, bypassing
    /// the batch buffer. Used for state snapshots, peer removals, and name
    /// updates, none of which benefit from batching.
    pub async fn broadcast_immediate(&self, message: WsMessage) {
        let sessions = self.sessions.read().await;
        for queue in sessions.values() {
            queue.push(message.clone()).await;
        }
    }

    pub async fn send_to_session(&self, id: SessionId, message: WsMessage) {
        let sessions = self.sessions.read().await;
        if let Some(queue) = sessions.get(&id) {
            queue.push(message).await;
        }
    }

    pub async fn flush_batch(&self) {
        let events = {
            let mut buffer = self.batch_buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };
        if self.session_count().await == 0 {
            return;
        }
        let sessions = self.sessions.read().await;
        let message = WsMessage::EventBatch(EventBatchMessage { events });
        for queue in sessions.values() {
            queue.push(message.clone()).await;
        }
    }
}

pub async fn run_flusher(fanout: Arc<FanoutLayer>) {
    let mut ticker = tokio::time::interval(BATCH_FLUSH_INTERVAL);
    loop {
        ticker.tick().await;
        fanout.flush_batch().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drop_oldest_preserves_last_n_entries_in_order() {
        let ring = BoundedDropOldest::new(3);
        for i in 0..5 {
            ring.push(i).await;
        }
        let mut out = Vec::new();
        for _ in 0..3 {
            out.push(ring.pop().await);
        }
        assert_eq!(out, vec![2, 3, 4]);
        assert_eq!(ring.dropped_count(), 2);
    }

    #[tokio::test]
    async fn batch_flush_is_noop_when_no_sessions() {
        let fanout = FanoutLayer::default();
        fanout
            .enqueue_event(tn_protocol::OutboundEvent {
                timestamp: 0,
                event_type: "connect".to_owned(),
                peer_id: "peer-x".to_owned(),
                peer_ip_hash: "abc".to_owned(),
                location: None,
                time_str: "00:00:00".to_owned(),
                from_peer: None,
                from_location: None,
                to_peer: None,
                to_location: None,
                connection: None,
                disconnection: None,
                contract: None,
                contract_full: None,
                state_hash: None,
                tx_id: None,
            })
            .await;
        fanout.flush_batch().await;
        assert_eq!(fanout.batch_buffer.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn registered_session_receives_immediate_broadcast() {
        let fanout = FanoutLayer::default();
        let (_id, queue) = fanout.register_session().await;
        fanout.send_to_session(_id, WsMessage::PeerNameUpdate(tn_protocol::PeerNameUpdateMessage {
            ip_hash: "h".to_owned(),
            name: "n".to_owned(),
        })).await;
        let msg = queue.pop().await;
        matches!(msg, WsMessage::PeerNameUpdate(_));
    }
}
