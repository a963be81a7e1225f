//! WebSocket admission and per-client session loop.
//!
//! Follows the teacher's `ws_receiver.rs` shape: extract everything needed
//! from the request before `on_upgrade`, then run a dedicated async fn per
//! connection combining inbound client messages with the session's outbound
//! queue via `tokio::select!`.

use std::net::Ipv4Addr;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tn_protocol::{
    ClientMessage, NameSetResultMessage, PeerNameUpdateMessage, WsMessage,
};
use tracing::{debug, warn};

use crate::identity::{
    anonymize_ip, generate_priority_token, is_valid_priority_token, self_id_hash,
};
use crate::moderation::{rejection_message, NameVerdict};
use crate::snapshot;
use crate::state::AppState;
use crate::tailer::now_unix_nanos;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let client_ip = extract_client_ip(&headers);
    ws.on_upgrade(move |socket| handle_session(socket, state, client_ip, query.token))
}

fn extract_client_ip(headers: &HeaderMap) -> Option<Ipv4Addr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

async fn handle_session(
    socket: WebSocket,
    state: AppState,
    client_ip: Option<Ipv4Addr>,
    token: Option<String>,
) {
    let ip = client_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let is_known_peer = { state.model.read().await.peers.contains_key(&ip) };
    let token_is_valid = token.as_deref().map(is_valid_priority_token).unwrap_or(false);
    let is_priority = token_is_valid || is_known_peer;

    if !state.try_admit(is_priority) {
        let (mut sender, _) = socket.split();
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: 1013,
                reason: "server at capacity".into(),
            })))
            .await;
        return;
    }

    let result = run_session(socket, &state, ip, is_known_peer, token, token_is_valid).await;
    state.release_session();
    if let Err(err) = result {
        debug!(error = %err, "session ended with error");
    }
}

async fn run_session(
    socket: WebSocket,
    state: &AppState,
    ip: Ipv4Addr,
    is_known_peer: bool,
    token: Option<String>,
    token_is_valid: bool,
) -> Result<(), axum::Error> {
    let (mut sender, mut receiver) = socket.split();
    let (session_id, queue) = state.fanout.register_session().await;

    let your_ip_hash = self_id_hash(ip);
    let your_peer_id = anonymize_ip(ip);
    let priority_token = if token_is_valid {
        token.unwrap()
    } else {
        generate_priority_token()
    };
    let your_name = state.name_store.get(&your_ip_hash);

    let state_message = {
        let model = state.model.read().await;
        snapshot::build_state_message(
            &model,
            now_unix_nanos(),
            state.name_store.all(),
            your_ip_hash.clone(),
            your_peer_id.clone(),
            is_known_peer,
            your_name,
            priority_token,
        )
    };
    if let Err(err) = send_json(&mut sender, &WsMessage::State(state_message)).await {
        state.fanout.unregister_session(session_id).await;
        return Err(err);
    }

    let history_message = {
        let model = state.model.read().await;
        snapshot::build_history_message(&model, now_unix_nanos())
    };
    if let Err(err) = send_json(&mut sender, &WsMessage::History(history_message)).await {
        state.fanout.unregister_session(session_id).await;
        return Err(err);
    }

    let mut outcome = Ok(());
    loop {
        tokio::select! {
            outgoing = queue.pop() => {
                if send_json(&mut sender, &outgoing).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = handle_client_message(&text, state, &your_ip_hash, &mut sender).await {
                            outcome = Err(err);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        outcome = Err(err);
                        break;
                    }
                }
            }
        }
    }

    state.fanout.unregister_session(session_id).await;
    outcome
}

async fn handle_client_message(
    text: &str,
    state: &AppState,
    your_ip_hash: &str,
    sender: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
) -> Result<(), axum::Error> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(err) => {
            warn!(error = %err, "dropping malformed client message");
            return Ok(());
        }
    };

    match message {
        ClientMessage::SetPeerName(req) => {
            let result = set_peer_name(state, your_ip_hash, req.name).await;
            send_json(sender, &WsMessage::NameSetResult(result)).await
        }
    }
}

async fn set_peer_name(
    state: &AppState,
    your_ip_hash: &str,
    requested_name: String,
) -> NameSetResultMessage {
    let now = now_unix_nanos();
    if let Err(retry_minutes) = state.name_store.check_rate_limit(your_ip_hash, now) {
        return NameSetResultMessage {
            success: false,
            name: None,
            error: Some(format!("rate limited, try again in {retry_minutes} min")),
        };
    }

    match state.classifier.classify(&requested_name).await {
        NameVerdict::Allowed(name) => {
            if let Err(err) = state.name_store.set(your_ip_hash, name.clone()) {
                warn!(error = %err, "failed to persist peer name");
                return NameSetResultMessage {
                    success: false,
                    name: None,
                    error: Some("failed to persist name".to_owned()),
                };
            }
            state.name_store.record_name_change(your_ip_hash, now);
            state
                .fanout
                .broadcast_immediate(WsMessage::PeerNameUpdate(PeerNameUpdateMessage {
                    ip_hash: your_ip_hash.to_owned(),
                    name: name.clone(),
                }))
                .await;
            NameSetResultMessage {
                success: true,
                name: Some(name),
                error: None,
            }
        }
        NameVerdict::Rejected(reason) => NameSetResultMessage {
            success: false,
            name: None,
            error: Some(rejection_message(&reason).to_owned()),
        },
    }
}

async fn send_json(
    sender: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    message: &WsMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).expect("WsMessage always serializes");
    sender.send(Message::Text(json)).await
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_client_ip_takes_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn extract_client_ip_is_none_without_header() {
        assert_eq!(extract_client_ip(&HeaderMap::new()), None);
    }
}
