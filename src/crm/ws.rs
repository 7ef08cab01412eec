use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{ApiError, SharedState};
use super::controller::PipelineController;
use super::events::PipelineEvent;
use super::models::{Account, AccountId, Role};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Browsers cannot set headers on a WebSocket handshake, so the account
/// travels in the query string.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub account: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

impl WsQuery {
    fn into_account(self) -> Result<Account, ApiError> {
        let id = self
            .account
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Missing account query parameter".into()))?;
        Ok(Account::new(id, self.role.unwrap_or_default()))
    }
}

/// Why an event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    ClientClosed,
    PongTimeout,
    SendFailed,
    BoardClosed,
}

/// Ping/pong bookkeeping for one connection.
#[derive(Debug)]
struct Keepalive {
    last_pong: Instant,
    awaiting_pong: bool,
}

impl Keepalive {
    fn new() -> Self {
        Self {
            last_pong: Instant::now(),
            awaiting_pong: false,
        }
    }

    /// False once a ping has gone unanswered for longer than [`PONG_TIMEOUT`].
    fn is_alive(&self) -> bool {
        !self.awaiting_pong || self.last_pong.elapsed() <= PONG_TIMEOUT
    }

    fn ping_sent(&mut self) {
        self.awaiting_pong = true;
    }

    fn pong_received(&mut self) {
        self.last_pong = Instant::now();
        self.awaiting_pong = false;
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

/// Stream one account's pipeline events to the client, starting with a
/// snapshot of its board.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let account = query.into_account()?;
    let controller = state.controller(&account).await;
    // subscribe before the upgrade so nothing is missed between snapshot and stream
    let rx = controller.subscribe();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, controller, rx)))
}

async fn handle_socket(
    socket: WebSocket,
    controller: Arc<PipelineController>,
    rx: broadcast::Receiver<String>,
) {
    let account_id = controller.account().id.clone();
    let snapshot = snapshot_message(&controller);
    drop(controller);

    tracing::debug!(account = %account_id, "Event stream connected");
    let (mut sender, receiver) = socket.split();

    let reason = match snapshot {
        Some(text) if sender.send(Message::Text(text.clone().into())).await.is_err() => {
            Disconnect::SendFailed
        }
        _ => forward_events(&account_id, sender, receiver, rx).await,
    };
    tracing::debug!(account = %account_id, ?reason, "Event stream closed");
}

fn snapshot_message(controller: &PipelineController) -> Option<String> {
    let event = PipelineEvent::BoardSnapshot {
        board: controller.board(),
    };
    match serde_json::to_string(&event) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize board snapshot");
            None
        }
    }
}

/// Relay board events until the client goes away, stops answering pings,
/// or the board's channel closes.
async fn forward_events(
    account_id: &AccountId,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) -> Disconnect {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // first tick is immediate
    ping_interval.tick().await;
    let mut keepalive = Keepalive::new();

    let reason = loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if !keepalive.is_alive() {
                    break Disconnect::PongTimeout;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break Disconnect::SendFailed;
                }
                keepalive.ping_sent();
            }

            event = rx.recv() => match event {
                Ok(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break Disconnect::SendFailed;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(account = %account_id, skipped, "Event stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break Disconnect::BoardClosed,
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Pong(_))) => keepalive.pong_received(),
                Some(Ok(Message::Close(_))) | None => break Disconnect::ClientClosed,
                Some(Ok(_)) => {}
                Some(Err(_)) => break Disconnect::SendFailed,
            },
        }
    };

    if reason != Disconnect::ClientClosed {
        let _ = sender.send(Message::Close(None)).await;
    }
    reason
}
