use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use artisan_messaging::Messenger;
use artisan_types::events::{ClientCommand, Notification};

use crate::middleware::verify_token;
use crate::state::AppState;

/// Server pings every 15 seconds; two missed pongs drop the socket.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    pub token: String,
}

/// `GET /notifications?token=...`
///
/// Browsers cannot set headers on a WebSocket upgrade, so the token travels
/// in the query string and is checked before upgrading.
pub async fn notifications_upgrade(
    State(state): State<AppState>,
    Query(params): Query<NotificationParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(claims) = verify_token(&state.jwt_secret, &params.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let (messenger, lease) = state.connect(claims.sub).await;
    ws.on_upgrade(move |socket| async move {
        // the session stays resident until the socket closes
        let _lease = lease;
        run_connection(socket, messenger).await
    })
}

async fn run_connection(socket: WebSocket, messenger: Arc<Messenger>) {
    let identity = messenger.identity();
    let (mut sender, mut receiver) = socket.split();
    let mut notifications = messenger.notifications();
    info!("{} connected to notifications", identity);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = notifications.recv() => {
                    let note = match result {
                        Ok(note) => note,
                        Err(RecvError::Lagged(n)) => {
                            warn!("Notification receiver for {} lagged by {}", identity, n);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    let Some(frame) = frame(&note) else { continue };
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_received.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout for {}, dropping connection", identity);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_messenger = messenger.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(cmd) => apply_command(&recv_messenger, cmd).await,
                    Err(e) => warn!(
                        "{} bad command: {} -- raw: {}",
                        identity,
                        e,
                        text.chars().take(200).collect::<String>()
                    ),
                },
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    info!("{} disconnected from notifications", identity);
}

fn frame(note: &Notification) -> Option<Message> {
    match serde_json::to_string(note) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Could not encode notification: {}", e);
            None
        }
    }
}

async fn apply_command(messenger: &Messenger, cmd: ClientCommand) {
    match cmd {
        ClientCommand::StartTyping { conversation_id } => {
            if let Err(e) = messenger.start_typing(conversation_id).await {
                warn!("Typing signal for {} failed: {}", conversation_id, e);
            }
        }
    }
}
