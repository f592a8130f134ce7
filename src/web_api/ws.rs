//! WebSocket endpoint
//!
//! Bridges one socket to the fan-out hub: snapshot on connect, grouped
//! change events afterwards, 30 s server pings with a two-strike pong
//! policy, and a close frame carrying the hub's reason when it drops us.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;

use crate::fanout::{FanoutMessage, SLOW_CONSUMER};
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u8 = 2;

/// Inbound client message; anything unrecognized is ignored
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    #[serde(other)]
    Unknown,
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(state, socket))
}

async fn client_session(state: AppState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut client = state.fanout.register().await;

    // Authoritative state first; the client reconciles everything after
    // from grouped change events.
    let snapshot = FanoutMessage::Snapshot {
        devices: state.store.snapshot_all().await,
        alerts: state.alerts.current().await,
    };
    if send_json(&mut sender, &snapshot).await.is_err() {
        state.fanout.unregister(&client.id).await;
        return;
    }

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );
    let mut missed_pongs: u8 = 0;

    loop {
        tokio::select! {
            queued = client.rx.recv() => match queued {
                Some(message) => {
                    if send_json(&mut sender, &message).await.is_err() {
                        break;
                    }
                }
                None => {
                    // The hub dropped us; tell the client why
                    let reason = client.close_reason().unwrap_or("shutdown");
                    let code = if reason == SLOW_CONSUMER {
                        close_code::POLICY
                    } else {
                        close_code::AWAY
                    };
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Ping) => {
                            if send_json(&mut sender, &FanoutMessage::Pong).await.is_err() {
                                break;
                            }
                        }
                        _ => {
                            tracing::trace!(connection_id = %client.id, "Ignoring client message");
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    missed_pongs = 0;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %client.id, error = %e, "Socket error");
                    break;
                }
            },
            _ = ping.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    tracing::info!(connection_id = %client.id, "Client missed pings, closing");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "ping timeout".into(),
                        })))
                        .await;
                    break;
                }
                missed_pongs += 1;
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.fanout.unregister(&client.id).await;
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &FanoutMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize fan-out message");
            return Ok(());
        }
    };
    sender.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_client_messages_are_ignorable() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type": "subscribe", "topic": "door"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Unknown));

        let parsed: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping));
    }
}
