use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use civic_types::events::{LiveCommand, LiveEvent};

use crate::manager::{Connection, ConnectionManager};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one registered connection until the socket closes, the heartbeat
/// times out, or the connection is replaced. Always unregisters on exit.
pub async fn handle_connection(
    socket: WebSocket,
    manager: ConnectionManager,
    connection: Connection,
    mut events: mpsc::UnboundedReceiver<LiveEvent>,
) {
    let (mut sender, mut receiver) = socket.split();
    let user_id = connection.user_id();
    let username = connection.username().to_string();
    let shutdown = connection.shutdown_token();

    info!("{} ({}) connected to live channel", username, user_id);

    let ready = LiveEvent::Ready {
        user_id,
        username: username.clone(),
        role: connection.role(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        manager.unregister(&connection).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let send_shutdown = shutdown.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                _ = send_shutdown.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                result = events.recv() => {
                    let Some(event) = result else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_manager = manager.clone();
    let recv_connection = connection.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<LiveCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_manager, &recv_connection, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_connection.username(),
                            recv_connection.user_id(),
                            e,
                            text.as_str().chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    manager.unregister(&connection).await;
    info!("{} ({}) disconnected from live channel", username, user_id);
}

async fn handle_command(manager: &ConnectionManager, connection: &Connection, cmd: LiveCommand) {
    match cmd {
        LiveCommand::RegisterUser(claimed) => {
            if claimed != connection.user_id() {
                warn!(
                    "{} ({}) tried to register as {}, ignoring",
                    connection.username(),
                    connection.user_id(),
                    claimed
                );
                return;
            }
            if manager.register(connection).await {
                info!("{} ({}) re-registered connection {}", connection.username(), claimed, connection.id());
            } else {
                debug!("{} ({}) already registered", connection.username(), claimed);
            }
        }
    }
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &LiveEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize {}: {}", event.name(), e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
