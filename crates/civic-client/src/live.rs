use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civic_types::events::{LiveCommand, LiveEvent};

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up, or the credential was refused. REST keeps working.
    Disconnected,
}

/// Fixed number of attempts with a fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts,
            delay: config.reconnect_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt >= 1 && attempt <= self.max_attempts).then_some(self.delay)
    }
}

enum SessionEnd {
    /// The socket dropped after a successful handshake.
    Dropped,
    /// Never got a socket.
    Failed,
    /// The server refused the credential; retrying cannot help.
    Rejected,
    Shutdown,
}

/// Background live-channel session. Events arrive on `next_event`, the
/// connection state is published through a `watch` channel. Dropping the
/// client stops the session.
pub struct LiveClient {
    events: mpsc::UnboundedReceiver<LiveEvent>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveClient {
    pub fn connect(config: &ClientConfig, user_id: Uuid, token: impl Into<String>) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let shutdown = CancellationToken::new();

        let session = Session {
            url: config.gateway_url(),
            user_id,
            token: token.into(),
            // Stable per client so reconnects replace the stale server-side entry.
            client_id: Uuid::new_v4().to_string(),
            policy: ReconnectPolicy::from_config(config),
            connect_timeout: config.request_timeout,
            events: event_tx,
            status: status_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(session.run());

        Self {
            events,
            status,
            shutdown,
            task,
        }
    }

    pub async fn next_event(&mut self) -> Option<LiveEvent> {
        self.events.recv().await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stop the session and wait for the socket to close.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Session {
    url: String,
    user_id: Uuid,
    token: String,
    client_id: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<LiveEvent>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
}

impl Session {
    async fn run(self) {
        let mut attempt = 0;

        loop {
            match self.connect_once().await {
                SessionEnd::Shutdown | SessionEnd::Rejected => break,
                SessionEnd::Dropped => attempt = 1,
                SessionEnd::Failed => attempt += 1,
            }

            let Some(delay) = self.policy.next_delay(attempt) else {
                warn!("Live channel gave up after {} attempt(s)", self.policy.max_attempts);
                break;
            };
            let _ = self.status.send(ConnectionStatus::Reconnecting { attempt });
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let _ = self.status.send(ConnectionStatus::Disconnected);
    }

    async fn connect_once(&self) -> SessionEnd {
        let url = format!(
            "{}?token={}&userId={}&clientId={}",
            self.url, self.token, self.user_id, self.client_id
        );

        let handshake = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()));
        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
            result = handshake => result,
        };
        let mut socket = match connected {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(tungstenite::Error::Http(response))) if response.status().as_u16() == 401 => {
                warn!("Live channel refused credential for {}", self.user_id);
                return SessionEnd::Rejected;
            }
            Ok(Err(e)) => {
                debug!("Live channel connect failed: {}", e);
                return SessionEnd::Failed;
            }
            Err(_) => {
                debug!("Live channel handshake timed out after {:?}", self.connect_timeout);
                return SessionEnd::Failed;
            }
        };

        // Re-assert identity in case the handshake context was lost.
        let register = LiveCommand::RegisterUser(self.user_id);
        let sent = match serde_json::to_string(&register) {
            Ok(text) => socket.send(Message::Text(text.into())).await,
            Err(e) => {
                warn!("Failed to serialize registerUser: {}", e);
                Ok(())
            }
        };
        if sent.is_err() {
            return SessionEnd::Failed;
        }

        let _ = self.status.send(ConnectionStatus::Connected);
        info!("Live channel connected for {}", self.user_id);

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = socket.close(None).await;
                    return SessionEnd::Shutdown;
                }
                frame = socket.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<LiveEvent>(text.as_str()) {
                    Ok(event) => {
                        if self.events.send(event).is_err() {
                            // Receiver gone: nobody is listening anymore.
                            return SessionEnd::Shutdown;
                        }
                    }
                    Err(e) => warn!("Ignoring unknown live event: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Live channel read error: {}", e);
                    break;
                }
            }
        }

        info!("Live channel dropped for {}", self.user_id);
        SessionEnd::Dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_is_bounded_and_fixed() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(250),
        };
        assert_eq!(policy.next_delay(0), None);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(4), None);
    }

    #[tokio::test]
    async fn unreachable_server_ends_disconnected() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let config = ClientConfig {
            base_url: format!("http://{}", addr),
            reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        };
        let client = LiveClient::connect(&config, Uuid::new_v4(), "token");
        let mut status = client.status_watch();

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *status.borrow_and_update() == ConnectionStatus::Disconnected {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(finished.is_ok());
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn silent_server_times_out_and_gives_up() {
        // Accepts TCP but never answers the upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = ClientConfig {
            base_url: format!("http://{}", addr),
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(10),
            request_timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        };
        let client = LiveClient::connect(&config, Uuid::new_v4(), "token");
        let mut status = client.status_watch();

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            while *status.borrow_and_update() != ConnectionStatus::Disconnected {
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(finished.is_ok());
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }
}
