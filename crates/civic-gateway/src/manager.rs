use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use civic_types::api::Claims;
use civic_types::events::LiveEvent;
use civic_types::models::Role;

use crate::auth::{self, AuthError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One live client socket. Owns no durable state; it is only a delivery
/// endpoint plus a token that tears the socket down when cancelled.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    user_id: Uuid,
    username: String,
    role: Role,
    client_id: Option<String>,
    tx: mpsc::UnboundedSender<LiveEvent>,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn send(&self, event: LiveEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Tracks every live connection per user and delivers events to them.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    jwt_secret: String,

    /// user_id -> (connection_id -> connection)
    connections: RwLock<HashMap<Uuid, HashMap<ConnectionId, Connection>>>,
}

impl ConnectionManager {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                jwt_secret: jwt_secret.into(),
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Check a handshake credential. `user_hint` is only a correlation hint
    /// and must agree with the token subject.
    pub fn verify(&self, token: &str, user_hint: Option<Uuid>) -> Result<Claims, AuthError> {
        let claims = auth::verify_token(&self.inner.jwt_secret, token)?;
        if let Some(hint) = user_hint {
            if hint != claims.sub {
                return Err(AuthError::IdentityMismatch);
            }
        }
        Ok(claims)
    }

    /// Verify the credential, then open and register a connection.
    /// Nothing is created when verification fails.
    pub async fn connect(
        &self,
        token: &str,
        user_hint: Option<Uuid>,
        client_id: Option<String>,
    ) -> Result<(Connection, mpsc::UnboundedReceiver<LiveEvent>), AuthError> {
        let claims = self.verify(token, user_hint)?;
        Ok(self.open(&claims, client_id).await)
    }

    /// Open a connection for already-verified claims. A prior connection of
    /// the same logical client (same user and `client_id`) is torn down first.
    pub async fn open(
        &self,
        claims: &Claims,
        client_id: Option<String>,
    ) -> (Connection, mpsc::UnboundedReceiver<LiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection {
            id: ConnectionId(Uuid::new_v4()),
            user_id: claims.sub,
            username: claims.username.clone(),
            role: claims.role,
            client_id,
            tx,
            shutdown: CancellationToken::new(),
        };

        let mut connections = self.inner.connections.write().await;
        let user_conns = connections.entry(connection.user_id).or_default();

        if let Some(client_id) = connection.client_id.as_deref() {
            let stale: Vec<ConnectionId> = user_conns
                .values()
                .filter(|c| c.client_id.as_deref() == Some(client_id))
                .map(|c| c.id)
                .collect();
            for id in stale {
                if let Some(old) = user_conns.remove(&id) {
                    info!("{} ({}) replacing connection {} for client {}", old.username, old.user_id, id, client_id);
                    old.shutdown.cancel();
                }
            }
        }

        user_conns.insert(connection.id, connection.clone());
        info!(
            "{} ({}) registered connection {} ({} active)",
            connection.username,
            connection.user_id,
            connection.id,
            user_conns.len()
        );

        (connection, rx)
    }

    /// Idempotently (re-)register a connection. Returns true if it was missing.
    pub async fn register(&self, connection: &Connection) -> bool {
        if connection.shutdown.is_cancelled() {
            return false;
        }

        let mut connections = self.inner.connections.write().await;
        let user_conns = connections.entry(connection.user_id).or_default();
        if user_conns.contains_key(&connection.id) {
            return false;
        }
        user_conns.insert(connection.id, connection.clone());
        true
    }

    /// Remove exactly this connection. No other state is touched.
    pub async fn unregister(&self, connection: &Connection) {
        let mut connections = self.inner.connections.write().await;
        if let Some(user_conns) = connections.get_mut(&connection.user_id) {
            user_conns.remove(&connection.id);
            if user_conns.is_empty() {
                connections.remove(&connection.user_id);
            }
        }
    }

    /// Best-effort, at-most-once delivery to every connection of `user_id`.
    /// Returns how many connections accepted the event; zero is not an error.
    pub async fn emit(&self, user_id: Uuid, event: LiveEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        {
            let connections = self.inner.connections.read().await;
            let Some(user_conns) = connections.get(&user_id) else {
                debug!("No live connection for {}, dropping {}", user_id, event.name());
                return 0;
            };

            for connection in user_conns.values() {
                if connection.send(event.clone()) {
                    delivered += 1;
                } else {
                    dead.push(connection.id);
                }
            }
        }

        if !dead.is_empty() {
            let mut connections = self.inner.connections.write().await;
            if let Some(user_conns) = connections.get_mut(&user_id) {
                for id in &dead {
                    user_conns.remove(id);
                }
                if user_conns.is_empty() {
                    connections.remove(&user_id);
                }
            }
            debug!("Pruned {} closed connection(s) for {}", dead.len(), user_id);
        }

        delivered
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .connections
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }
}
