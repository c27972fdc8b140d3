//! Live channel: credential checks, the per-user connection registry and the
//! WebSocket connection loop.

pub mod auth;
pub mod connection;
pub mod manager;

pub use auth::AuthError;
pub use manager::{Connection, ConnectionId, ConnectionManager};
