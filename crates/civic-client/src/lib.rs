//! Client side of the civic issue chat: a typed REST client, the live
//! channel with bounded reconnects, and the local view state built on top
//! (message buffers, the consent inbox and the composer hint).

pub mod api;
pub mod buffer;
pub mod composer;
pub mod config;
pub mod consent;
pub mod error;
pub mod live;

pub use api::ApiClient;
pub use buffer::{ChatBuffer, ChatBuffers};
pub use composer::ComposerState;
pub use config::ClientConfig;
pub use consent::ConsentInbox;
pub use error::ClientError;
pub use live::{ConnectionStatus, LiveClient, ReconnectPolicy};
