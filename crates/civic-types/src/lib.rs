//! Wire types shared by the civic server crates and the client library.

pub mod api;
pub mod events;
pub mod models;
