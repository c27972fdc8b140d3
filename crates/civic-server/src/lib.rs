pub mod app;
pub mod config;

pub use app::{build_router, build_state};
pub use config::ServerConfig;
