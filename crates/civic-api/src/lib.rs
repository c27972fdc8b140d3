pub mod auth;
pub mod chat;
pub mod consent;
pub mod error;
pub mod extract;
pub mod issues;
pub mod middleware;
pub mod permissions;

use civic_db::Database;

use crate::auth::AppState;
use crate::error::ApiError;

/// Run a blocking DB call off the async runtime.
pub(crate) async fn run_db<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state.db))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
        .map_err(ApiError::from)
}
