use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use civic_api::auth::{self, AppState, AppStateInner};
use civic_api::error::ApiError;
use civic_api::extract::QueryParams;
use civic_api::middleware::require_auth;
use civic_api::{chat, consent, issues, permissions};
use civic_db::Database;
use civic_gateway::auth::bearer_token;
use civic_gateway::connection;
use civic_types::api::ApiResponse;

use crate::config::ServerConfig;

pub fn build_state(config: &ServerConfig, db: Database) -> AppState {
    let mut inner = AppStateInner::new(db, config.jwt_secret.clone());
    inner.token_ttl = config.token_ttl();
    inner.government_code = config.government_code.clone();
    Arc::new(inner)
}

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/health", get(health));

    let protected_routes = Router::new()
        .route("/issues", post(issues::create_issue))
        .route("/issues/{issue_id}", get(issues::get_issue))
        .route("/issues/{issue_id}/merge", post(issues::merge_issue))
        .route(
            "/issues/{issue_id}/consent",
            get(consent::get_consent).post(consent::respond_to_consent),
        )
        .route("/consent/pending", get(consent::list_pending))
        .route(
            "/issues/{issue_id}/chat",
            get(chat::get_messages).post(chat::send_message),
        )
        .route("/issues/{issue_id}/permissions", get(permissions::get_permissions))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let ws_route = Router::new().route("/gateway", get(ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .fallback(unknown_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::ok("ok"))
}

async fn unknown_route() -> ApiError {
    ApiError::NotFound("route".into())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayQuery {
    token: Option<String>,
    user_id: Option<Uuid>,
    client_id: Option<String>,
}

/// Verify the handshake before upgrading; a bad credential never gets a
/// socket.
async fn ws_upgrade(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(query.token)
        .unwrap_or_default();

    let claims = match state.connections.verify(&token, query.user_id) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Rejected live channel handshake: {}", e);
            return (StatusCode::UNAUTHORIZED, Json(ApiResponse::failure(e.to_string()))).into_response();
        }
    };

    let manager = state.connections.clone();
    let client_id = query.client_id;
    ws.on_upgrade(move |socket| async move {
        let (conn, events) = manager.open(&claims, client_id).await;
        connection::handle_connection(socket, manager, conn, events).await;
    })
}
