use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;
use uuid::Uuid;

use civic_db::Database;
use civic_gateway::ConnectionManager;
use civic_gateway::auth::issue_token;
use civic_types::api::{ApiResponse, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use civic_types::models::Role;

use crate::error::ApiError;
use crate::extract::JsonBody;
use crate::run_db;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    /// Shared code required to self-register as a government user.
    /// `None` disables government registration.
    pub government_code: Option<String>,
    pub connections: ConnectionManager,
}

impl AppStateInner {
    pub fn new(db: Database, jwt_secret: impl Into<String>) -> Self {
        let jwt_secret = jwt_secret.into();
        Self {
            db,
            connections: ConnectionManager::new(jwt_secret.clone()),
            jwt_secret,
            token_ttl: chrono::Duration::days(30),
            government_code: None,
        }
    }

    pub fn token_for(&self, user_id: Uuid, username: &str, role: Role) -> Result<String, ApiError> {
        Ok(issue_token(&self.jwt_secret, user_id, username, role, self.token_ttl)?)
    }
}

pub async fn register(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Validate input
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::Validation("username must be 3-32 characters".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation("password must be at least 8 characters".into()));
    }

    let role = req.role.unwrap_or(Role::Citizen);
    if role.is_government() {
        let allowed = matches!(
            (&state.government_code, &req.government_code),
            (Some(expected), Some(given)) if expected == given
        );
        if !allowed {
            return Err(ApiError::Authorization("government registration requires a valid code".into()));
        }
    }

    let username = req.username.clone();
    if run_db(&state, move |db| db.get_user_by_username(&username)).await?.is_some() {
        return Err(ApiError::Conflict("username is taken".into()));
    }

    // Hash password with Argon2id off the async runtime
    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
    .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;

    let user_id = Uuid::new_v4();
    let uid = user_id.to_string();
    let username = req.username.clone();
    // The lookup above is only a fast path; two racing registrations meet here.
    let created = run_db(&state, move |db| db.create_user(&uid, &username, &password_hash, role.as_str())).await?;
    if !created {
        return Err(ApiError::Conflict("username is taken".into()));
    }

    let token = state.token_for(user_id, &req.username, role)?;
    info!("Registered {} ({}) as {}", req.username, user_id, role);

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(RegisterResponse { user_id, token })),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let invalid = || ApiError::Auth(civic_gateway::AuthError::InvalidToken);

    let username = req.username.clone();
    let user = run_db(&state, move |db| db.get_user_by_username(&username))
        .await?
        .ok_or_else(invalid)?;

    // Verify password
    let stored_hash = user.password.clone();
    let password = req.password;
    let verified = tokio::task::spawn_blocking(move || {
        PasswordHash::new(&stored_hash)
            .map(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
    .map_err(|e| anyhow::anyhow!("corrupt password hash for {}: {}", user.id, e))?;
    if !verified {
        return Err(invalid());
    }

    let user_id: Uuid = user.id.parse().map_err(anyhow::Error::from)?;
    let role: Role = user.role.parse().map_err(anyhow::Error::msg)?;
    let token = state.token_for(user_id, &user.username, role)?;

    Ok(Json(ApiResponse::ok(LoginResponse {
        user_id,
        username: user.username,
        role,
        token,
    })))
}
