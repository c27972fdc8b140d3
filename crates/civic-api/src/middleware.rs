use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use civic_gateway::AuthError;
use civic_gateway::auth::{bearer_token, verify_token};

use crate::auth::AppState;
use crate::error::ApiError;

/// Extract and validate the JWT from the Authorization header and expose the
/// claims to handlers as an extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(AuthError::MissingToken)?;

    let claims = verify_token(&state.jwt_secret, token)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
