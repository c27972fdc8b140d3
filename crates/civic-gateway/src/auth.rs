use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use uuid::Uuid;

use civic_types::api::Claims;
use civic_types::models::Role;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingToken,

    #[error("invalid or expired credential")]
    InvalidToken,

    #[error("user id does not match credential")]
    IdentityMismatch,
}

/// Sign an HS256 token for `user_id`, valid for `ttl`.
pub fn issue_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    role: Role,
    ttl: chrono::Duration,
) -> anyhow::Result<String> {
    let expires = chrono::Utc::now()
        .checked_add_signed(ttl)
        .ok_or_else(|| anyhow::anyhow!("token lifetime of {} days is out of range", ttl.num_days()))?;
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role,
        exp: expires.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AuthError::InvalidToken)?;

    Ok(token_data.claims)
}

/// Pull the token out of an `Authorization: Bearer ...` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ").map(str::trim)
}
