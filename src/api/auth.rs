//! Bearer token authentication.
//!
//! Every route requires a JWT signed with the service's symmetric secret
//! (HS256). Tokens carry an issue time and an optional subject; the subject
//! becomes the `user` recorded on scheduled jobs.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::errors::ApiError;
use super::ApiState;

/// Claims carried by an API token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal the token was issued to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Issue time (seconds since epoch).
    pub iat: i64,
}

/// Mint a token signed with `secret`.
pub fn mint_token(secret: &str, sub: Option<String>) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub,
        iat: chrono::Utc::now().timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verify a token and return its claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    // Tokens have no expiry; possession of a validly signed token is the
    // whole authorization model.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Middleware enforcing a valid bearer token on every request.
pub async fn require_bearer(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".to_string()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("expected bearer token".to_string()))?;

    let claims = verify_token(&state.jwt_secret, token)
        .map_err(|e| ApiError::Unauthorized(format!("invalid token: {}", e)))?;

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
