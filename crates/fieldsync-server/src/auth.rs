use crate::error::ApiError;
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use fieldsync_proto::{DEVICE_ID_HEADER, DEVICE_PLATFORM_HEADER};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Identity of the calling user and device, threaded explicitly through
/// every sync operation instead of living in request-global state.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub user: String,
    pub device_id: String,
    pub platform: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Require a valid bearer JWT and an X-Device-Id header on every sync
/// route. Token issuance lives in the external auth service; this server
/// only validates.
pub async fn require_device(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = req.headers();

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

    let decoding_key = DecodingKey::from_secret(state.jwt_secret.as_bytes());
    let token_data = decode::<Claims>(token, &decoding_key, &Validation::default())
        .map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))?;

    let device_id = headers
        .get(DEVICE_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest {
            code: "missing_device_id",
            message: "X-Device-Id header is required".to_string(),
        })?
        .to_string();

    let platform = headers
        .get(DEVICE_PLATFORM_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    req.extensions_mut().insert(DeviceContext {
        user: token_data.claims.sub,
        device_id,
        platform,
    });
    Ok(next.run(req).await)
}
