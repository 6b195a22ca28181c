//! Token issue and refresh endpoints
//!
//! These are the only calls made without a bearer token.

use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::{SyncError, SyncResult};

const TOKEN_NEW_PATH: &str = "/api/v2/token/new/";
const TOKEN_REFRESH_PATH: &str = "/api/v2/token/refresh/";

/// Response from the token endpoints. Lifetimes are in seconds.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access: String,
    pub access_expires: Option<i64>,
    pub refresh: Option<String>,
    pub refresh_expires: Option<i64>,
}

/// Exchange long-lived secrets for a fresh access/refresh pair.
pub async fn request_new_token(
    transport: &dyn Transport,
    secret_id: &str,
    secret_key: &str,
) -> SyncResult<TokenResponse> {
    let resp = transport
        .send(
            ApiRequest::new(Method::POST, TOKEN_NEW_PATH).json(json!({
                "secret_id": secret_id,
                "secret_key": secret_key,
            })),
        )
        .await?;

    match resp.status {
        401 | 403 => Err(SyncError::InvalidCredentials(format!(
            "HTTP {}: {}",
            resp.status, resp.body
        ))),
        _ => decode_token(resp),
    }
}

/// Obtain a new access token from a refresh token.
pub async fn request_refresh(
    transport: &dyn Transport,
    refresh_token: &str,
) -> SyncResult<TokenResponse> {
    let resp = transport
        .send(
            ApiRequest::new(Method::POST, TOKEN_REFRESH_PATH)
                .json(json!({ "refresh": refresh_token })),
        )
        .await?;

    match resp.status {
        401 | 403 => Err(SyncError::AuthExpired),
        _ => decode_token(resp),
    }
}

fn decode_token(resp: ApiResponse) -> SyncResult<TokenResponse> {
    if !resp.is_success() {
        return Err(SyncError::RemoteError {
            status: resp.status,
            body: resp.body,
        });
    }
    Ok(serde_json::from_value(resp.json()?)?)
}
