//! HTTP Routes for Authentication and Connection
//!
//! - POST /login   - Sign in with username/password, returns the id token
//! - POST /connect - Connect the caller's session with a pre-signed URL
//! - GET  /wssurl  - Render a query-string-authenticated WebSocket URL
//! - POST /logout  - Close the caller's connection and forget the session
//!
//! The binary does not sign handshakes itself: sessions start with no request
//! signer, so after /login a client must POST /connect with a pre-signed
//! `wssURL` before /query or /wssurl will succeed (both answer 401 until then).

use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{bearer_token, json_response, session_for, text_response, BoxBody};
use crate::auth::{identity_claim, CachedCredentials, CredentialSource};
use crate::server::AppState;
use crate::types::{CauldronError, Result};

/// Login reply; names the /connect step that has to follow
pub const LOGIN_MESSAGE: &str =
    "Login successful. POST /connect with a pre-signed wssURL before querying";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub message: String,
    pub id_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "wssURL", default)]
    pub wss_url: String,
}

/// POST /login
pub async fn login(state: &AppState, body: &[u8]) -> Result<Response<BoxBody>> {
    let request: LoginRequest = serde_json::from_slice(body)?;
    if request.user_name.trim().is_empty() || request.password.is_empty() {
        return Err(CauldronError::BadRequest(
            "userName and password are required".into(),
        ));
    }

    let credentials = Arc::new(CachedCredentials::new(
        request.user_name.clone(),
        request.password,
        Arc::clone(&state.identity_provider),
    ));
    let token = credentials.obtain_identity_token().await?;

    // Key the session by the token's claim so bearer lookups find it
    let identity = token.identity().unwrap_or(request.user_name);
    let session = state.registry.get_or_create(&identity, credentials.clone());
    session.set_credentials(credentials);

    info!(identity = %identity, "Signed in");
    Ok(json_response(
        StatusCode::OK,
        &LoginResponse {
            message: LOGIN_MESSAGE.into(),
            id_token: token.as_str().to_string(),
        },
    ))
}

/// POST /connect
pub async fn connect(
    state: &AppState,
    auth_header: Option<&str>,
    body: &[u8],
) -> Result<Response<BoxBody>> {
    let session = session_for(state, auth_header)?;
    let request: ConnectRequest = if body.is_empty() {
        ConnectRequest::default()
    } else {
        serde_json::from_slice(body)?
    };

    if request.wss_url.is_empty() {
        session.connect().await?;
    } else {
        session.connect_presigned(&request.wss_url).await?;
    }

    info!(identity = %session.identity(), endpoint = %session.endpoint(), "Connected");
    Ok(text_response(StatusCode::OK, "Connected!"))
}

/// GET /wssurl
pub async fn wss_url(state: &AppState, auth_header: Option<&str>) -> Result<Response<BoxBody>> {
    let session = session_for(state, auth_header)?;
    let url = session.signed_url().await?;
    Ok(text_response(StatusCode::OK, url))
}

/// POST /logout
pub async fn logout(state: &AppState, auth_header: Option<&str>) -> Result<Response<BoxBody>> {
    let identity = identity_claim(bearer_token(auth_header)?)?;
    if !state.registry.sign_out(&identity) {
        return Err(CauldronError::Unauthorized(format!(
            "No active session for {}",
            identity
        )));
    }

    info!(identity = %identity, "Signed out");
    Ok(text_response(StatusCode::OK, "Signed out"))
}
