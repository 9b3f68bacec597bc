//! HTTP routes for Cauldron
//!
//! Thin handlers: parse the request, call the session engine, map the
//! outcome. Failures are plain-text bodies with the status from
//! `CauldronError::status_code()`.

pub mod auth_routes;
pub mod health;
pub mod query;

pub use auth_routes::{connect, login, logout, wss_url};
pub use health::health_check;
pub use query::handle_query;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::extract_token_from_header;
use crate::server::AppState;
use crate::session::Session;
use crate::types::{CauldronError, Result};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    match serde_json::to_vec(body) {
        Ok(json) => {
            let mut response = Response::new(full_body(json));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => error_response(CauldronError::Internal(format!(
            "Failed to encode response: {}",
            e
        ))),
    }
}

/// Plain-text error response
pub fn error_response(err: CauldronError) -> Response<BoxBody> {
    let (status, body) = err.into_status_code_and_body();
    if status.is_server_error() {
        warn!(status = %status, error = %body, "Request failed");
    } else {
        debug!(status = %status, error = %body, "Request rejected");
    }
    text_response(status, body)
}

pub fn not_found_response(path: &str) -> Response<BoxBody> {
    error_response(CauldronError::NotFound(path.to_string()))
}

pub fn method_not_allowed_response(allowed: &Method) -> Response<BoxBody> {
    let mut response = error_response(CauldronError::MethodNotAllowed(format!(
        "use {}",
        allowed
    )));
    if let Ok(value) = HeaderValue::from_str(allowed.as_str()) {
        response.headers_mut().insert(ALLOW, value);
    }
    response
}

/// Bearer token from the Authorization header, or `Unauthorized`
pub(crate) fn bearer_token(auth_header: Option<&str>) -> Result<&str> {
    extract_token_from_header(auth_header)
        .ok_or_else(|| CauldronError::Unauthorized("Missing bearer token".into()))
}

/// Session belonging to the caller's bearer token
pub(crate) fn session_for(state: &AppState, auth_header: Option<&str>) -> Result<Arc<Session>> {
    let token = bearer_token(auth_header)?;
    state.registry.lookup_by_token(token)
}
