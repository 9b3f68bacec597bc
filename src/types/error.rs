//! Error types for Cauldron
//!
//! One enum covers the session engine and the HTTP front end. Every failure
//! surfaces as a typed value from `query()` / `connect()`; nothing here is
//! log-only and nothing terminates the process.

use hyper::StatusCode;

/// Main error type for Cauldron operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CauldronError {
    /// Credential exchange failed, or signed headers could not be derived
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transport handshake failed (DNS, network, handshake rejection)
    #[error("Connect error: {0}")]
    Connect(String),

    /// A write or read failed on an already-open connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection went away while the query was outstanding
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Malformed fragment or unmatched correlation id
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The service executed the query and reported zero batches
    #[error("Empty result: {0}")]
    EmptyResult(String),

    /// A query with this correlation id is already in flight on the session
    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CauldronError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Connect(_) => StatusCode::BAD_GATEWAY,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::ConnectionLost(_) => StatusCode::BAD_GATEWAY,
            Self::Protocol(_) => StatusCode::BAD_GATEWAY,
            Self::EmptyResult(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::DuplicateCorrelationId(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }

    /// True when the failure came from the connection rather than the query.
    ///
    /// `EmptyResult` is a query-scoped outcome and is never infrastructure.
    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Transport(_) | Self::ConnectionLost(_) | Self::Protocol(_)
        )
    }
}

impl From<std::io::Error> for CauldronError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CauldronError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for CauldronError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CauldronError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for CauldronError {
    fn from(err: reqwest::Error) -> Self {
        Self::Auth(format!("Identity provider request failed: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for CauldronError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

/// Result type alias for Cauldron operations
pub type Result<T> = std::result::Result<T, CauldronError>;
