//! HTTP server implementation
//!
//! hyper http1 over `TokioIo`, one task per accepted connection.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::auth::IdentityProvider;
use crate::config::Args;
use crate::registry::SessionRegistry;
use crate::routes::{self, error_response, method_not_allowed_response, not_found_response, BoxBody};
use crate::types::{CauldronError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub registry: Arc<SessionRegistry>,
    /// Exchanges username/password for tokens on /login
    pub identity_provider: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(
        args: Args,
        registry: Arc<SessionRegistry>,
        identity_provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            args,
            registry,
            identity_provider,
        }
    }
}

/// Bind `args.listen` and serve until `shutdown` resolves.
pub async fn run(state: Arc<AppState>, shutdown: impl Future<Output = ()>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("Cauldron listening on {}", state.args.listen);
    serve(listener, state, shutdown).await
}

/// Serve on an already-bound listener until `shutdown` resolves, then close
/// every session.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, closing sessions");
                state.registry.close_all();
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);

                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { handle_request(state, addr, req).await }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            error!("Error serving connection from {}: {:?}", addr, err);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                }
            }
        }
    }
}

/// Method each route answers to
fn route_method(path: &str) -> Option<Method> {
    match path {
        "/health" | "/wssurl" => Some(Method::GET),
        "/login" | "/logout" | "/connect" | "/query" => Some(Method::POST),
        _ => None,
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let Some(allowed) = route_method(&path) else {
        return Ok(not_found_response(&path));
    };
    if method != allowed {
        return Ok(method_not_allowed_response(&allowed));
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let auth = auth_header.as_deref();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(error_response(CauldronError::BadRequest(format!(
                "Failed to read request body: {}",
                e
            ))))
        }
    };

    let outcome = match path.as_str() {
        "/health" => Ok(routes::health_check(&state)),
        "/login" => routes::login(&state, &body).await,
        "/connect" => routes::connect(&state, auth, &body).await,
        "/query" => routes::handle_query(&state, auth, &body).await,
        "/wssurl" => routes::wss_url(&state, auth).await,
        "/logout" => routes::logout(&state, auth).await,
        _ => Ok(not_found_response(&path)),
    };

    Ok(outcome.unwrap_or_else(error_response))
}
