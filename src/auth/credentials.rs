//! Credential sources
//!
//! The session engine only ever asks for a current identity token. How the
//! token is obtained (password sign-in, refresh, challenges) stays behind
//! `IdentityProvider`, so tests can swap in fakes.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::token::IdentityToken;
use crate::types::{CauldronError, Result};

/// Capability to obtain (or refresh) an identity token
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn obtain_identity_token(&self) -> Result<IdentityToken>;
}

/// Tokens returned by a successful exchange with the identity provider
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub id_token: IdentityToken,
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

/// Exchanges credentials for tokens
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, username: &str, password: &str) -> Result<AuthResult>;

    async fn refresh(&self, username: &str, refresh_token: &str) -> Result<AuthResult>;
}

struct CachedToken {
    result: AuthResult,
    received_at: Instant,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.received_at.elapsed() >= self.result.expires_in
    }
}

/// Username/password credentials with a token cache.
///
/// - A cached, unexpired id token is returned as is.
/// - An expired token triggers exactly one refresh-token exchange; if that
///   fails the cache is cleared and the error surfaced, so the next call
///   signs in with the password again.
/// - Without a cache, the password is used.
pub struct CachedCredentials {
    username: String,
    password: String,
    provider: Arc<dyn IdentityProvider>,
    cache: Mutex<Option<CachedToken>>,
}

impl CachedCredentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            provider,
            cache: Mutex::new(None),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether a token has been obtained and not yet discarded
    pub async fn is_signed_in(&self) -> bool {
        self.cache.lock().await.is_some()
    }

    /// Drop any cached token (sign-out)
    pub async fn forget(&self) {
        *self.cache.lock().await = None;
    }
}

#[async_trait]
impl CredentialSource for CachedCredentials {
    async fn obtain_identity_token(&self) -> Result<IdentityToken> {
        let mut cache = self.cache.lock().await;

        let refresh_token = match cache.as_ref() {
            Some(cached) if !cached.is_expired() => {
                debug!(identity = %self.username, "Using cached identity token");
                return Ok(cached.result.id_token.clone());
            }
            Some(cached) => cached.result.refresh_token.clone(),
            None => None,
        };

        let exchanged = match refresh_token {
            Some(refresh_token) => {
                info!(identity = %self.username, "Token expired, refreshing");
                self.provider.refresh(&self.username, &refresh_token).await
            }
            None => {
                if self.password.is_empty() {
                    *cache = None;
                    return Err(CauldronError::Auth(
                        "Token expired and no password available, sign in again".into(),
                    ));
                }
                info!(identity = %self.username, "Signing in");
                self.provider.sign_in(&self.username, &self.password).await
            }
        };

        match exchanged {
            Ok(mut result) => {
                // Refresh responses do not repeat the refresh token.
                if result.refresh_token.is_none() {
                    result.refresh_token = cache
                        .as_ref()
                        .and_then(|cached| cached.result.refresh_token.clone());
                }
                let token = result.id_token.clone();
                *cache = Some(CachedToken {
                    result,
                    received_at: Instant::now(),
                });
                info!(identity = %self.username, "Authentication successful");
                Ok(token)
            }
            Err(e) => {
                warn!(identity = %self.username, error = %e, "Authentication failed");
                *cache = None;
                Err(e)
            }
        }
    }
}

/// A credential source that always hands out the same token
pub struct StaticCredentials {
    token: IdentityToken,
}

impl StaticCredentials {
    pub fn new(token: IdentityToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn obtain_identity_token(&self) -> Result<IdentityToken> {
        Ok(self.token.clone())
    }
}
