//! Cognito user-pool identity provider
//!
//! Talks to the `InitiateAuth` JSON API directly over HTTPS. Only the two
//! flows the gateway needs are supported: `USER_PASSWORD_AUTH` and
//! `REFRESH_TOKEN_AUTH`. Challenges (MFA, new password) are reported as
//! authentication errors.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::{AuthResult, IdentityProvider};
use super::token::IdentityToken;
use crate::types::{CauldronError, Result};

const INITIATE_AUTH_TARGET: &str = "AWSCognitoIdentityProviderService.InitiateAuth";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Cognito user-pool client
pub struct CognitoProvider {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    authentication_result: Option<AuthenticationResult>,
    challenge_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    id_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "__type")]
    kind: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

impl CognitoProvider {
    /// Provider for the user pool in `region`
    pub fn new(region: &str, client_id: impl Into<String>) -> Result<Self> {
        Self::with_endpoint(
            format!("https://cognito-idp.{}.amazonaws.com/", region),
            client_id,
        )
    }

    /// Provider against an explicit endpoint
    pub fn with_endpoint(endpoint: impl Into<String>, client_id: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| CauldronError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            client_id: client_id.into(),
        })
    }

    async fn initiate_auth(&self, body: serde_json::Value) -> Result<AuthResult> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("X-Amz-Target", INITIATE_AUTH_TARGET)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorResponse>(&text)
                .ok()
                .map(|e| {
                    format!(
                        "{}: {}",
                        e.kind.unwrap_or_else(|| "Error".into()),
                        e.message.unwrap_or_default()
                    )
                })
                .unwrap_or(text);
            warn!(status = %status, "Login unsuccessful");
            return Err(CauldronError::Auth(detail));
        }

        parse_initiate_auth(&text)
    }
}

fn parse_initiate_auth(text: &str) -> Result<AuthResult> {
    let parsed: InitiateAuthResponse = serde_json::from_str(text)
        .map_err(|e| CauldronError::Auth(format!("Unexpected identity provider response: {}", e)))?;

    if let Some(challenge) = parsed.challenge_name {
        return Err(CauldronError::Auth(format!(
            "Challenge {} must be completed before signing in",
            challenge
        )));
    }

    let result = parsed
        .authentication_result
        .ok_or_else(|| CauldronError::Auth("Identity provider returned no tokens".into()))?;

    Ok(AuthResult {
        id_token: IdentityToken::new(result.id_token),
        refresh_token: result.refresh_token,
        expires_in: Duration::from_secs(result.expires_in.unwrap_or(3600)),
    })
}

#[async_trait]
impl IdentityProvider for CognitoProvider {
    async fn sign_in(&self, username: &str, password: &str) -> Result<AuthResult> {
        debug!(identity = %username, "InitiateAuth USER_PASSWORD_AUTH");
        self.initiate_auth(json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": self.client_id,
            "AuthParameters": {
                "USERNAME": username,
                "PASSWORD": password,
            },
        }))
        .await
    }

    async fn refresh(&self, username: &str, refresh_token: &str) -> Result<AuthResult> {
        debug!(identity = %username, "InitiateAuth REFRESH_TOKEN_AUTH");
        self.initiate_auth(json!({
            "AuthFlow": "REFRESH_TOKEN_AUTH",
            "ClientId": self.client_id,
            "AuthParameters": {
                "REFRESH_TOKEN": refresh_token,
            },
        }))
        .await
    }
}
