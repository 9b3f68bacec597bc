//! Transport-level authentication headers
//!
//! The query service authenticates the WebSocket upgrade with SigV4-style
//! headers (`Authorization`, `X-Amz-Date`, `X-Amz-Security-Token`). How they
//! are produced is a pluggable `HeaderSigner`; the headers are attached at
//! handshake time only and never renegotiated mid-connection.
//!
//! Two signers ship here:
//! - `PresignedUrlSigner` lifts the headers out of an already-authenticated
//!   URL's query string
//! - `StaticSigner` hands out fixed headers
//!
//! The reverse direction, headers to a query-string-authenticated URL, is
//! `SignedHeaders::signed_url`.

use async_trait::async_trait;
use url::Url;

use crate::auth::IdentityToken;
use crate::types::{CauldronError, Result};

pub const AUTHORIZATION: &str = "Authorization";
pub const AMZ_DATE: &str = "X-Amz-Date";
pub const AMZ_SECURITY_TOKEN: &str = "X-Amz-Security-Token";

const DEFAULT_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const PRESIGNED_SIGNED_HEADERS: &str = "host;x-amz-date;x-amz-security-token";

/// Headers attached to the WebSocket upgrade request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignedHeaders {
    headers: Vec<(String, String)>,
}

impl SignedHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a header
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Render these headers as a query-string-authenticated URL on `base`.
    pub fn signed_url(&self, base: &str) -> Result<String> {
        let authorization = self
            .get(AUTHORIZATION)
            .ok_or_else(|| CauldronError::Auth("No Authorization header to sign with".into()))?;
        let (credential, signature) = extract_credential_and_signature(authorization)?;
        let algorithm = authorization
            .split_whitespace()
            .next()
            .filter(|alg| !alg.contains('='))
            .unwrap_or(DEFAULT_ALGORITHM);
        let date = self
            .get(AMZ_DATE)
            .ok_or_else(|| CauldronError::Auth(format!("{} header missing", AMZ_DATE)))?;
        let token = self
            .get(AMZ_SECURITY_TOKEN)
            .ok_or_else(|| CauldronError::Auth(format!("{} header missing", AMZ_SECURITY_TOKEN)))?;

        Ok(format!(
            "{}?X-Amz-Algorithm={}&X-Amz-Credential={}&X-Amz-Date={}&X-Amz-Security-Token={}&X-Amz-Signature={}",
            base,
            urlencoding::encode(algorithm),
            urlencoding::encode(credential),
            urlencoding::encode(date),
            urlencoding::encode(token),
            urlencoding::encode(signature),
        ))
    }
}

/// Pull `Credential=` and `Signature=` out of an Authorization header value.
fn extract_credential_and_signature(header: &str) -> Result<(&str, &str)> {
    let credential_start = header
        .find("Credential=")
        .ok_or_else(|| CauldronError::Auth("Credential not found in Authorization header".into()))?
        + "Credential=".len();
    let credential_end = header[credential_start..]
        .find(',')
        .map(|i| credential_start + i)
        .ok_or_else(|| CauldronError::Auth("Credential end not found in Authorization header".into()))?;

    let signature_start = header
        .find("Signature=")
        .ok_or_else(|| CauldronError::Auth("Signature not found in Authorization header".into()))?
        + "Signature=".len();
    let signature = header[signature_start..].trim();

    Ok((&header[credential_start..credential_end], signature))
}

/// Turns an identity token into transport authentication headers
#[async_trait]
pub trait HeaderSigner: Send + Sync {
    async fn sign(&self, token: &IdentityToken) -> Result<SignedHeaders>;
}

/// Derives headers from a pre-built, query-string-authenticated URL.
///
/// The identity token is ignored: the URL already carries the credential.
#[derive(Debug, Clone)]
pub struct PresignedUrlSigner {
    headers: SignedHeaders,
}

impl PresignedUrlSigner {
    pub fn new(presigned_url: &str) -> Result<Self> {
        Ok(Self {
            headers: headers_from_presigned_url(presigned_url)?,
        })
    }

    pub fn headers(&self) -> &SignedHeaders {
        &self.headers
    }
}

#[async_trait]
impl HeaderSigner for PresignedUrlSigner {
    async fn sign(&self, _token: &IdentityToken) -> Result<SignedHeaders> {
        Ok(self.headers.clone())
    }
}

/// Build `Authorization`/`X-Amz-Date`/`X-Amz-Security-Token` from the
/// `X-Amz-*` query parameters of a pre-signed URL.
pub fn headers_from_presigned_url(presigned_url: &str) -> Result<SignedHeaders> {
    let url = Url::parse(presigned_url)
        .map_err(|e| CauldronError::BadRequest(format!("Invalid pre-signed URL: {}", e)))?;

    let param = |name: &str| -> Result<String> {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| CauldronError::BadRequest(format!("Pre-signed URL lacks {}", name)))
    };

    let algorithm = param("X-Amz-Algorithm").unwrap_or_else(|_| DEFAULT_ALGORITHM.to_string());
    let credential = param("X-Amz-Credential")?;
    let date = param("X-Amz-Date")?;
    let token = param("X-Amz-Security-Token")?;
    let signature = param("X-Amz-Signature")?;

    Ok(SignedHeaders::new()
        .with(
            AUTHORIZATION,
            format!(
                "{} Credential={}, SignedHeaders={}, Signature={}",
                algorithm, credential, PRESIGNED_SIGNED_HEADERS, signature
            ),
        )
        .with(AMZ_DATE, date)
        .with(AMZ_SECURITY_TOKEN, token))
}

/// Hands out fixed headers, e.g. for a service that needs none
#[derive(Debug, Clone, Default)]
pub struct StaticSigner {
    headers: SignedHeaders,
}

impl StaticSigner {
    pub fn new(headers: SignedHeaders) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl HeaderSigner for StaticSigner {
    async fn sign(&self, _token: &IdentityToken) -> Result<SignedHeaders> {
        Ok(self.headers.clone())
    }
}

/// Placeholder until a session is given a pre-signed URL; always fails.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredSigner;

#[async_trait]
impl HeaderSigner for UnconfiguredSigner {
    async fn sign(&self, _token: &IdentityToken) -> Result<SignedHeaders> {
        Err(CauldronError::Auth(
            "No request signer configured, connect with a pre-signed URL first".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRESIGNED: &str = "wss://example.com/prod?X-Amz-Algorithm=AWS4-HMAC-SHA256\
        &X-Amz-Credential=ASIA123%2F20240101%2Feu-west-1%2Fexecute-api%2Faws4_request\
        &X-Amz-Date=20240101T000000Z&X-Amz-Security-Token=tok%2Ben\
        &X-Amz-Signature=deadbeef&X-Amz-SignedHeaders=host";

    #[test]
    fn test_headers_from_presigned_url() {
        let headers = headers_from_presigned_url(PRESIGNED).unwrap();
        assert_eq!(
            headers.get("authorization"),
            Some(
                "AWS4-HMAC-SHA256 Credential=ASIA123/20240101/eu-west-1/execute-api/aws4_request, \
                 SignedHeaders=host;x-amz-date;x-amz-security-token, Signature=deadbeef"
            )
        );
        assert_eq!(headers.get(AMZ_DATE), Some("20240101T000000Z"));
        assert_eq!(headers.get(AMZ_SECURITY_TOKEN), Some("tok+en"));
    }

    #[test]
    fn test_presigned_url_missing_signature() {
        let err = headers_from_presigned_url("wss://example.com/prod?X-Amz-Date=1").unwrap_err();
        assert!(matches!(err, CauldronError::BadRequest(_)));
        assert!(headers_from_presigned_url("not a url").is_err());
    }

    #[test]
    fn test_signed_url_from_headers() {
        let headers = headers_from_presigned_url(PRESIGNED).unwrap();
        let url = headers.signed_url("wss://example.com/prod").unwrap();

        assert!(url.starts_with("wss://example.com/prod?X-Amz-Algorithm=AWS4-HMAC-SHA256&"));
        assert!(url.contains(
            "X-Amz-Credential=ASIA123%2F20240101%2Feu-west-1%2Fexecute-api%2Faws4_request"
        ));
        assert!(url.contains("X-Amz-Security-Token=tok%2Ben"));
        assert!(url.ends_with("X-Amz-Signature=deadbeef"));

        // The rendered URL is itself usable as a pre-signed URL
        assert_eq!(headers_from_presigned_url(&url).unwrap(), headers);
    }

    #[test]
    fn test_signed_url_requires_authorization() {
        let headers = SignedHeaders::new().with(AMZ_DATE, "20240101T000000Z");
        assert!(headers.signed_url("wss://example.com").is_err());

        let headers = SignedHeaders::new().with(AUTHORIZATION, "AWS4-HMAC-SHA256 Signature=x");
        assert!(headers.signed_url("wss://example.com").is_err());
    }

    #[test]
    fn test_insert_replaces_case_insensitively() {
        let mut headers = SignedHeaders::new().with("X-Amz-Date", "a");
        headers.insert("x-amz-date", "b");
        assert_eq!(headers.iter().count(), 1);
        assert_eq!(headers.get(AMZ_DATE), Some("b"));
    }

    #[tokio::test]
    async fn test_unconfigured_signer_fails() {
        let token = IdentityToken::new("t");
        assert!(matches!(
            UnconfiguredSigner.sign(&token).await,
            Err(CauldronError::Auth(_))
        ));
        let signer = PresignedUrlSigner::new(PRESIGNED).unwrap();
        assert_eq!(&signer.sign(&token).await.unwrap(), signer.headers());
    }
}
