//! Authentication for Cauldron
//!
//! Provides:
//! - The `CredentialSource` capability the session engine depends on
//! - A token cache with a single-refresh policy (`CachedCredentials`)
//! - A Cognito user-pool `IdentityProvider`
//! - Bearer token helpers (identity claim, Authorization header parsing)

pub mod cognito;
pub mod credentials;
pub mod token;

pub use cognito::CognitoProvider;
pub use credentials::{
    AuthResult, CachedCredentials, CredentialSource, IdentityProvider, StaticCredentials,
};
pub use token::{extract_token_from_header, identity_claim, IdentityToken};
