//! Bearer-token authentication: RSA JWT verification against a cached JWKS.

pub mod claims;
pub mod jwks;
pub mod validator;

pub use claims::{ClaimRole, ParsedClaims};
pub use jwks::JwksCache;
pub use validator::TokenValidator;

use thiserror::Error;

/// Typed failures of token validation. Every variant maps to HTTP 401.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("invalid issuer")]
    InvalidIssuer,

    #[error("invalid audience")]
    InvalidAudience,

    #[error("token has no key id")]
    MissingKeyId,

    #[error("unknown signing key '{0}'")]
    UnknownKeyId(String),

    #[error("failed to fetch JWKS: {0}")]
    JwksFetchFailed(String),
}
