//! Handshake authentication.
//!
//! An [`Authenticator`] inspects the credential a client presented on the
//! WebSocket handshake and either accepts it or rejects the upgrade.
//!
//! Credentials are read from `Authorization: Bearer <token>` first and from a
//! `?token=` query parameter second, since browsers cannot set headers on a
//! WebSocket handshake.

mod token_authenticator;

use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::error::Result;

pub use token_authenticator::TokenAuthenticator;

/// Decides whether a handshake may be upgraded.
pub trait Authenticator: Send + Sync {
    /// Check the presented credential, if any.
    ///
    /// Returns the accepted token (`None` for anonymous access) or
    /// [`Error::Unauthorized`](crate::error::Error::Unauthorized).
    fn authenticate(&self, credential: Option<&str>) -> Result<Option<String>>;
}

/// Accepts every handshake. Used when no tokens are configured.
#[derive(Debug, Clone, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, credential: Option<&str>) -> Result<Option<String>> {
        Ok(credential.map(str::to_string))
    }
}

/// Pick the credential out of a handshake request.
pub fn credential<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .unwrap_or(value)
                .trim()
        })
        .filter(|token| !token.is_empty());

    header.or(query_token.filter(|token| !token.is_empty()))
}
