//! Bearer token authentication.
//!
//! # Configuration
//!
//! Set `DISTWS_TOKENS` (or pass `--tokens`) with format:
//! ```text
//! token1[:label];token2[:label]
//! ```
//!
//! # Example
//!
//! ```text
//! DISTWS_TOKENS="web-abc123:web;svc-token:billing;plain-token"
//! ```

use std::collections::HashMap;

use parking_lot::RwLock;

use super::Authenticator;
use crate::error::{Error, Result};

/// Validates bearer tokens against a configured set.
pub struct TokenAuthenticator {
    /// Map of token -> label used in logs
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenAuthenticator {
    /// Create an authenticator with no tokens. It rejects everything.
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Parse a `token[:label];...` list.
    ///
    /// Tokens without a label are labelled with their position.
    pub fn from_list(list: &str) -> Self {
        let auth = Self::new();

        for (index, entry) in list.split(';').enumerate() {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let (token, label) = match entry.split_once(':') {
                Some((token, label)) => (token.trim(), label.trim().to_string()),
                None => (entry, format!("token-{}", index)),
            };
            if !token.is_empty() {
                auth.register_token(token, label);
            }
        }

        auth
    }

    /// Register a token under a label.
    pub fn register_token(&self, token: impl Into<String>, label: impl Into<String>) {
        self.tokens.write().insert(token.into(), label.into());
    }

    /// Revoke a token.
    pub fn revoke_token(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }

    /// Check if a token is registered.
    pub fn is_valid(&self, token: &str) -> bool {
        self.tokens.read().contains_key(token)
    }

    /// Get the number of registered tokens.
    pub fn token_count(&self) -> usize {
        self.tokens.read().len()
    }
}

impl Default for TokenAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, credential: Option<&str>) -> Result<Option<String>> {
        let Some(token) = credential else {
            return Err(Error::Unauthorized("missing token".to_string()));
        };

        match self.tokens.read().get(token) {
            Some(label) => {
                tracing::debug!(label = %label, "token accepted");
                Ok(Some(token.to_string()))
            }
            None => Err(Error::Unauthorized("invalid token".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_authenticate() {
        let auth = TokenAuthenticator::new();
        auth.register_token("test-token", "tests");

        let result = auth.authenticate(Some("test-token")).unwrap();
        assert_eq!(result.as_deref(), Some("test-token"));
    }

    #[test]
    fn test_missing_and_unknown_tokens_rejected() {
        let auth = TokenAuthenticator::from_list("known");
        assert!(matches!(auth.authenticate(None), Err(Error::Unauthorized(_))));
        assert!(matches!(
            auth.authenticate(Some("unknown")),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_from_list() {
        let auth = TokenAuthenticator::from_list(" web-abc:web ; svc:billing;;plain ");
        assert_eq!(auth.token_count(), 3);
        assert!(auth.is_valid("web-abc"));
        assert!(auth.is_valid("svc"));
        assert!(auth.is_valid("plain"));
        assert!(!auth.is_valid("web"));
    }

    #[test]
    fn test_revoke_token() {
        let auth = TokenAuthenticator::new();
        auth.register_token("revocable", "tmp");
        assert!(auth.is_valid("revocable"));

        assert!(auth.revoke_token("revocable"));
        assert!(!auth.is_valid("revocable"));
        assert!(auth.authenticate(Some("revocable")).is_err());
    }
}
