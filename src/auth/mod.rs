//! Account credentials capability
//!
//! The executor never owns credential storage. It reads the current token
//! state through [`AccountCredentials`] and writes back exactly one field,
//! the bearer token, on a successful refresh.

pub mod account;
pub mod token;

use std::time::SystemTime;

use base64::Engine;
use url::Url;

pub use account::UserAccount;
pub use token::{HttpTokenExchange, TokenExchanging, TokenResponse};

/// A basic-auth challenge forwarded from the transport layer.
#[derive(Debug, Clone)]
pub struct BasicAuthChallenge {
    /// Protection space advertised by the server, if any.
    pub realm: Option<String>,
    /// URL of the request that was challenged.
    pub url: Url,
    /// How many times this request has already answered a challenge.
    pub previous_failure_count: u32,
}

/// Username/password pair used to answer a basic-auth challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredential {
    pub username: String,
    pub password: String,
}

impl BasicCredential {
    /// Value for an `Authorization` header carrying these credentials.
    pub fn authorization_header(&self) -> String {
        let login = format!("{}:{}", self.username, self.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(login.as_bytes());
        format!("Basic {}", encoded)
    }
}

/// Read access to the current account's auth state, plus the single
/// write-back of a freshly obtained token.
///
/// Implementations must be safe for many concurrent readers; the executor
/// only writes from the refresh-success path.
pub trait AccountCredentials: Send + Sync {
    /// The current bearer token, if one was ever obtained.
    fn auth_token(&self) -> Option<String>;

    /// Expiry instant of the current token. `None` means no recorded
    /// expiry, which is treated as not expired.
    fn token_expiry(&self) -> Option<SystemTime>;

    /// Username used for the token exchange, if stored.
    fn username(&self) -> Option<String>;

    /// Password used for the token exchange, if stored.
    fn password(&self) -> Option<String>;

    /// Token-exchange endpoint for this account, if the account
    /// authenticates with bearer tokens.
    fn token_url(&self) -> Option<Url>;

    /// Writes a freshly obtained token and its expiry.
    fn set_auth_token(&self, token: String, expiry: Option<SystemTime>);

    /// Resolves a basic-auth challenge. Returning `None` rejects it.
    fn respond(&self, challenge: &BasicAuthChallenge) -> Option<BasicCredential>;

    /// Whether this account authenticates with bearer tokens. Only
    /// token-based accounts take the 401 refresh path.
    fn uses_token_auth(&self) -> bool {
        self.token_url().is_some()
    }

    /// Whether the current token is past its expiry.
    fn is_token_expired(&self) -> bool {
        match self.token_expiry() {
            Some(expiry) => expiry <= SystemTime::now(),
            None => false,
        }
    }

    /// Token usable for an outbound request right now.
    fn valid_auth_token(&self) -> Option<String> {
        if self.is_token_expired() {
            return None;
        }
        self.auth_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credential_header_encoding() {
        let credential = BasicCredential {
            username: "patron".into(),
            password: "s3cret".into(),
        };
        // base64("patron:s3cret")
        assert_eq!(credential.authorization_header(), "Basic cGF0cm9uOnMzY3JldA==");
    }
}
