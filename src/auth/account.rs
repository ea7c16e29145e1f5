//! In-memory account implementation
//!
//! Suitable for embedding and for tests. Real applications typically back
//! [`AccountCredentials`] with their own credential store.

use std::sync::RwLock;
use std::time::SystemTime;

use url::Url;

use super::{AccountCredentials, BasicAuthChallenge, BasicCredential};

#[derive(Debug, Default, Clone)]
struct AccountState {
    username: Option<String>,
    password: Option<String>,
    token_url: Option<Url>,
    auth_token: Option<String>,
    token_expiry: Option<SystemTime>,
}

/// Thread-safe in-memory credential store.
///
/// Single writer, many readers: the executor only writes the token field,
/// and only from the refresh-success path.
#[derive(Debug, Default)]
pub struct UserAccount {
    state: RwLock<AccountState>,
}

impl UserAccount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account that authenticates with bearer tokens exchanged at the
    /// given endpoint.
    pub fn with_token_url(token_url: Url) -> Self {
        let account = Self::new();
        account.write().token_url = Some(token_url);
        account
    }

    pub fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        let mut state = self.write();
        state.username = Some(username.into());
        state.password = Some(password.into());
    }

    pub fn set_token_url(&self, token_url: Url) {
        self.write().token_url = Some(token_url);
    }

    fn read(&self) -> AccountState {
        // A poisoned lock means a panic mid-write; the state itself is
        // still structurally sound.
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AccountState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AccountCredentials for UserAccount {
    fn auth_token(&self) -> Option<String> {
        self.read().auth_token
    }

    fn token_expiry(&self) -> Option<SystemTime> {
        self.read().token_expiry
    }

    fn username(&self) -> Option<String> {
        self.read().username
    }

    fn password(&self) -> Option<String> {
        self.read().password
    }

    fn token_url(&self) -> Option<Url> {
        self.read().token_url
    }

    fn set_auth_token(&self, token: String, expiry: Option<SystemTime>) {
        let mut state = self.write();
        state.auth_token = Some(token);
        state.token_expiry = expiry;
    }

    fn respond(&self, challenge: &BasicAuthChallenge) -> Option<BasicCredential> {
        // A second challenge for the same request means the stored
        // credentials were already rejected once; answering again would
        // loop.
        if challenge.previous_failure_count > 0 {
            return None;
        }
        let state = self.read();
        match (state.username, state.password) {
            (Some(username), Some(password)) => Some(BasicCredential { username, password }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn challenge() -> BasicAuthChallenge {
        BasicAuthChallenge {
            realm: Some("library".into()),
            url: Url::parse("https://api.example.org/loans").unwrap(),
            previous_failure_count: 0,
        }
    }

    #[test]
    fn test_token_expiry() {
        let account = UserAccount::new();
        account.set_auth_token("abc".into(), Some(SystemTime::now() + Duration::from_secs(60)));
        assert!(!account.is_token_expired());
        assert_eq!(account.valid_auth_token().as_deref(), Some("abc"));

        account.set_auth_token("abc".into(), Some(SystemTime::now() - Duration::from_secs(1)));
        assert!(account.is_token_expired());
        assert_eq!(account.valid_auth_token(), None);
    }

    #[test]
    fn test_token_without_expiry_is_valid() {
        let account = UserAccount::new();
        account.set_auth_token("abc".into(), None);
        assert!(!account.is_token_expired());
        assert_eq!(account.valid_auth_token().as_deref(), Some("abc"));
    }

    #[test]
    fn test_challenge_response_uses_stored_credentials() {
        let account = UserAccount::new();
        assert_eq!(account.respond(&challenge()), None);

        account.set_credentials("patron", "1234");
        let credential = account.respond(&challenge()).unwrap();
        assert_eq!(credential.username, "patron");
        assert_eq!(credential.password, "1234");
    }

    #[test]
    fn test_repeated_challenge_is_rejected() {
        let account = UserAccount::new();
        account.set_credentials("patron", "1234");
        let mut second = challenge();
        second.previous_failure_count = 1;
        assert_eq!(account.respond(&second), None);
    }

    #[test]
    fn test_uses_token_auth_requires_token_url() {
        let account = UserAccount::new();
        assert!(!account.uses_token_auth());
        account.set_token_url(Url::parse("https://auth.example.org/token").unwrap());
        assert!(account.uses_token_auth());
    }
}
