//! Token refresh coordination
//!
//! Serializes token-refresh attempts: at most one token-exchange call is in
//! flight process-wide. Requests that need a refresh while one is running
//! enqueue themselves as waiters and are replayed, or failed uniformly,
//! once the in-flight refresh resolves.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::auth::{AccountCredentials, TokenExchanging, TokenResponse};
use crate::error::{ExecutorError, Result};

use super::registry::TaskId;
use super::request::ApiRequest;

/// A request awaiting the in-flight refresh. Its completion handler stays
/// registered in the task registry under `task_id` for the whole wait.
pub(crate) struct RefreshWaiter {
    pub request: ApiRequest,
    pub task_id: TaskId,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<RefreshWaiter>,
}

/// Refresh state machine: `idle -> refreshing -> idle`.
///
/// The guarded state is distinct from the task registry's lock; refresh
/// completion work never holds both at once.
pub(crate) struct TokenRefreshCoordinator {
    state: Mutex<RefreshState>,
    exchange: Arc<dyn TokenExchanging>,
}

impl TokenRefreshCoordinator {
    pub fn new(exchange: Arc<dyn TokenExchanging>) -> Self {
        Self {
            state: Mutex::new(RefreshState::default()),
            exchange,
        }
    }

    /// Appends a waiter to the FIFO queue. Returns true when the queue was
    /// idle, in which case the caller owns starting the single refresh.
    pub fn enqueue(&self, waiter: RefreshWaiter) -> bool {
        let mut state = self.lock();
        state.waiters.push(waiter);
        if state.refreshing {
            false
        } else {
            state.refreshing = true;
            true
        }
    }

    /// Drains every queued waiter and transitions back to idle, in one
    /// step so no waiter can slip between the drain and the transition.
    pub fn finish(&self) -> Vec<RefreshWaiter> {
        let mut state = self.lock();
        state.refreshing = false;
        std::mem::take(&mut state.waiters)
    }

    #[cfg(test)]
    pub fn is_refreshing(&self) -> bool {
        self.lock().refreshing
    }

    /// The one token-exchange network call for this refresh cycle.
    ///
    /// Fails fast with invalid credentials when the account has no stored
    /// username/password; no retry is possible without them.
    pub async fn perform_exchange(
        &self,
        account: &dyn AccountCredentials,
    ) -> Result<TokenResponse> {
        let token_url = account.token_url().ok_or(ExecutorError::InvalidCredentials)?;
        let (username, password) = match (account.username(), account.password()) {
            (Some(username), Some(password)) => (username, password),
            _ => return Err(ExecutorError::InvalidCredentials),
        };
        self.exchange.exchange(&token_url, &username, &password).await
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use reqwest::Method;
    use url::Url;

    use crate::auth::UserAccount;
    use crate::network::request::RequestBuilder;

    use super::*;

    struct StubExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenExchanging for StubExchange {
        async fn exchange(
            &self,
            _token_url: &Url,
            _username: &str,
            _password: &str,
        ) -> Result<TokenResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::from_str(r#"{"accessToken":"fresh","expiresIn":3600}"#).unwrap())
        }
    }

    fn waiter(account: &UserAccount, task_id: TaskId) -> RefreshWaiter {
        let request = RequestBuilder::new(account)
            .build(Url::parse("https://api.example.org/loans").unwrap(), true)
            .with_method(Method::GET);
        RefreshWaiter { request, task_id }
    }

    fn coordinator() -> (TokenRefreshCoordinator, Arc<StubExchange>) {
        let exchange = Arc::new(StubExchange { calls: AtomicUsize::new(0) });
        (TokenRefreshCoordinator::new(exchange.clone()), exchange)
    }

    #[test]
    fn test_only_first_enqueue_starts_the_refresh() {
        let (coordinator, _) = coordinator();
        let account = UserAccount::new();

        assert!(coordinator.enqueue(waiter(&account, 1)));
        assert!(!coordinator.enqueue(waiter(&account, 2)));
        assert!(!coordinator.enqueue(waiter(&account, 3)));
        assert!(coordinator.is_refreshing());

        let drained = coordinator.finish();
        assert_eq!(drained.len(), 3);
        assert_eq!(
            drained.iter().map(|w| w.task_id).collect::<Vec<_>>(),
            vec![1, 2, 3],
            "waiters drain in FIFO order"
        );
        assert!(!coordinator.is_refreshing());

        // Idle again: the next 401 starts a new cycle.
        assert!(coordinator.enqueue(waiter(&account, 4)));
    }

    #[tokio::test]
    async fn test_exchange_fails_fast_without_credentials() {
        let (coordinator, exchange) = coordinator();
        let account = UserAccount::with_token_url(
            Url::parse("https://auth.example.org/token").unwrap(),
        );

        let err = coordinator.perform_exchange(&account).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidCredentials));
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exchange_fails_fast_without_token_url() {
        let (coordinator, exchange) = coordinator();
        let account = UserAccount::new();
        account.set_credentials("patron", "1234");

        let err = coordinator.perform_exchange(&account).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidCredentials));
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exchange_uses_stored_credentials() {
        let (coordinator, exchange) = coordinator();
        let account = UserAccount::with_token_url(
            Url::parse("https://auth.example.org/token").unwrap(),
        );
        account.set_credentials("patron", "1234");

        let token = coordinator.perform_exchange(&account).await.unwrap();
        assert_eq!(token.access_token, "fresh");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }
}
