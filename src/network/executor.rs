//! Network executor
//!
//! Owns the HTTP transport, issues requests in a thread-safe way and routes
//! transport events through the task registry, the response classifier and
//! the token-refresh coordinator. One executor is constructed at startup
//! and handed to every collaborator; cloning shares the same instance.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Method;
use reqwest::header::{CACHE_CONTROL, HeaderMap, WWW_AUTHENTICATE};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{
    AccountCredentials, BasicAuthChallenge, HttpTokenExchange, TokenExchanging,
};
use crate::error::{ExecutorError, Result};
use crate::logging::{DiagnosticEvent, DiagnosticsSink, TracingDiagnostics};

use super::classifier::{
    Classification, CompletedExchange, FetchOutcome, ResponseClassifier, ResponseMeta,
    TransportFailure,
};
use super::refresh::{RefreshWaiter, TokenRefreshCoordinator};
use super::registry::{TaskId, TaskRegistry};
use super::request::{ApiRequest, CachePolicy, RequestBuilder};
use super::retry::with_backoff;

/// Default timeout applied to every request unless overridden at build
/// time.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport-level events, dispatched to the executor's handler in the
/// order the transport produces them: zero or more data chunks, an
/// optional challenge, then exactly one completion.
pub(crate) enum TransportEvent {
    DataReceived {
        task_id: TaskId,
        chunk: Vec<u8>,
    },
    ChallengeReceived {
        task_id: TaskId,
        request: ApiRequest,
        challenge: BasicAuthChallenge,
    },
    Completed {
        task_id: TaskId,
        request: ApiRequest,
        status: Option<u16>,
        headers: HeaderMap,
        transport_error: Option<TransportFailure>,
    },
}

/// What the transport loop should do after an event was handled.
#[derive(Debug, PartialEq, Eq)]
enum EventDisposition {
    Continue,
    Stop,
}

/// Cancellable handle for one issued request.
///
/// The handle keeps addressing its request even after a token-refresh
/// retry moved the underlying task to a new identifier.
pub struct TaskHandle {
    executor: NetworkExecutor,
    task_id: TaskId,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Cancels the underlying transport task and delivers a cancelled
    /// outcome to the completion. Does not cancel a refresh in progress;
    /// other waiters may still need it.
    pub fn cancel(&self) {
        let inner = &self.executor.inner;
        if let Some(entry) = inner.registry.remove(self.task_id) {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            info!(task_id = self.task_id, url = entry.url.as_str(), "Request cancelled");
            (entry.completion)(FetchOutcome::Failure(ExecutorError::Cancelled, None));
        }
    }
}

struct ExecutorInner {
    client: reqwest::Client,
    registry: TaskRegistry,
    classifier: ResponseClassifier,
    coordinator: TokenRefreshCoordinator,
    account: Arc<dyn AccountCredentials>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    pause: watch::Sender<bool>,
}

/// Thread-safe executor for authenticated requests against the library
/// content API.
#[derive(Clone)]
pub struct NetworkExecutor {
    inner: Arc<ExecutorInner>,
}

pub struct NetworkExecutorBuilder {
    account: Arc<dyn AccountCredentials>,
    request_timeout: Duration,
    exchange: Option<Arc<dyn TokenExchanging>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl NetworkExecutorBuilder {
    pub fn new(account: Arc<dyn AccountCredentials>) -> Self {
        Self {
            account,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            exchange: None,
            diagnostics: None,
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Substitutes the token-exchange implementation, mostly for tests.
    pub fn token_exchange(mut self, exchange: Arc<dyn TokenExchanging>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> Result<NetworkExecutor> {
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| {
                ExecutorError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        let exchange = self
            .exchange
            .unwrap_or_else(|| Arc::new(HttpTokenExchange::new(client.clone())));
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(TracingDiagnostics));
        let (pause, _) = watch::channel(false);

        Ok(NetworkExecutor {
            inner: Arc::new(ExecutorInner {
                client,
                registry: TaskRegistry::new(),
                classifier: ResponseClassifier::new(diagnostics.clone()),
                coordinator: TokenRefreshCoordinator::new(exchange),
                account: self.account,
                diagnostics,
                pause,
            }),
        })
    }
}

impl NetworkExecutor {
    pub fn builder(account: Arc<dyn AccountCredentials>) -> NetworkExecutorBuilder {
        NetworkExecutorBuilder::new(account)
    }

    /// Builds a request for the given URL from the current auth state.
    pub fn request_for(&self, url: Url, use_token_if_available: bool) -> ApiRequest {
        RequestBuilder::new(&*self.inner.account).build(url, use_token_if_available)
    }

    /// Issues a request. The completion is always called exactly once,
    /// whether the resource was fetched, the exchange failed, or the
    /// request was cancelled.
    pub fn execute(
        &self,
        request: ApiRequest,
        completion: impl FnOnce(FetchOutcome) + Send + 'static,
    ) -> TaskHandle {
        let task_id = self.inner.registry.allocate_id();
        self.inner
            .registry
            .insert(task_id, request.url().clone(), Box::new(completion));
        info!(task_id, url = request.url().as_str(), "Starting request");
        self.spawn_transport(request, task_id);
        TaskHandle {
            executor: self.clone(),
            task_id,
        }
    }

    // ------------------------------------------------------------------
    // Callback surface

    pub fn get_with_completion(
        &self,
        url: Url,
        use_token_if_available: bool,
        completion: impl FnOnce(FetchOutcome) + Send + 'static,
    ) -> TaskHandle {
        self.execute(self.request_for(url, use_token_if_available), completion)
    }

    pub fn put_with_completion(
        &self,
        url: Url,
        body: Option<Vec<u8>>,
        use_token_if_available: bool,
        completion: impl FnOnce(FetchOutcome) + Send + 'static,
    ) -> TaskHandle {
        let mut request = self
            .request_for(url, use_token_if_available)
            .with_method(Method::PUT);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        self.execute(request, completion)
    }

    pub fn post_with_completion(
        &self,
        url: Url,
        body: Vec<u8>,
        use_token_if_available: bool,
        completion: impl FnOnce(FetchOutcome) + Send + 'static,
    ) -> TaskHandle {
        let request = self
            .request_for(url, use_token_if_available)
            .with_method(Method::POST)
            .with_body(body);
        self.execute(request, completion)
    }

    pub fn delete_with_completion(
        &self,
        url: Url,
        use_token_if_available: bool,
        completion: impl FnOnce(FetchOutcome) + Send + 'static,
    ) -> TaskHandle {
        self.execute(
            self.request_for(url, use_token_if_available).with_method(Method::DELETE),
            completion,
        )
    }

    // ------------------------------------------------------------------
    // Async surface

    /// Performs a GET request, suspending until its completion fires.
    pub async fn get(&self, url: Url, use_token_if_available: bool) -> Result<Vec<u8>> {
        let request = self.request_for(url, use_token_if_available);
        Ok(self.execute_async(request).await?.0)
    }

    /// GET with an explicit cache policy, also returning response
    /// metadata.
    pub async fn get_with_cache_policy(
        &self,
        url: Url,
        cache_policy: CachePolicy,
        use_token_if_available: bool,
    ) -> Result<(Vec<u8>, Option<ResponseMeta>)> {
        let request = self
            .request_for(url, use_token_if_available)
            .with_cache_policy(cache_policy);
        self.execute_async(request).await
    }

    pub async fn put(
        &self,
        url: Url,
        body: Option<Vec<u8>>,
        use_token_if_available: bool,
    ) -> Result<Vec<u8>> {
        let mut request = self
            .request_for(url, use_token_if_available)
            .with_method(Method::PUT);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        Ok(self.execute_async(request).await?.0)
    }

    pub async fn post(
        &self,
        url: Url,
        body: Vec<u8>,
        use_token_if_available: bool,
    ) -> Result<Vec<u8>> {
        let request = self
            .request_for(url, use_token_if_available)
            .with_method(Method::POST)
            .with_body(body);
        Ok(self.execute_async(request).await?.0)
    }

    pub async fn delete(&self, url: Url, use_token_if_available: bool) -> Result<Vec<u8>> {
        let request = self
            .request_for(url, use_token_if_available)
            .with_method(Method::DELETE);
        Ok(self.execute_async(request).await?.0)
    }

    /// GET with bounded exponential backoff on transient failures, layered
    /// above the single-retry token-refresh mechanism.
    pub async fn get_with_retry(
        &self,
        url: Url,
        max_attempts: u32,
        use_token_if_available: bool,
    ) -> Result<Vec<u8>> {
        with_backoff(max_attempts, |_| {
            self.get(url.clone(), use_token_if_available)
        })
        .await
    }

    async fn execute_async(
        &self,
        request: ApiRequest,
    ) -> Result<(Vec<u8>, Option<ResponseMeta>)> {
        let (sender, receiver) = futures::channel::oneshot::channel();
        let _handle = self.execute(request, move |outcome| {
            let _ = sender.send(outcome);
        });
        match receiver.await {
            Ok(outcome) => outcome.into_result_with_meta(),
            // The completion was abandoned, which only happens when the
            // session was invalidated out from under the caller.
            Err(_) => Err(ExecutorError::Cancelled),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Holds back new dispatches, including queued refresh replays, until
    /// [`NetworkExecutor::resume_all_tasks`]. In-flight transfers drain.
    pub fn pause_all_tasks(&self) {
        let paused = self.inner.registry.set_all_paused(true);
        info!(tasks = paused.len(), "Pausing all tasks");
        let _ = self.inner.pause.send(true);
    }

    pub fn resume_all_tasks(&self) {
        let resumed = self.inner.registry.set_all_paused(false);
        info!(tasks = resumed.len(), "Resuming all tasks");
        let _ = self.inner.pause.send(false);
    }

    /// Invalidates the session: aborts every in-flight transport task and
    /// clears the registry. Pending completions are abandoned without
    /// being invoked; the abandonment is reported through diagnostics.
    pub fn clear_registry(&self) {
        let abandoned = self.inner.registry.clear();
        let count = abandoned.len();
        for entry in abandoned {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
        }
        if count > 0 {
            self.inner
                .diagnostics
                .report(DiagnosticEvent::SessionInvalidated { abandoned_tasks: count });
        }
    }

    /// Number of requests currently registered, including refresh waiters.
    pub fn pending_task_count(&self) -> usize {
        self.inner.registry.len()
    }

    // ------------------------------------------------------------------
    // Transport loop

    fn spawn_transport(&self, request: ApiRequest, task_id: TaskId) {
        let executor = self.clone();
        let handle = tokio::spawn(async move {
            executor.run_transport(request, task_id).await;
        });
        self.inner.registry.set_abort(task_id, handle.abort_handle());
    }

    async fn run_transport(&self, request: ApiRequest, task_id: TaskId) {
        // The pause gate is checked at dispatch, so tasks issued while
        // paused wait here until the executor resumes.
        let mut pause = self.inner.pause.subscribe();
        if *pause.borrow() {
            let _ = pause.wait_for(|paused| !*paused).await;
        }

        let mut builder = self
            .inner
            .client
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone());
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }
        if request.cache_policy() == CachePolicy::ReloadIgnoringCache {
            builder = builder.header(CACHE_CONTROL, "no-cache");
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                self.dispatch(TransportEvent::Completed {
                    task_id,
                    request,
                    status: None,
                    headers: HeaderMap::new(),
                    transport_error: Some(TransportFailure::from(&error)),
                });
                return;
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if let Some(challenge) = basic_challenge(status, &headers, &request) {
            let disposition = self.dispatch(TransportEvent::ChallengeReceived {
                task_id,
                request: request.clone(),
                challenge,
            });
            if disposition == EventDisposition::Stop {
                return;
            }
        }

        let mut transport_error = None;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    let disposition = self.dispatch(TransportEvent::DataReceived {
                        task_id,
                        chunk: bytes.to_vec(),
                    });
                    if disposition == EventDisposition::Stop {
                        // Nobody is waiting for this task anymore.
                        return;
                    }
                }
                Err(error) => {
                    transport_error = Some(TransportFailure::from(&error));
                    break;
                }
            }
        }

        self.dispatch(TransportEvent::Completed {
            task_id,
            request,
            status: Some(status),
            headers,
            transport_error,
        });
    }

    /// Single entry point for transport events. State machine per task:
    /// insert on issue, accumulate on data, classify and remove on
    /// completion.
    fn dispatch(&self, event: TransportEvent) -> EventDisposition {
        match event {
            TransportEvent::DataReceived { task_id, chunk } => {
                if self.inner.registry.append_data(task_id, &chunk) {
                    EventDisposition::Continue
                } else {
                    EventDisposition::Stop
                }
            }
            TransportEvent::ChallengeReceived { task_id, request, challenge } => {
                self.handle_challenge(task_id, request, challenge)
            }
            TransportEvent::Completed { task_id, request, status, headers, transport_error } => {
                self.handle_completed(task_id, request, status, headers, transport_error);
                EventDisposition::Stop
            }
        }
    }

    fn handle_challenge(
        &self,
        task_id: TaskId,
        request: ApiRequest,
        challenge: BasicAuthChallenge,
    ) -> EventDisposition {
        match self.inner.account.respond(&challenge) {
            Some(credential) => {
                debug!(task_id, "Answering basic-auth challenge");
                self.inner.registry.reset_data(task_id);
                self.spawn_transport(request.answering_challenge(&credential), task_id);
                EventDisposition::Stop
            }
            // Rejected challenge: fall through so the 401 is classified
            // like any other response.
            None => EventDisposition::Continue,
        }
    }

    fn handle_completed(
        &self,
        task_id: TaskId,
        request: ApiRequest,
        status: Option<u16>,
        headers: HeaderMap,
        transport_error: Option<TransportFailure>,
    ) {
        let Some(body) = self.inner.registry.take_data(task_id) else {
            self.inner.diagnostics.report(DiagnosticEvent::NoTaskInfoAvailable {
                task_id,
                url: Some(request.url().clone()),
            });
            return;
        };

        let exchange = CompletedExchange {
            url: request.url().clone(),
            status,
            headers,
            body,
            transport_error,
        };
        let classification = self
            .inner
            .classifier
            .classify(exchange, self.inner.account.uses_token_auth());

        match classification {
            Classification::NeedsRefresh => self.refresh_and_resume(request, task_id),
            Classification::Outcome(outcome) => {
                let Some(entry) = self.inner.registry.remove(task_id) else {
                    // Cancelled between classification and delivery; the
                    // cancelled outcome already reached the caller.
                    self.inner.diagnostics.report(DiagnosticEvent::NoTaskInfoAvailable {
                        task_id,
                        url: Some(request.url().clone()),
                    });
                    return;
                };
                let elapsed = entry.started_at.elapsed();
                info!(task_id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                (entry.completion)(outcome.into());
            }
        }
    }

    // ------------------------------------------------------------------
    // Refresh-and-retry

    fn refresh_and_resume(&self, request: ApiRequest, task_id: TaskId) {
        if request.has_retried() {
            // At most one retry per request, even under races.
            warn!(task_id, "Request already retried once, not refreshing again");
            self.fail_task(task_id, ExecutorError::Unauthorized);
            return;
        }

        let start_refresh = self
            .inner
            .coordinator
            .enqueue(RefreshWaiter { request, task_id });
        if start_refresh {
            self.inner.classifier.note_refresh_attempt();
            let executor = self.clone();
            tokio::spawn(async move {
                executor.run_refresh().await;
            });
        }
    }

    async fn run_refresh(&self) {
        let outcome = self
            .inner
            .coordinator
            .perform_exchange(&*self.inner.account)
            .await;

        match outcome {
            Ok(token) => {
                let expiry = token.expiry();
                self.inner.account.set_auth_token(token.access_token, expiry);

                let waiters = self.inner.coordinator.finish();
                self.inner.diagnostics.report(DiagnosticEvent::TokenRefreshSucceeded {
                    resumed_waiters: waiters.len(),
                });
                for waiter in waiters {
                    self.replay_waiter(waiter);
                }
            }
            Err(error) => {
                let waiters = self.inner.coordinator.finish();
                self.inner.diagnostics.report(DiagnosticEvent::TokenRefreshFailed {
                    failed_waiters: waiters.len(),
                    error: error.to_string(),
                });
                let terminal = match error {
                    ExecutorError::InvalidCredentials => ExecutorError::InvalidCredentials,
                    _ => ExecutorError::Unauthorized,
                };
                for waiter in waiters {
                    self.fail_task(waiter.task_id, terminal.clone());
                }
            }
        }
    }

    /// Re-issues one waiter after a successful refresh, moving its pending
    /// completion to the new task identifier.
    fn replay_waiter(&self, waiter: RefreshWaiter) {
        let retried = waiter.request.retried(&*self.inner.account);
        let new_task_id = self.inner.registry.allocate_id();
        if self.inner.registry.remap(waiter.task_id, new_task_id) {
            info!(
                old_task_id = waiter.task_id,
                task_id = new_task_id,
                url = retried.url().as_str(),
                "Replaying request after token refresh"
            );
            self.spawn_transport(retried, new_task_id);
        } else {
            // Cancelled while queued as a refresh waiter; its completion
            // already fired.
            debug!(task_id = waiter.task_id, "Refresh waiter vanished, skipping replay");
        }
    }

    fn fail_task(&self, task_id: TaskId, error: ExecutorError) {
        if let Some(entry) = self.inner.registry.remove(task_id) {
            (entry.completion)(FetchOutcome::Failure(error, None));
        } else {
            self.inner.diagnostics.report(DiagnosticEvent::NoTaskInfoAvailable {
                task_id,
                url: None,
            });
        }
    }
}

/// Extracts a basic-auth challenge from a 401 response.
///
/// Token-authenticated accounts never take this path; their 401s belong to
/// the refresh flow. A request that already answered a challenge is not
/// challenged again here; the account decides via `previous_failure_count`.
fn basic_challenge(
    status: u16,
    headers: &HeaderMap,
    request: &ApiRequest,
) -> Option<BasicAuthChallenge> {
    if status != 401 || request.uses_token() {
        return None;
    }
    let header = headers.get(WWW_AUTHENTICATE)?.to_str().ok()?;
    if !header.trim_start().starts_with("Basic") {
        return None;
    }

    // Parse `Basic realm="..."` parameters.
    let mut realm = None;
    if let Some(params) = header.trim_start().strip_prefix("Basic") {
        for param in params.split(',') {
            let param = param.trim();
            if let Some(eq) = param.find('=') {
                let key = param[..eq].trim();
                let value = param[eq + 1..].trim().trim_matches('"');
                if key.eq_ignore_ascii_case("realm") {
                    realm = Some(value.to_string());
                }
            }
        }
    }

    Some(BasicAuthChallenge {
        realm,
        url: request.url().clone(),
        previous_failure_count: request.challenge_count(),
    })
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use crate::auth::UserAccount;
    use crate::network::request::RequestBuilder;

    use super::*;

    fn request(use_token: bool) -> ApiRequest {
        let account = UserAccount::new();
        if use_token {
            account.set_auth_token("tok".into(), None);
        }
        RequestBuilder::new(&account)
            .build(Url::parse("https://api.example.org/book/1").unwrap(), use_token)
    }

    fn basic_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"library\", charset=\"UTF-8\""),
        );
        headers
    }

    #[test]
    fn test_basic_challenge_parsing() {
        let challenge = basic_challenge(401, &basic_headers(), &request(false)).unwrap();
        assert_eq!(challenge.realm.as_deref(), Some("library"));
        assert_eq!(challenge.previous_failure_count, 0);
    }

    #[test]
    fn test_no_challenge_for_token_requests() {
        assert!(basic_challenge(401, &basic_headers(), &request(true)).is_none());
    }

    #[test]
    fn test_no_challenge_without_header_or_on_success() {
        assert!(basic_challenge(401, &HeaderMap::new(), &request(false)).is_none());
        assert!(basic_challenge(200, &basic_headers(), &request(false)).is_none());
    }

    #[test]
    fn test_bearer_challenge_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Bearer realm=\"library\""),
        );
        assert!(basic_challenge(401, &headers, &request(false)).is_none());
    }
}
