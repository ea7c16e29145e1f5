//! Outbound request construction
//!
//! Builds requests from a URL plus a snapshot of the account's auth state.
//! Pure; no network I/O happens here.

use reqwest::Method;
use reqwest::header::{
    ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT,
};
use url::Url;

use crate::auth::{AccountCredentials, BasicCredential};

/// User agent sent with every request issued by this executor.
pub const CUSTOM_USER_AGENT: &str =
    concat!("library-api-executor/", env!("CARGO_PKG_VERSION"));

/// Cache policy forwarded to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Let protocol caching headers decide.
    #[default]
    UseProtocolPolicy,
    /// Bypass any cached response for this request.
    ReloadIgnoringCache,
}

/// An outbound request. Immutable once issued; a retry produces a new
/// value via [`ApiRequest::retried`] with its headers recomputed from the
/// current auth state rather than carried over.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    cache_policy: CachePolicy,
    use_token: bool,
    has_retried: bool,
    challenge_count: u32,
}

impl ApiRequest {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Whether a bearer token was requested for this request.
    pub fn uses_token(&self) -> bool {
        self.use_token
    }

    /// Whether this request is the product of a refresh-and-retry cycle.
    /// The transition is one way; only the retry path sets it.
    pub fn has_retried(&self) -> bool {
        self.has_retried
    }

    /// How many basic-auth challenges this request has already answered.
    pub fn challenge_count(&self) -> u32 {
        self.challenge_count
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    /// The retried copy of this request, built after a successful token
    /// refresh. Headers are recomputed so the fresh token is picked up.
    pub fn retried(&self, account: &dyn AccountCredentials) -> ApiRequest {
        let mut retried = RequestBuilder::new(account).build(self.url.clone(), self.use_token);
        retried.method = self.method.clone();
        retried.body = self.body.clone();
        retried.cache_policy = self.cache_policy;
        retried.has_retried = true;
        retried
    }

    /// A copy of this request answering a basic-auth challenge.
    pub fn answering_challenge(&self, credential: &BasicCredential) -> ApiRequest {
        let mut answered = self.clone();
        if let Ok(value) = HeaderValue::from_str(&credential.authorization_header()) {
            answered.headers.insert(AUTHORIZATION, value);
        }
        answered.challenge_count += 1;
        answered
    }
}

/// Builds an [`ApiRequest`] from a URL and the current auth state.
pub struct RequestBuilder<'a> {
    account: &'a dyn AccountCredentials,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(account: &'a dyn AccountCredentials) -> Self {
        Self { account }
    }

    /// Builds a GET request for the given URL.
    ///
    /// Applies the custom user agent and forces `Accept-Language` empty, a
    /// historical decision that keeps servers from varying content by
    /// locale. If `use_token_if_available` and a non-expired bearer token
    /// exists, sets `Authorization` and a JSON content type.
    pub fn build(&self, url: Url, use_token_if_available: bool) -> ApiRequest {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CUSTOM_USER_AGENT));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(""));

        if use_token_if_available {
            if let Some(token) = self.account.valid_auth_token() {
                match HeaderValue::from_str(&format!("Bearer {}", token)) {
                    Ok(value) => {
                        headers.insert(AUTHORIZATION, value);
                        headers.insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static("application/json"),
                        );
                    }
                    Err(_) => {
                        tracing::warn!("Stored auth token is not a valid header value");
                    }
                }
            }
        }

        ApiRequest {
            url,
            method: Method::GET,
            headers,
            body: None,
            cache_policy: CachePolicy::default(),
            use_token: use_token_if_available,
            has_retried: false,
            challenge_count: 0,
        }
    }
}
