//! Error types for the request executor

use std::fmt;

use crate::problem::ProblemDocument;

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Well-known transient transport failure kinds.
///
/// These are classified separately from generic transport errors so that
/// callers and telemetry can group them apart from "real" errors. Every
/// transient kind is eligible for backoff retry, none of them for the
/// token-refresh retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    /// The request timed out.
    Timeout,
    /// The connection was dropped mid-exchange.
    ConnectionLost,
    /// The host is unreachable, typically because the device is offline.
    Offline,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkErrorKind::Timeout => write!(f, "timeout"),
            NetworkErrorKind::ConnectionLost => write!(f, "connection lost"),
            NetworkErrorKind::Offline => write!(f, "offline"),
        }
    }
}

/// Uniform error taxonomy surfaced by every executor entry point.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    /// Recoverable network failure, eligible for backoff retry.
    #[error("Transient network error: {0}")]
    Transient(NetworkErrorKind),

    /// The caller cancelled the request. Never retried and never
    /// surfaced as an application error.
    #[error("Request cancelled")]
    Cancelled,

    /// The server returned a structured problem document.
    #[error("API error: {}", .0.title.as_deref().unwrap_or("unknown problem"))]
    Problem(ProblemDocument),

    /// Token refresh failed, or a request needing refresh had already
    /// been retried once. Terminal; typically triggers a sign-in prompt.
    #[error("Unauthorized after token refresh attempt")]
    Unauthorized,

    /// Refresh is impossible because the account has no stored
    /// username/password to exchange for a token.
    #[error("No credentials available for token refresh")]
    InvalidCredentials,

    /// Non-2xx response without a parseable problem document.
    #[error("HTTP {status} failure")]
    Http {
        status: u16,
        /// Response body, kept for diagnostics. Lossy UTF-8.
        body: String,
    },

    /// Transport failure that matches no well-known transient kind.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid executor or request configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ExecutorError {
    /// Whether the backoff retry layer should give up immediately.
    ///
    /// Unauthorized, forbidden, not-found and cancelled outcomes never
    /// change on retry; retrying them wastes a round trip and obscures
    /// the real failure.
    pub fn is_terminal_for_retry(&self) -> bool {
        match self {
            ExecutorError::Cancelled
            | ExecutorError::Unauthorized
            | ExecutorError::InvalidCredentials => true,
            ExecutorError::Http { status, .. } => matches!(status, 401 | 403 | 404),
            ExecutorError::Problem(problem) => {
                matches!(problem.status, Some(401) | Some(403) | Some(404))
            }
            _ => false,
        }
    }

    /// Whether this is a transient network failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Transient(_))
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        match transient_kind(&err) {
            Some(kind) => ExecutorError::Transient(kind),
            None => ExecutorError::Transport(err.to_string()),
        }
    }
}

impl From<url::ParseError> for ExecutorError {
    fn from(err: url::ParseError) -> Self {
        ExecutorError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        ExecutorError::Transport(format!("Malformed response payload: {}", err))
    }
}

/// Maps a transport error onto a well-known transient kind, if any.
///
/// Walks the source chain looking for the underlying IO error because
/// reqwest wraps hyper, which wraps the socket error that actually tells
/// us what happened.
pub fn transient_kind(err: &reqwest::Error) -> Option<NetworkErrorKind> {
    if err.is_timeout() {
        return Some(NetworkErrorKind::Timeout);
    }

    use std::error::Error;
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            return match io_err.kind() {
                ErrorKind::TimedOut => Some(NetworkErrorKind::Timeout),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => Some(NetworkErrorKind::ConnectionLost),
                ErrorKind::ConnectionRefused
                | ErrorKind::NotConnected
                | ErrorKind::NetworkUnreachable
                | ErrorKind::HostUnreachable => Some(NetworkErrorKind::Offline),
                _ => None,
            };
        }
        source = inner.source();
    }

    if err.is_connect() {
        // Connect failures without a visible IO source still mean the
        // host could not be reached.
        return Some(NetworkErrorKind::Offline);
    }
    if err.is_body() || err.is_request() {
        return Some(NetworkErrorKind::ConnectionLost);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem_with_status(status: Option<u16>) -> ExecutorError {
        ExecutorError::Problem(ProblemDocument {
            problem_type: Some("http://librarysimplified.org/terms/problem/loan-limit".into()),
            title: Some("Loan limit reached".into()),
            status,
            detail: None,
            instance: None,
        })
    }

    #[test]
    fn test_terminal_errors_are_not_retried() {
        assert!(ExecutorError::Cancelled.is_terminal_for_retry());
        assert!(ExecutorError::Unauthorized.is_terminal_for_retry());
        assert!(ExecutorError::InvalidCredentials.is_terminal_for_retry());
        assert!(ExecutorError::Http { status: 404, body: String::new() }.is_terminal_for_retry());
        assert!(ExecutorError::Http { status: 403, body: String::new() }.is_terminal_for_retry());
        assert!(problem_with_status(Some(401)).is_terminal_for_retry());
    }

    #[test]
    fn test_recoverable_errors_are_retried() {
        assert!(!ExecutorError::Transient(NetworkErrorKind::Timeout).is_terminal_for_retry());
        assert!(!ExecutorError::Http { status: 500, body: String::new() }.is_terminal_for_retry());
        assert!(!ExecutorError::Transport("reset by peer".into()).is_terminal_for_retry());
        assert!(!problem_with_status(Some(500)).is_terminal_for_retry());
    }
}
