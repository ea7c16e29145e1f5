//! Response classification
//!
//! Turns a completed transport exchange into a uniform outcome: success, a
//! structured problem-document failure, a transient network failure, or a
//! generic failure. A 401 on a token-authenticated account is signalled as
//! needing refresh rather than classified terminally.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use reqwest::header::{CONTENT_TYPE, HeaderMap};
use url::Url;

use crate::error::{ExecutorError, NetworkErrorKind, Result, transient_kind};
use crate::logging::{DiagnosticEvent, DiagnosticsSink};
use crate::problem::ProblemDocument;

/// How many refresh cycles this responder tolerates without an
/// intervening success before 401s stop routing to refresh. Reset after
/// any successful classification, so a persistently-misconfigured server
/// cannot cause unbounded refresh attempts while the normal
/// 401-refresh-retry cycle still works.
const TOKEN_REFRESH_ATTEMPT_CEILING: u32 = 2;

/// Response metadata handed to completions alongside the outcome.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: Option<u16>,
    pub headers: HeaderMap,
    pub url: Url,
}

/// Either-or result delivered to every completion handler.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Vec<u8>, Option<ResponseMeta>),
    Failure(ExecutorError, Option<ResponseMeta>),
}

impl FetchOutcome {
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            FetchOutcome::Success(body, _) => Ok(body),
            FetchOutcome::Failure(error, _) => Err(error),
        }
    }

    pub fn into_result_with_meta(self) -> Result<(Vec<u8>, Option<ResponseMeta>)> {
        match self {
            FetchOutcome::Success(body, meta) => Ok((body, meta)),
            FetchOutcome::Failure(error, _) => Err(error),
        }
    }
}

/// Transport-level failure, already mapped away from the client library's
/// error type so classification stays pure.
#[derive(Debug, Clone)]
pub enum TransportFailure {
    Transient(NetworkErrorKind),
    Other(String),
}

impl From<&reqwest::Error> for TransportFailure {
    fn from(err: &reqwest::Error) -> Self {
        match transient_kind(err) {
            Some(kind) => TransportFailure::Transient(kind),
            None => TransportFailure::Other(err.to_string()),
        }
    }
}

/// Everything known about one finished exchange.
#[derive(Debug)]
pub(crate) struct CompletedExchange {
    pub url: Url,
    pub status: Option<u16>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub transport_error: Option<TransportFailure>,
}

impl CompletedExchange {
    fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            status: self.status,
            headers: self.headers.clone(),
            url: self.url.clone(),
        }
    }

    fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// Terminal classification of one exchange.
#[derive(Debug)]
pub enum ClassifiedOutcome {
    Success {
        body: Vec<u8>,
        response: ResponseMeta,
    },
    Problem {
        problem: ProblemDocument,
        response: ResponseMeta,
    },
    Transient {
        kind: NetworkErrorKind,
    },
    HttpFailure {
        status: u16,
        body: Vec<u8>,
        response: ResponseMeta,
    },
    Transport {
        message: String,
    },
}

impl From<ClassifiedOutcome> for FetchOutcome {
    fn from(outcome: ClassifiedOutcome) -> Self {
        match outcome {
            ClassifiedOutcome::Success { body, response } => {
                FetchOutcome::Success(body, Some(response))
            }
            ClassifiedOutcome::Problem { problem, response } => {
                FetchOutcome::Failure(ExecutorError::Problem(problem), Some(response))
            }
            ClassifiedOutcome::Transient { kind } => {
                FetchOutcome::Failure(ExecutorError::Transient(kind), None)
            }
            ClassifiedOutcome::HttpFailure { status, body, response } => FetchOutcome::Failure(
                ExecutorError::Http {
                    status,
                    body: String::from_utf8_lossy(&body).into_owned(),
                },
                Some(response),
            ),
            ClassifiedOutcome::Transport { message } => {
                FetchOutcome::Failure(ExecutorError::Transport(message), None)
            }
        }
    }
}

/// Classification result: terminal, or a signal that the request should go
/// through the token-refresh path.
#[derive(Debug)]
pub(crate) enum Classification {
    Outcome(ClassifiedOutcome),
    NeedsRefresh,
}

pub(crate) struct ResponseClassifier {
    /// Per-responder count of refresh cycles, not per-request.
    auth_retry_count: AtomicU32,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl ResponseClassifier {
    pub fn new(diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            auth_retry_count: AtomicU32::new(0),
            diagnostics,
        }
    }

    /// Records that a refresh cycle was started on behalf of a 401.
    pub fn note_refresh_attempt(&self) {
        self.auth_retry_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Classifies a completed exchange.
    ///
    /// `token_auth` reports whether the current account authenticates with
    /// bearer tokens; only those take the refresh path on 401.
    pub fn classify(&self, exchange: CompletedExchange, token_auth: bool) -> Classification {
        if exchange.status == Some(401)
            && token_auth
            && self.auth_retry_count.load(Ordering::SeqCst) < TOKEN_REFRESH_ATTEMPT_CEILING
        {
            return Classification::NeedsRefresh;
        }

        // A problem document upgrades the outcome regardless of which
        // status bucket the exchange lands in.
        if let Some(content_type) = exchange.content_type() {
            if ProblemDocument::matches_content_type(content_type) {
                match ProblemDocument::from_slice(&exchange.body) {
                    Ok(problem) => {
                        return Classification::Outcome(ClassifiedOutcome::Problem {
                            problem,
                            response: exchange.meta(),
                        });
                    }
                    Err(parse_error) => {
                        // Degrade to the original transport/HTTP error so
                        // the real signal is preserved.
                        self.diagnostics.report(DiagnosticEvent::ProblemDocumentParseFailed {
                            url: exchange.url.clone(),
                            status: exchange.status,
                            parse_error: parse_error.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(failure) = &exchange.transport_error {
            return Classification::Outcome(match failure {
                TransportFailure::Transient(kind) => ClassifiedOutcome::Transient { kind: *kind },
                TransportFailure::Other(message) => ClassifiedOutcome::Transport {
                    message: message.clone(),
                },
            });
        }

        match exchange.status {
            Some(status) if (200..300).contains(&status) => {
                self.auth_retry_count.store(0, Ordering::SeqCst);
                Classification::Outcome(ClassifiedOutcome::Success {
                    response: exchange.meta(),
                    body: exchange.body,
                })
            }
            Some(status) => Classification::Outcome(ClassifiedOutcome::HttpFailure {
                status,
                response: exchange.meta(),
                body: exchange.body,
            }),
            None => Classification::Outcome(ClassifiedOutcome::Transport {
                message: "exchange finished without a response or an error".into(),
            }),
        }
    }
}
