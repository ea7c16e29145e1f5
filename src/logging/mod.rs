//! Diagnostics reporting
//!
//! Conditions that have no waiting caller, such as a completion arriving for
//! an unknown task, are reported here instead of being surfaced. The sink is
//! an external collaborator; the default implementation forwards to
//! `tracing`.

use url::Url;

use crate::network::registry::TaskId;

/// Diagnostic-only conditions observed by the executor.
#[derive(Debug, Clone)]
pub enum DiagnosticEvent {
    /// The transport delivered a completion for a task identifier with no
    /// registered entry. No completion closure could be called. Known to
    /// happen after session-invalidation races; non-fatal.
    NoTaskInfoAvailable {
        task_id: TaskId,
        url: Option<Url>,
    },
    /// The registry was cleared and the listed number of pending
    /// completions were abandoned without being invoked.
    SessionInvalidated { abandoned_tasks: usize },
    /// A response declared a problem-document content type but its body
    /// failed to parse. The caller received the original error instead.
    ProblemDocumentParseFailed {
        url: Url,
        status: Option<u16>,
        parse_error: String,
    },
    /// A token refresh finished and the listed number of waiters were
    /// re-issued.
    TokenRefreshSucceeded { resumed_waiters: usize },
    /// A token refresh failed and the listed number of waiters were failed
    /// uniformly.
    TokenRefreshFailed {
        failed_waiters: usize,
        error: String,
    },
}

/// Receiver for diagnostic events.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, event: DiagnosticEvent);
}

/// Default sink that logs through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, event: DiagnosticEvent) {
        match event {
            DiagnosticEvent::NoTaskInfoAvailable { task_id, url } => {
                tracing::error!(
                    task_id,
                    url = url.as_ref().map(Url::as_str),
                    "No task info available; completion closure could not be called"
                );
            }
            DiagnosticEvent::SessionInvalidated { abandoned_tasks } => {
                tracing::error!(abandoned_tasks, "Session invalidated, registry cleared");
            }
            DiagnosticEvent::ProblemDocumentParseFailed { url, status, parse_error } => {
                tracing::warn!(
                    url = url.as_str(),
                    status,
                    parse_error,
                    "Problem document content type declared but body failed to parse"
                );
            }
            DiagnosticEvent::TokenRefreshSucceeded { resumed_waiters } => {
                tracing::info!(resumed_waiters, "Token refresh succeeded");
            }
            DiagnosticEvent::TokenRefreshFailed { failed_waiters, error } => {
                tracing::warn!(failed_waiters, error, "Token refresh failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use super::{DiagnosticEvent, DiagnosticsSink};

    /// Sink that records events for assertions.
    #[derive(Default)]
    pub struct RecordingDiagnostics {
        events: Mutex<Vec<DiagnosticEvent>>,
    }

    impl RecordingDiagnostics {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn events(&self) -> Vec<DiagnosticEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl DiagnosticsSink for RecordingDiagnostics {
        fn report(&self, event: DiagnosticEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
