//! Library API Executor
//!
//! This crate implements an authenticated HTTP request executor for
//! library-content APIs: it issues requests, transparently refreshes
//! expired bearer tokens, retries requests that failed solely because of
//! token expiry, and reports every outcome through a uniform error
//! taxonomy, including server-supplied RFC 7807 problem documents.
//!
//! Guarantees held under concurrency: at most one token refresh is in
//! flight at any instant, no request is retried more than once, and every
//! issued request's completion fires exactly once, even when a retry moves
//! the request to a new transport task.

pub mod auth;
pub mod cli;
pub mod error;
pub mod logging;
pub mod network;
pub mod problem;

pub use auth::{AccountCredentials, UserAccount};
pub use error::{ExecutorError, NetworkErrorKind, Result};
pub use logging::{DiagnosticEvent, DiagnosticsSink};
pub use network::{
    ApiRequest, CachePolicy, FetchOutcome, NetworkExecutor, NetworkExecutorBuilder, TaskHandle,
};
pub use problem::ProblemDocument;
