//! RFC 7807 problem document consumption
//!
//! Library-content servers report structured failures as problem documents.
//! This module only consumes them; rendering and persistence belong to the
//! surrounding application.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Content types that mark a response body as a problem document.
pub const PROBLEM_DOC_CONTENT_TYPES: [&str; 2] =
    ["application/problem+json", "application/api-problem+json"];

/// A structured, machine-readable error payload.
///
/// `problem_type` is a URI identifying the problem category and is what
/// callers branch on, for example distinguishing "no active loan" from
/// "invalid credentials". `title` and `detail` are human readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDocument {
    #[serde(rename = "type")]
    pub problem_type: Option<String>,
    pub title: Option<String>,
    pub status: Option<u16>,
    pub detail: Option<String>,
    pub instance: Option<String>,
}

impl ProblemDocument {
    /// Parses a problem document from a response body.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Whether the given content type declares a problem document payload.
    ///
    /// Media type parameters such as `charset` are ignored.
    pub fn matches_content_type(content_type: &str) -> bool {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        PROBLEM_DOC_CONTENT_TYPES.contains(&media_type.as_str())
    }

    /// Whether the problem category URI ends with the given suffix.
    pub fn has_type_suffix(&self, suffix: &str) -> bool {
        self.problem_type
            .as_deref()
            .map(|t| t.ends_with(suffix))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_document() {
        let body = br#"{
            "type": "http://librarysimplified.org/terms/problem/no-active-loan",
            "title": "No active loan",
            "status": 404,
            "detail": "You do not have an active loan for this book.",
            "instance": "/loans/42"
        }"#;
        let doc = ProblemDocument::from_slice(body).unwrap();
        assert_eq!(
            doc.problem_type.as_deref(),
            Some("http://librarysimplified.org/terms/problem/no-active-loan")
        );
        assert_eq!(doc.title.as_deref(), Some("No active loan"));
        assert_eq!(doc.status, Some(404));
        assert!(doc.has_type_suffix("no-active-loan"));
    }

    #[test]
    fn test_parse_tolerates_missing_fields() {
        let doc = ProblemDocument::from_slice(br#"{"title": "Nope"}"#).unwrap();
        assert_eq!(doc.title.as_deref(), Some("Nope"));
        assert_eq!(doc.problem_type, None);
        assert_eq!(doc.status, None);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(ProblemDocument::from_slice(b"<html>502</html>").is_err());
    }

    #[test]
    fn test_content_type_matching() {
        assert!(ProblemDocument::matches_content_type("application/problem+json"));
        assert!(ProblemDocument::matches_content_type("application/api-problem+json"));
        assert!(ProblemDocument::matches_content_type(
            "application/problem+json; charset=utf-8"
        ));
        assert!(ProblemDocument::matches_content_type("Application/Problem+JSON"));
        assert!(!ProblemDocument::matches_content_type("application/json"));
        assert!(!ProblemDocument::matches_content_type("text/html"));
    }
}
