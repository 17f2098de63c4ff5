//! Request and response values that cross the transport boundary.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::is_retryable_status;

/// Unique identifier of a logical request.
///
/// Retries of the same logical request reuse the id, which is what lets a
/// deduplicating transport guarantee at-most-once delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Request method. Decides whether a request is safe to repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Put,
    Delete,
    Post,
    Patch,
}

impl Method {
    /// Idempotent methods may be repeated without changing the outcome.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Self::Post | Self::Patch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Post => "POST",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request: `send(target, method, headers, payload)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub target: String,
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(
        id: RequestId,
        method: Method,
        target: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            target: target.into(),
            method,
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Adds a header, replacing any previous value under the same name.
    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Looks up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// The `(statusCode, payload)` pair a transport hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub payload: Vec<u8>,
}

impl Response {
    /// A `200` response carrying `payload`.
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: 200,
            payload,
        }
    }

    pub fn with_status(status: u16, payload: Vec<u8>) -> Self {
        Self { status, payload }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `true` for statuses that signal a temporary condition (5xx, 408, 429).
    pub fn is_retryable(&self) -> bool {
        is_retryable_status(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_idempotency() {
        assert!(Method::Get.is_idempotent());
        assert!(Method::Put.is_idempotent());
        assert!(Method::Delete.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Patch.is_idempotent());
    }

    #[test]
    fn test_request_with_header_replaces_value() {
        let req = Request::new(RequestId(1), Method::Get, "scores", Vec::new())
            .with_header("accept", "json")
            .with_header("accept", "binary");
        assert_eq!(req.header("accept"), Some("binary"));
        assert_eq!(req.header("missing"), None);
    }

    #[test]
    fn test_response_status_classes() {
        assert!(Response::ok(vec![]).is_success());
        assert!(!Response::with_status(404, vec![]).is_success());
        assert!(!Response::with_status(404, vec![]).is_retryable());
        assert!(Response::with_status(502, vec![]).is_retryable());
    }

    #[test]
    fn test_method_serializes_uppercase() {
        let json = serde_json::to_string(&Method::Post).unwrap();
        assert_eq!(json, "\"POST\"");
    }
}
