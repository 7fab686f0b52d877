//! Uniform result envelope returned by every tier operation.
//!
//! A `Status` is never an error by itself: a cache miss is a successful call
//! with a negative result, reported through [`StatusCode::NotFound`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Outcome classification carried by a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    /// Key absent from the tier ("not cached").
    NotFound,
    /// Tier unreachable: no node for the key, or the owning node did not answer.
    Unavailable,
    /// L1 full with no evictable victim.
    CapacityExhausted,
    /// Device/host copy failed.
    TransferFailed,
    /// Caller-supplied deadline elapsed.
    Timeout,
    InvalidArgument,
}

impl StatusCode {
    /// Whether a caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatusCode::Unavailable | StatusCode::TransferFailed | StatusCode::Timeout
        )
    }
}

/// Result of a tier operation: `{success, message, optional payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub success: bool,
    pub code: StatusCode,
    pub message: String,

    /// Block bytes for successful L2 reads. Never sent over the facade.
    #[serde(skip)]
    pub payload: Option<Bytes>,
}

impl Status {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: StatusCode::Ok,
            message: message.into(),
            payload: None,
        }
    }

    pub fn ok_with_payload(message: impl Into<String>, payload: Bytes) -> Self {
        Self {
            payload: Some(payload),
            ..Self::ok(message)
        }
    }

    pub fn failure(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
            payload: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::failure(StatusCode::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::failure(StatusCode::Unavailable, message)
    }

    /// True for a "not cached" outcome, as opposed to an unreachable tier.
    pub fn is_miss(&self) -> bool {
        !self.success && self.code == StatusCode::NotFound
    }

    /// Prefix the message with tier context, keeping code and payload.
    pub fn annotate(mut self, context: &str) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_is_distinct_from_unavailable() {
        let miss = Status::not_found("Key not found");
        let down = Status::unavailable("connection refused");

        assert!(miss.is_miss());
        assert!(!down.is_miss());
        assert!(!miss.code.is_retryable());
        assert!(down.code.is_retryable());
    }

    #[test]
    fn test_annotate_keeps_code() {
        let status = Status::ok("Stored on redis-0").annotate("promoted to L2");
        assert!(status.success);
        assert_eq!(status.message, "promoted to L2: Stored on redis-0");
    }

    #[test]
    fn test_payload_not_serialized() {
        let status = Status::ok_with_payload("Success", Bytes::from_static(b"abc"));
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("payload"));
        assert!(json.contains("\"code\":\"ok\""));
    }
}
