//! Typed errors for forge API calls
//!
//! The worker decides retry-vs-abort policy; this crate only classifies.
//! Transport-level retries (5xx, connection failures) happen inside the
//! client and are invisible to callers unless the retry budget is exhausted.

use thiserror::Error;

/// Error returned by every [`crate::ForgeClient`] operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// 404 - the resource does not exist (or was deleted under us).
    #[error("not found")]
    NotFound,

    /// 401 - the token is missing, expired or revoked.
    #[error("unauthorised")]
    Unauthorised,

    /// 403 - the bot lacks permission for this operation.
    #[error("forbidden")]
    Forbidden,

    /// 405 - the forge refuses the operation in the current MR state.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// 406 - the merge cannot be accepted (unapproved or unmergeable).
    #[error("not acceptable")]
    NotAcceptable,

    /// 409 - state conflict, e.g. the sha no longer matches the MR head.
    #[error("conflict")]
    Conflict,

    /// 422 with a reason the forge supplied.
    #[error("unprocessable: {reason}")]
    Unprocessable { reason: String },

    /// The MR is locked; historically a transient state.
    #[error("merge request is locked")]
    Locked,

    /// The response body could not be decoded as the expected shape.
    #[error("protocol error: {detail}")]
    Protocol { detail: String },

    /// Any other HTTP status the taxonomy above does not cover.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection-level failure after the transport retry budget ran out.
    #[error("network error: {0}")]
    Network(String),

    /// The 60s wall-clock request deadline elapsed.
    #[error("request timed out")]
    Timeout,
}

impl ClientError {
    /// Whether a fresh attempt at the same call could plausibly succeed.
    ///
    /// Used by the transport retry loop; semantic retries (restarting the
    /// merge from PREPARE) are the worker's business, not ours.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Network(_) | ClientError::Timeout | ClientError::Http { status: 500..=599, .. }
        )
    }
}

/// Result alias used throughout the client.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        assert!(ClientError::Http {
            status: 502,
            body: "bad gateway".into()
        }
        .is_transient());
        assert!(ClientError::Timeout.is_transient());
        assert!(ClientError::Network("reset".into()).is_transient());
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        assert!(!ClientError::NotFound.is_transient());
        assert!(!ClientError::Conflict.is_transient());
        assert!(!ClientError::Unprocessable {
            reason: "x".into()
        }
        .is_transient());
        assert!(!ClientError::Http {
            status: 400,
            body: String::new()
        }
        .is_transient());
    }
}
