//! Core error type for the fleet.
//!
//! Adapter crates map their platform-specific errors into [`Error::Api`]
//! with a classified [`ApiErrorKind`] so the retry executor, the health
//! monitor and the error notifier can branch on failure class without
//! string matching.

use std::fmt;

use fwdbot_store::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Credential rejected (401/Unauthorized). Never retried; escalated to
    /// superusers through the error notifier.
    Unauthorized,
    /// The destination chat is structurally gone: deleted group, bot
    /// blocked/kicked, chat not found. Never retried; the health monitor
    /// prunes the recipient.
    ChatGone,
    /// Flood control (429 / retry-after).
    FloodWait,
    /// Transport-level failure (timeout, connection reset, DNS).
    Network,
    /// Platform-side 5xx.
    Server,
    Other,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApiErrorKind::Unauthorized => "unauthorized",
            ApiErrorKind::ChatGone => "chat gone",
            ApiErrorKind::FloodWait => "flood wait",
            ApiErrorKind::Network => "network",
            ApiErrorKind::Server => "server",
            ApiErrorKind::Other => "api",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{kind} error: {message}")]
    Api { kind: ApiErrorKind, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("max retries exceeded after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn api(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Error::Api {
            kind,
            message: message.into(),
        }
    }

    /// Unwraps [`Error::RetryExhausted`] layers so callers classify the
    /// failure that actually happened on the wire.
    pub fn root(&self) -> &Error {
        match self {
            Error::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Transient failures worth another attempt: flood control, network
    /// trouble, platform 5xx. Everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Error::Api {
                kind: ApiErrorKind::FloodWait | ApiErrorKind::Network | ApiErrorKind::Server,
                ..
            }
        )
    }

    pub fn is_credential_invalid(&self) -> bool {
        matches!(
            self.root(),
            Error::Api {
                kind: ApiErrorKind::Unauthorized,
                ..
            }
        )
    }

    pub fn is_chat_gone(&self) -> bool {
        matches!(
            self.root(),
            Error::Api {
                kind: ApiErrorKind::ChatGone,
                ..
            }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::Store(StoreError::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::api(ApiErrorKind::FloodWait, "429").is_retryable());
        assert!(Error::api(ApiErrorKind::Network, "timeout").is_retryable());
        assert!(Error::api(ApiErrorKind::Server, "502").is_retryable());

        assert!(!Error::api(ApiErrorKind::Unauthorized, "401").is_retryable());
        assert!(!Error::api(ApiErrorKind::ChatGone, "chat not found").is_retryable());
        assert!(!Error::Validation("bad id".into()).is_retryable());
    }

    #[test]
    fn root_unwraps_exhausted_retries() {
        let err = Error::RetryExhausted {
            attempts: 3,
            source: Box::new(Error::api(ApiErrorKind::Unauthorized, "401")),
        };
        assert!(err.is_credential_invalid());
        assert!(!err.is_retryable());
    }
}
