use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Represents a result type for operations in the feature flag client.
///
/// Strict evaluation calls (calls without a caller-supplied default) and lifecycle operations
/// return this type. Default-backed calls never fail and return plain values.
pub type Result<T> = std::result::Result<T, Error>;

/// The single error reported to callers.
///
/// Every failure that happens while talking to the flag service is normalized into
/// [`Error::Evaluation`], which carries the evaluated key and the classified cause. Use
/// [`Error::kind()`] to inspect the classification without matching on the cause.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A flag or experiment could not be evaluated and no default was supplied.
    #[error("failed to evaluate `{key}`")]
    Evaluation {
        /// Key of the flag or experiment.
        key: String,
        /// Classified cause.
        #[source]
        source: FetchError,
    },

    /// [`initialize()`](crate::initialize) has not been called, or the client was cleaned up.
    #[error("feature flag client is not initialized")]
    NotInitialized,

    /// The client handle refers to a core that has been cleaned up.
    #[error("feature flag client has been cleaned up")]
    Closed,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// A configuration value could not be read (e.g., a malformed environment variable).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An I/O error, e.g., the transport runtime failed to start.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Returns the failure classification if this error came from the flag service.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Error::Evaluation { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    pub(crate) fn evaluation(key: &str, source: FetchError) -> Error {
        Error::Evaluation {
            key: key.to_owned(),
            source,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// Classification of a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The flag service could not be reached.
    NetworkFailure,
    /// The request or the caller's wait took too long.
    Timeout,
    /// Non-success status or a malformed payload.
    BadResponse,
    /// The service reports that the key does not exist.
    UnknownKey,
}

/// A failure produced by the transport or the cache.
///
/// `FetchError` is shared between all callers waiting on the same coalesced fetch, so it is
/// `Clone`; causes that are not clonable are kept behind an `Arc`.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum FetchError {
    /// Connection-level failure.
    #[error("network failure")]
    NetworkFailure(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The request timed out, or the caller stopped waiting.
    #[error("request timed out")]
    Timeout,

    /// The service answered with a non-success status or a body that could not be decoded.
    #[error("bad response from flag service: {0}")]
    BadResponse(String),

    /// The service does not know the requested key.
    #[error("unknown key")]
    UnknownKey,
}

impl FetchError {
    /// Returns the classification of this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::NetworkFailure(_) => FailureKind::NetworkFailure,
            FetchError::Timeout => FailureKind::Timeout,
            FetchError::BadResponse(_) => FailureKind::BadResponse,
            FetchError::UnknownKey => FailureKind::UnknownKey,
        }
    }

    /// Build a [`FetchError::NetworkFailure`] from any error.
    pub fn network(err: impl std::error::Error + Send + Sync + 'static) -> FetchError {
        FetchError::NetworkFailure(Arc::new(err))
    }

    /// Return `true` if retrying the request may succeed.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, FetchError::NetworkFailure(_) | FetchError::Timeout)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            FetchError::Timeout
        } else if value.is_decode() {
            FetchError::BadResponse(value.without_url().to_string())
        } else if let Some(status) = value.status() {
            FetchError::BadResponse(format!("unexpected status {status}"))
        } else {
            FetchError::network(value.without_url())
        }
    }
}
