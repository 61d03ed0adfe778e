//! Fail-open / fail-closed handling of evaluation failures.
//!
//! Failures are classified where they happen (see [`FetchError::kind()`]); this module only
//! decides what the caller observes.
#[cfg(doc)]
use crate::error::FetchError;
use crate::{Error, FailureKind, Result};

/// What to do when an evaluation fails.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorPolicy<T> {
    /// Log the failure and return the contained default.
    FailOpen(T),
    /// Return the failure to the caller.
    FailClosed,
}

impl<T> From<Option<T>> for ErrorPolicy<T> {
    /// A supplied default means fail-open; no default means strict.
    fn from(default: Option<T>) -> Self {
        match default {
            Some(default) => ErrorPolicy::FailOpen(default),
            None => ErrorPolicy::FailClosed,
        }
    }
}

impl<T> ErrorPolicy<T> {
    /// Apply the policy to the outcome of evaluating `key`.
    pub fn resolve(self, key: &str, outcome: Result<T>) -> Result<T> {
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let kind = err.kind();
        match self {
            ErrorPolicy::FailOpen(default) => {
                // Unknown keys are an expected condition (e.g., a flag not created yet); anything
                // else points at the service or the network.
                if kind == Some(FailureKind::UnknownKey) {
                    log::debug!(target: "feature_flags",
                                key,
                                kind:serde = kind;
                                "key is unknown, returning default");
                } else {
                    log::warn!(target: "feature_flags",
                               key,
                               kind:serde = kind,
                               error:display = error_chain(&err);
                               "evaluation failed, returning default");
                }
                Ok(default)
            }
            ErrorPolicy::FailClosed => {
                log::debug!(target: "feature_flags",
                            key,
                            kind:serde = kind,
                            error:display = error_chain(&err);
                            "evaluation failed");
                Err(err)
            }
        }
    }
}

/// Render `err` and its sources as `outer: inner: ...`.
fn error_chain(err: &Error) -> String {
    let mut rendered = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
