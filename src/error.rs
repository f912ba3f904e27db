use thiserror::Error;

use crate::types::Category;

/// Errors surfaced by the API client, the resolver and the discovery engine.
///
/// Payloads are plain strings so a failed resolution can be stored in session
/// state and compared in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnigateError {
    #[error("invalid episode identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("no streaming servers available for this episode (tried {tried} identifier formats)")]
    NoServersAvailable { tried: usize },

    #[error("no video sources found on any server; this episode might not be available yet")]
    NoSourcesAvailable,

    #[error("no video sources available for server {server} ({category})")]
    NoSourcesForServer { server: String, category: Category },

    #[error("no server list has been resolved for this episode yet")]
    SessionNotResolved,

    #[error("upstream rejected the request (status {status}): {message}")]
    UpstreamClientError { status: u16, message: String },

    #[error("upstream server error (status {status}) after {attempts} attempt(s)")]
    UpstreamServerError { status: u16, attempts: usize },

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream reported failure: {0}")]
    UpstreamReportedFailure(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("resolution superseded by a newer episode")]
    Cancelled,
}

impl AnigateError {
    /// Failures worth retrying later, as opposed to content that is simply
    /// not there.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AnigateError::UpstreamServerError { .. }
                | AnigateError::UpstreamTimeout
                | AnigateError::NetworkError(_)
        )
    }

    /// One-line message for the terminal front-end.
    pub fn user_message(&self) -> String {
        if self.is_transient() {
            format!("Temporary problem reaching the anime API ({self}). Please retry.")
        } else {
            match self {
                AnigateError::NoServersAvailable { .. }
                | AnigateError::NoSourcesAvailable
                | AnigateError::NoSourcesForServer { .. } => {
                    format!("Nothing available yet: {self}. Please retry later.")
                }
                _ => format!("{self}. Please retry."),
            }
        }
    }
}

impl From<reqwest::Error> for AnigateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnigateError::UpstreamTimeout
        } else if err.is_decode() {
            AnigateError::Parse(err.to_string())
        } else {
            AnigateError::NetworkError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_distinguished_from_missing_content() {
        assert!(AnigateError::UpstreamTimeout.is_transient());
        assert!(
            AnigateError::UpstreamServerError {
                status: 503,
                attempts: 4
            }
            .is_transient()
        );
        assert!(!AnigateError::NoSourcesAvailable.is_transient());
        assert!(
            AnigateError::NoSourcesAvailable
                .user_message()
                .starts_with("Nothing available yet")
        );
        assert!(
            AnigateError::NetworkError("refused".into())
                .user_message()
                .contains("Please retry")
        );
    }
}
