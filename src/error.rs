//! Error types for the controller runtime.

use thiserror::Error;

/// Errors that can occur while running controllers and webhooks.
#[derive(Debug, Error)]
pub enum Error {
    /// Handler process exited with a non-zero status.
    #[error("handler '{command}' exited with status {status}: {stderr}")]
    HandlerExit {
        /// Command that was executed.
        command: String,
        /// Exit status code, or -1 when killed by a signal.
        status: i32,
        /// Trailing standard error output.
        stderr: String,
    },

    /// Handler endpoint returned a non-2xx response.
    #[error("handler endpoint {url} returned {status}: {body}")]
    HandlerHttp {
        /// Endpoint URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Handler did not respond within its configured timeout.
    #[error("handler timed out after {0:?}")]
    HandlerTimeout(std::time::Duration),

    /// Handler transport failed before a response was produced.
    #[error("handler transport error: {0}")]
    Transport(String),

    /// Handler returned output that is not a valid state document.
    #[error("malformed handler output: {0}")]
    MalformedOutput(String),

    /// Write rejected because the object changed underneath us.
    #[error("conflict writing {kind}/{name}: stale resourceVersion")]
    Conflict {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
    },

    /// Handler returned a dependent the engine cannot apply.
    #[error("invalid dependent: {0}")]
    InvalidDependent(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A runtime invariant was violated; the controller cannot continue.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should be retried with backoff.
    ///
    /// Conflicts are retried immediately and invalid dependents are dropped
    /// until the next event, so neither counts as a backoff failure.
    pub fn requeues_with_backoff(&self) -> bool {
        !matches!(
            self,
            Error::Conflict { .. } | Error::InvalidDependent(_) | Error::Unrecoverable(_)
        )
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::Kube(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Map a Kubernetes API error on a specific object, turning a 409 into
/// [`Error::Conflict`] so the engine can requeue without backoff.
pub fn classify_api_error(err: kube::Error, kind: &str, name: &str) -> Error {
    if let kube::Error::Api(ref resp) = err {
        if resp.code == 409 {
            return Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            };
        }
    }
    Error::Kube(err)
}
