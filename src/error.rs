//! Error types for provisioning and teardown.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning or releasing containers.
#[derive(Debug, Error)]
pub enum Error {
    /// The request failed validation; nothing was sent to the runtime.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The container runtime could not be reached.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Pulling the image failed.
    #[error("failed to resolve image {image}: {reason}")]
    ImageResolution { image: String, reason: String },

    /// A container with the requested name exists and override was not asked for.
    #[error("a container named {name} already exists")]
    ResourceConflict { name: String },

    /// The runtime rejected container creation.
    #[error("failed to create container from {image}: {reason}")]
    CreationFailed { image: String, reason: String },

    /// The runtime rejected container start.
    #[error("failed to start container {id}: {reason}")]
    StartFailed { id: String, reason: String },

    /// The container started but has no host binding for the declared port.
    #[error("no host binding for {port} on container {id}")]
    PortUnavailable { id: String, port: String },

    /// A runtime call failed in a way the caller did not classify further.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The container does not exist (anymore).
    #[error("no such container: {0}")]
    NotFound(String),

    /// The governing cancel token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A runtime command did not finish in time.
    #[error("`docker {command}` timed out")]
    TimedOut { command: String },

    /// Removing a container failed; it may still be running.
    #[error("failed to release container {id}: {reason}")]
    ReleaseFailed { id: String, reason: String },

    /// A provisioning step failed and cleaning up after it failed as well.
    #[error("{source}; releasing container {id} also failed: {release}")]
    Leaked {
        id: String,
        #[source]
        source: Box<Error>,
        release: Box<Error>,
    },

    /// One member of a fan-out failed. Every other member has been released,
    /// except the ids listed in `leaked`.
    #[error("provisioning request #{index} failed: {source}{}", leaked_suffix(.leaked))]
    Aggregate {
        index: usize,
        #[source]
        source: Box<Error>,
        leaked: Vec<String>,
    },

    /// Installing the termination signal handler failed.
    #[error("signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Config(#[from] serde_yaml::Error),
}

fn leaked_suffix(leaked: &[String]) -> String {
    if leaked.is_empty() {
        String::new()
    } else {
        format!(" (left running: {})", leaked.join(", "))
    }
}

impl Error {
    /// Re-tag an unclassified [`Error::Runtime`] with the step it happened in.
    /// Every other variant passes through untouched.
    pub(crate) fn classify(self, tag: impl FnOnce(String) -> Error) -> Error {
        match self {
            Error::Runtime(reason) => tag(reason),
            other => other,
        }
    }

    /// Returns true if this error was caused by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Leaked { source, .. } | Error::Aggregate { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// Ids of containers this error reports as still running.
    #[must_use]
    pub fn leaked(&self) -> Vec<String> {
        match self {
            Error::Leaked { id, .. } => vec![id.clone()],
            Error::Aggregate { leaked, .. } => leaked.clone(),
            _ => Vec::new(),
        }
    }
}
