//! Error taxonomy shared by the fetch collaborator, the manifest reader and
//! the orchestrator.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// How the orchestrator must react to a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retry the same video after the backoff interval.
    Transient,
    /// Stop the whole run; the platform is refusing us.
    FatalBlock,
    /// Skip this video without retrying.
    NonRetriableItem,
}

/// Classified failure returned by a [`crate::fetch::Fetcher`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("blocked by platform: {message}")]
    FatalBlock { message: String },

    #[error("video not downloadable: {message}")]
    NonRetriableItem { message: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Transient { .. } => ErrorKind::Transient,
            FetchError::FatalBlock { .. } => ErrorKind::FatalBlock,
            FetchError::NonRetriableItem { .. } => ErrorKind::NonRetriableItem,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            FetchError::Transient { message }
            | FetchError::FatalBlock { message }
            | FetchError::NonRetriableItem { message } => message,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Transient {
            message: message.into(),
        }
    }

    pub fn fatal_block(message: impl Into<String>) -> Self {
        FetchError::FatalBlock {
            message: message.into(),
        }
    }

    pub fn non_retriable(message: impl Into<String>) -> Self {
        FetchError::NonRetriableItem {
            message: message.into(),
        }
    }
}

/// Failures while turning a manifest file into a list of video ids.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single line could not be used. Reported as a warning, never fatal.
    #[error("malformed manifest line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("manifest {path} yielded no video ids")]
    Empty { path: PathBuf },
}
