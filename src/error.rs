//! Error taxonomy for a bulkflow run.
//!
//! Errors are split by how far they are allowed to travel:
//!
//! - **Configuration** ([`IngestError::Config`], [`IngestError::Auth`],
//!   [`IngestError::UnrecognizedInput`], [`IngestError::FormatMismatch`]) abort the
//!   run before (or as soon as) records would be processed.
//! - **Decode** ([`IngestError::Decode`]) follows the configured
//!   [`DecodePolicy`](crate::config::DecodePolicy).
//! - **Transport** ([`IngestError::Transport`], [`IngestError::Http`]) is retried by
//!   the dispatcher and demoted to a batch failure once retries are exhausted.
//!
//! Internal I/O helpers use `anyhow` with context strings and surface here as
//! [`IngestError::Other`].

use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("credentials rejected by {url}: {status} {body}")]
    Auth {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("unrecognized input: {0}")]
    UnrecognizedInput(String),

    #[error("format mismatch: {first} is {expected} but {path} is {found}")]
    FormatMismatch {
        first: String,
        expected: String,
        path: String,
        found: String,
    },

    #[error("decode error in {source_name} at record {position}: {message}")]
    Decode {
        source_name: String,
        position: u64,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline stage stopped: {0}")]
    Closed(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// True for errors that end the whole run rather than a single batch.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Auth { .. }
                | Self::UnrecognizedInput(_)
                | Self::FormatMismatch { .. }
                | Self::Decode { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
