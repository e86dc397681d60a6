//! Failure taxonomy of a transcode run

use common::error::{ProbeError, StorageError};
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum TranscodeError {
    /// The source could not be fetched to scratch
    #[error("Failed to download source {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Failed to probe source: {0}")]
    ProbeFailed(#[from] ProbeError),

    /// The source is too long; re-recording a shorter clip is the only fix
    #[error("Source is {duration:.1}s long, the limit is {limit:.0}s")]
    DurationExceeded { duration: f64, limit: f64 },

    #[error("Failed to encode {rendition} rendition: {source}")]
    EncodeFailed {
        rendition: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Failed to publish {key}: {source}")]
    PublishFailed {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Scratch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    /// Whether running the same job again can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TranscodeError::DurationExceeded { .. })
    }
}
