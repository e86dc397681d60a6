//! Transcoding worker service
//!
//! Consumes the transcode queue, turns each uploaded source into the
//! renditions of its class and publishes them to object storage.

pub mod engine;
pub mod error;
pub mod fetcher;
pub mod sweeper;
pub mod worker;

pub use engine::{FfmpegEngine, TranscodeEngine};
pub use error::TranscodeError;
pub use fetcher::SourceFetcher;
pub use worker::{TranscodeWorker, WorkerConfig};
