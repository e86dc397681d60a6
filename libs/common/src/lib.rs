//! Common library for the media pipeline
//!
//! This crate provides shared functionality used across the pipeline
//! services and the playback client: configuration, database and Redis
//! connectivity, object storage, media probing, the durable transcode job
//! queue, and the wire models exchanged between them.

pub mod cache;
pub mod database;
pub mod error;
pub mod media;
pub mod probe;
pub mod queue;
pub mod settings;
pub mod storage;

/// Example wiring of the transcode queue on top of Redis
///
/// ```rust,no_run
/// use common::cache::{RedisConfig, RedisPool};
/// use common::media::TranscodeJob;
/// use common::queue::{JobQueue, redis_backend::RedisBackend};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = RedisConfig::from_env()?;
///     let pool = RedisPool::new(&config).await?;
///     let backend = RedisBackend::new(pool, &config.key_prefix, "transcode");
///     let queue: JobQueue<TranscodeJob> = JobQueue::new("transcode", Arc::new(backend));
///     println!("{:?}", queue.counts().await?);
///     Ok(())
/// }
/// ```
pub fn example_usage() {}
