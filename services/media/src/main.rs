use anyhow::Result;
use aws_config::BehaviorVersion;
use common::cache::{RedisConfig, RedisPool};
use common::media::TranscodeJob;
use common::queue::JobQueue;
use common::queue::redis_backend::RedisBackend;
use common::settings::Settings;
use common::storage::S3Storage;
use media::sweeper::start_stalled_sweep;
use media::{FfmpegEngine, SourceFetcher, TranscodeWorker, WorkerConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .init();

    info!("Starting transcoding worker");

    let settings = Settings::load()?;

    // Queue broker
    let redis_config = RedisConfig::from_settings(&settings.redis);
    let redis = RedisPool::new(&redis_config).await?;
    if !redis.health_check().await? {
        warn!("Redis health check did not answer PONG");
    }
    let backend = RedisBackend::new(redis, &redis_config.key_prefix, &settings.queue.name);
    let queue: JobQueue<TranscodeJob> = JobQueue::new(settings.queue.name.clone(), Arc::new(backend));

    // Object storage
    let aws = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let storage = S3Storage::new(
        aws_sdk_s3::Client::new(&aws),
        settings.storage.public_base_url.clone(),
    );

    let worker = TranscodeWorker::new(
        Arc::new(FfmpegEngine::new(&settings.worker)),
        Arc::new(storage),
        SourceFetcher::new(reqwest::Client::new(), settings.worker.scratch_root.clone()),
        WorkerConfig {
            bucket: settings.storage.media_bucket.clone(),
            fail_fast_on_fatal: settings.queue.fail_fast_on_fatal,
        },
    );

    let _sweeper = start_stalled_sweep(
        queue.clone(),
        settings.queue.stalled_timeout(),
        &settings.queue.stalled_sweep_schedule,
    )
    .await?;

    let shutdown = CancellationToken::new();
    let pool = {
        let queue = queue.clone();
        let options = settings.queue.worker_options();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { queue.process(Arc::new(worker), options, shutdown).await })
    };

    info!("Transcoding worker started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down transcoding worker, waiting for in-flight jobs");
    shutdown.cancel();
    pool.await?;

    Ok(())
}
