use anyhow::Result;
use aws_config::BehaviorVersion;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use api::{AppState, create_router, repositories::PgPoiRepository};
use common::cache::{RedisConfig, RedisPool};
use common::database::{DatabaseConfig, init_pool};
use common::queue::JobQueue;
use common::queue::redis_backend::RedisBackend;
use common::settings::Settings;
use common::storage::S3Storage;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .init();

    info!("Starting API service");

    let settings = Settings::load()?;

    // Initialize database connection pool
    let db_config = DatabaseConfig::from_settings(&settings.database);
    let pool = init_pool(&db_config).await?;

    // Check database connectivity
    if common::database::health_check(&pool).await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }

    // Enqueue failures are tolerated per request, so a broker that is down
    // at startup is only logged
    let redis_config = RedisConfig::from_settings(&settings.redis);
    let redis = RedisPool::new(&redis_config).await?;
    match redis.health_check().await {
        Ok(true) => info!("Redis connection successful"),
        Ok(false) => warn!("Redis health check did not answer PONG"),
        Err(e) => warn!("Redis is unreachable, uploads will not be transcoded: {}", e),
    }
    let backend = RedisBackend::new(redis, &redis_config.key_prefix, &settings.queue.name);

    let aws = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let storage = S3Storage::new(
        aws_sdk_s3::Client::new(&aws),
        settings.storage.public_base_url.clone(),
    );

    let bind_address = settings.server.bind_address.clone();
    let app_state = AppState {
        storage: Arc::new(storage),
        pois: Arc::new(PgPoiRepository::new(pool)),
        queue: JobQueue::new(settings.queue.name.clone(), Arc::new(backend)),
        settings: Arc::new(settings),
    };

    // Start the web server
    let app = create_router(app_state);

    let listener = TcpListener::bind(&bind_address).await?;
    info!("API service listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
