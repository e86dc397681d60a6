//! Redis connectivity
//!
//! Redis is the broker behind the transcode queue. Job records are plain
//! string values; the list and sorted-set commands are issued by the queue
//! backend on a connection taken from here.

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::info;

use crate::settings::RedisSettings;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// e.g. `redis://localhost:6379`
    pub url: String,
    /// Prepended to every queue key
    pub key_prefix: String,
}

impl RedisConfig {
    /// Read `REDIS_URL` and `REDIS_KEY_PREFIX`, falling back to the defaults
    pub fn from_env() -> Result<Self> {
        let mut settings = RedisSettings::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            settings.url = url;
        }
        if let Ok(prefix) = std::env::var("REDIS_KEY_PREFIX") {
            settings.key_prefix = prefix;
        }
        Ok(Self::from_settings(&settings))
    }

    pub fn from_settings(settings: &RedisSettings) -> Self {
        Self {
            url: settings.url.clone(),
            key_prefix: settings.key_prefix.clone(),
        }
    }
}

/// Cloneable Redis handle
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
}

impl RedisPool {
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .with_context(|| format!("invalid Redis URL {}", config.url))?;
        info!("Redis client initialized with URL: {}", config.url);
        Ok(Self { client })
    }

    pub(crate) async fn get_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Store a string value, overwriting any previous one
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        Ok(conn.get(key).await?)
    }

    /// `true` when the server answers `PONG`
    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }
}
