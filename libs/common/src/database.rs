//! PostgreSQL pool holding the POI rendition lists

use crate::error::{DatabaseError, DatabaseResult};
use crate::settings::DatabaseSettings;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

/// Seconds a request waits for a free connection
const ACQUIRE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Read `DATABASE_URL` and `DATABASE_MAX_CONNECTIONS`, falling back to the defaults
    pub fn from_env() -> DatabaseResult<Self> {
        let mut settings = DatabaseSettings::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            settings.url = url;
        }
        if let Ok(raw) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            settings.max_connections = raw.parse().map_err(|_| {
                DatabaseError::Configuration(format!("DATABASE_MAX_CONNECTIONS is not a number: {}", raw))
            })?;
        }
        Ok(Self::from_settings(&settings))
    }

    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        Self {
            database_url: settings.url.clone(),
            max_connections: settings.max_connections,
        }
    }
}

pub async fn init_pool(config: &DatabaseConfig) -> DatabaseResult<PgPool> {
    let options = config
        .database_url
        .parse()
        .map_err(|e| DatabaseError::Configuration(format!("Invalid database URL: {}", e)))?;

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
        .connect_with(options)
        .await
        .map_err(DatabaseError::Connection)
}

/// Round trip a trivial query
pub async fn health_check(pool: &PgPool) -> DatabaseResult<bool> {
    let one: i32 = sqlx::query_scalar("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(DatabaseError::Query)?;
    Ok(one == 1)
}
