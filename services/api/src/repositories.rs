//! Rendition list of a POI
//!
//! The list of public video URLs on a POI is the only content metadata the
//! upload pipeline writes. It holds at most three URLs; appending a fourth
//! drops the oldest.

use anyhow::Result;
use async_trait::async_trait;
use common::media::push_rendition;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait PoiRepository: Send + Sync {
    /// Append `url` to the POI's rendition list.
    ///
    /// Returns the updated list, or `None` when the POI does not exist.
    async fn append_rendition(&self, poi_id: Uuid, url: &str) -> Result<Option<Vec<String>>>;

    /// Current rendition list, or `None` when the POI does not exist
    async fn renditions(&self, poi_id: Uuid) -> Result<Option<Vec<String>>>;
}

/// POI repository backed by the `pois` table
///
/// Expects `pois (id UUID PRIMARY KEY, video_urls TEXT[] NOT NULL DEFAULT '{}')`.
#[derive(Clone)]
pub struct PgPoiRepository {
    pool: PgPool,
}

impl PgPoiRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PoiRepository for PgPoiRepository {
    async fn append_rendition(&self, poi_id: Uuid, url: &str) -> Result<Option<Vec<String>>> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent notifies for the same POI
        let row = sqlx::query("SELECT video_urls FROM pois WHERE id = $1 FOR UPDATE")
            .bind(poi_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut urls: Vec<String> = row.get("video_urls");
        push_rendition(&mut urls, url.to_string());

        sqlx::query("UPDATE pois SET video_urls = $1 WHERE id = $2")
            .bind(&urls)
            .bind(poi_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(urls))
    }

    async fn renditions(&self, poi_id: Uuid) -> Result<Option<Vec<String>>> {
        let row = sqlx::query("SELECT video_urls FROM pois WHERE id = $1")
            .bind(poi_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("video_urls")))
    }
}

/// In-process POI store
#[derive(Default)]
pub struct MemoryPoiRepository {
    pois: Mutex<HashMap<Uuid, Vec<String>>>,
}

impl MemoryPoiRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a POI with an empty rendition list
    pub async fn insert(&self, poi_id: Uuid) {
        self.pois.lock().await.entry(poi_id).or_default();
    }
}

#[async_trait]
impl PoiRepository for MemoryPoiRepository {
    async fn append_rendition(&self, poi_id: Uuid, url: &str) -> Result<Option<Vec<String>>> {
        let mut pois = self.pois.lock().await;
        Ok(pois.get_mut(&poi_id).map(|urls| {
            push_rendition(urls, url.to_string());
            urls.clone()
        }))
    }

    async fn renditions(&self, poi_id: Uuid) -> Result<Option<Vec<String>>> {
        Ok(self.pois.lock().await.get(&poi_id).cloned())
    }
}
