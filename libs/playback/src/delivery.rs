//! Adaptive delivery
//!
//! Picks the rendition to play from the cache contents and the latest
//! network sample, and drives the player state machine around it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::network::NetworkSample;

/// Renditions published for one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSources {
    /// Segmented playlist, or the raw upload before transcoding finished
    pub primary: String,
    pub low_bitrate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    Cache,
    Streaming,
    LowBitrate,
    Unavailable,
}

/// Outcome of one source resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub kind: SourceKind,
    /// `None` only when unavailable
    pub url: Option<String>,
    /// Rendition to fetch into the cache while streaming
    pub background_cache: Option<String>,
}

impl Resolution {
    fn play(kind: SourceKind, url: &str) -> Self {
        Self {
            kind,
            url: Some(url.to_string()),
            background_cache: None,
        }
    }
}

/// Choose what to play.
///
/// In order: a cached primary, a cached low-bitrate copy when offline, the
/// live stream on a fast network (caching a copy in the background), the
/// low-bitrate rendition on a slow one, the primary as a last online resort,
/// and otherwise nothing.
pub fn resolve_source(
    sources: &MediaSources,
    network: &NetworkSample,
    primary_cached: bool,
    low_bitrate_cached: bool,
) -> Resolution {
    if primary_cached {
        return Resolution::play(SourceKind::Cache, &sources.primary);
    }

    if !network.is_online() {
        return match &sources.low_bitrate {
            Some(low) if low_bitrate_cached => Resolution::play(SourceKind::Cache, low),
            _ => Resolution {
                kind: SourceKind::Unavailable,
                url: None,
                background_cache: None,
            },
        };
    }

    if !network.is_slow_network() {
        let background_cache = match &sources.low_bitrate {
            Some(low) if low_bitrate_cached => None,
            Some(low) => Some(low.clone()),
            None => Some(sources.primary.clone()),
        };
        return Resolution {
            background_cache,
            ..Resolution::play(SourceKind::Streaming, &sources.primary)
        };
    }

    match &sources.low_bitrate {
        Some(low) => Resolution::play(SourceKind::LowBitrate, low),
        None => Resolution::play(SourceKind::Streaming, &sources.primary),
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server answered {0}")]
    Status(u16),

    #[error("Body exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

/// Downloads a rendition for caching
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Bytes, DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Bytes, DeliveryError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::Status(response.status().as_u16()));
        }
        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(DeliveryError::TooLarge { limit: max_bytes });
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (body.len() + chunk.len()) as u64 > max_bytes {
                return Err(DeliveryError::TooLarge { limit: max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// What the player shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PlayerState {
    /// Not yet visible
    Idle,
    Detecting,
    Transitioning { from: SourceKind },
    Playing { kind: SourceKind, url: String },
    OfflineUnavailable,
    Failed { reason: String },
}

#[derive(Debug, Default)]
struct PlayerInner {
    visible: bool,
    /// Bumped by every resolution; stale resolutions do not publish
    generation: u64,
    network: Option<NetworkSample>,
    fell_back: bool,
    current: Option<(SourceKind, String)>,
}

pub struct Player {
    sources: MediaSources,
    cache: Arc<ContentCache>,
    fetcher: Arc<dyn MediaFetcher>,
    inner: Mutex<PlayerInner>,
    state_tx: watch::Sender<PlayerState>,
}

impl Player {
    pub fn new(
        sources: MediaSources,
        cache: Arc<ContentCache>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(PlayerState::Idle);
        Arc::new(Self {
            sources,
            cache,
            fetcher,
            inner: Mutex::new(PlayerInner::default()),
            state_tx,
        })
    }

    pub fn state(&self) -> PlayerState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state_tx.subscribe()
    }

    fn inner(&self) -> MutexGuard<'_, PlayerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolution starts only once the player is on screen
    pub async fn set_visible(self: &Arc<Self>, visible: bool) {
        let resolve = {
            let mut inner = self.inner();
            let appeared = visible && !inner.visible;
            inner.visible = visible;
            if appeared && inner.network.is_none() {
                self.state_tx.send_replace(PlayerState::Detecting);
            }
            appeared && inner.network.is_some()
        };
        if resolve {
            self.resolve().await;
        }
    }

    /// Re-resolve when the network classification changes.
    ///
    /// A sample in the same class only refreshes the reading. A new class
    /// also restores the one-tier fallback allowance.
    pub async fn on_network_change(self: &Arc<Self>, sample: NetworkSample) {
        let resolve = {
            let mut inner = self.inner();
            let changed = inner
                .network
                .as_ref()
                .is_none_or(|current| !current.same_classification(&sample));
            if changed {
                inner.fell_back = false;
            }
            inner.network = Some(sample);
            inner.visible && changed
        };
        if resolve {
            self.resolve().await;
        }
    }

    /// Drop one tier after a network error while streaming, then give up.
    ///
    /// The lower tier is kept until the network classification changes.
    pub fn on_playback_error(&self, reason: &str) -> PlayerState {
        let mut inner = self.inner();
        let streaming = matches!(inner.current, Some((SourceKind::Streaming, _)));

        let next = match &self.sources.low_bitrate {
            Some(low) if streaming && !inner.fell_back => {
                info!("Playback error while streaming ({}), falling back to low bitrate", reason);
                inner.fell_back = true;
                inner.generation += 1;
                inner.current = Some((SourceKind::LowBitrate, low.clone()));
                self.state_tx.send_replace(PlayerState::Transitioning {
                    from: SourceKind::Streaming,
                });
                PlayerState::Playing {
                    kind: SourceKind::LowBitrate,
                    url: low.clone(),
                }
            }
            _ => {
                warn!("Playback failed: {}", reason);
                inner.current = None;
                PlayerState::Failed {
                    reason: reason.to_string(),
                }
            }
        };

        self.state_tx.send_replace(next.clone());
        next
    }

    async fn resolve(self: &Arc<Self>) {
        let (generation, sample) = {
            let mut inner = self.inner();
            let Some(sample) = inner.network.clone() else {
                return;
            };
            inner.generation += 1;
            let pending = match &inner.current {
                Some((from, _)) => PlayerState::Transitioning { from: *from },
                None => PlayerState::Detecting,
            };
            self.state_tx.send_replace(pending);
            (inner.generation, sample)
        };

        let primary_cached = self.cache.is_cached(&self.sources.primary).await;
        let low_bitrate_cached = match &self.sources.low_bitrate {
            Some(url) => self.cache.is_cached(url).await,
            None => false,
        };
        let mut resolution =
            resolve_source(&self.sources, &sample, primary_cached, low_bitrate_cached);

        {
            let mut inner = self.inner();
            if inner.generation != generation {
                debug!("Resolution superseded");
                return;
            }
            if inner.fell_back && resolution.kind == SourceKind::Streaming {
                if let Some(low) = &self.sources.low_bitrate {
                    resolution.kind = SourceKind::LowBitrate;
                    resolution.url = Some(low.clone());
                }
            }
            let state = match &resolution.url {
                Some(url) => {
                    inner.current = Some((resolution.kind, url.clone()));
                    PlayerState::Playing {
                        kind: resolution.kind,
                        url: url.clone(),
                    }
                }
                None => {
                    inner.current = None;
                    PlayerState::OfflineUnavailable
                }
            };
            debug!(?state, "Resolved source");
            self.state_tx.send_replace(state);
        }

        if let Some(url) = resolution.background_cache {
            self.spawn_background_cache(url);
        }
    }

    fn spawn_background_cache(&self, url: String) {
        let cache = self.cache.clone();
        let fetcher = self.fetcher.clone();
        tokio::spawn(async move {
            if cache.is_cached(&url).await {
                return;
            }
            match fetcher.fetch(&url, cache.budget()).await {
                Ok(bytes) => match cache.put(&url, bytes).await {
                    Ok(()) => debug!("Cached {} for offline playback", url),
                    Err(e) => warn!("Could not cache {}: {}", url, e),
                },
                Err(e) => debug!("Background fetch of {} failed: {}", url, e),
            }
        });
    }

    /// Apply every sample published by a network monitor
    pub fn follow(
        self: &Arc<Self>,
        mut samples: watch::Receiver<NetworkSample>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let player = self.clone();
        tokio::spawn(async move {
            loop {
                let sample = samples.borrow_and_update().clone();
                player.on_network_change(sample).await;

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = samples.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBlobStore;
    use axum::{Router, routing::get};
    use common::media::CACHE_BUDGET_BYTES;
    use std::time::Duration;

    const PRIMARY: &str = "https://cdn/processed/p/a/hls/index.m3u8";
    const LOW: &str = "https://cdn/processed/p/a/low.mp4";

    fn sources() -> MediaSources {
        MediaSources {
            primary: PRIMARY.to_string(),
            low_bitrate: Some(LOW.to_string()),
        }
    }

    fn fast() -> NetworkSample {
        NetworkSample::online(None, Some(20))
    }

    fn slow() -> NetworkSample {
        NetworkSample::online(None, Some(800))
    }

    fn offline() -> NetworkSample {
        NetworkSample::offline(None)
    }

    #[derive(Default)]
    struct CountingFetcher {
        urls: Mutex<Vec<String>>,
    }

    impl CountingFetcher {
        fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaFetcher for CountingFetcher {
        async fn fetch(&self, url: &str, _max_bytes: u64) -> Result<Bytes, DeliveryError> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(Bytes::from_static(b"low bitrate video"))
        }
    }

    fn player(sources: MediaSources) -> (Arc<Player>, Arc<ContentCache>, Arc<CountingFetcher>) {
        let cache = Arc::new(ContentCache::new(
            Arc::new(MemoryBlobStore::new()),
            CACHE_BUDGET_BYTES,
        ));
        let fetcher = Arc::new(CountingFetcher::default());
        let player = Player::new(sources, cache.clone(), fetcher.clone());
        (player, cache, fetcher)
    }

    async fn wait_cached(cache: &ContentCache, url: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cache.is_cached(url).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("background caching should finish");
    }

    #[test]
    fn cached_primary_wins_on_any_network() {
        for network in [offline(), slow(), fast()] {
            let resolution = resolve_source(&sources(), &network, true, true);
            assert_eq!(resolution, Resolution::play(SourceKind::Cache, PRIMARY));
        }
    }

    #[test]
    fn fast_network_streams_over_cached_low_bitrate() {
        let resolution = resolve_source(&sources(), &fast(), false, true);
        assert_eq!(resolution.kind, SourceKind::Streaming);
        assert_eq!(resolution.url.as_deref(), Some(PRIMARY));
        assert_eq!(resolution.background_cache, None);
    }

    #[test]
    fn fast_network_caches_best_offline_copy() {
        let resolution = resolve_source(&sources(), &fast(), false, false);
        assert_eq!(resolution.background_cache.as_deref(), Some(LOW));

        let primary_only = MediaSources {
            primary: PRIMARY.to_string(),
            low_bitrate: None,
        };
        let resolution = resolve_source(&primary_only, &fast(), false, false);
        assert_eq!(resolution.background_cache.as_deref(), Some(PRIMARY));
    }

    #[test]
    fn offline_plays_cached_low_bitrate() {
        let resolution = resolve_source(&sources(), &offline(), false, true);
        assert_eq!(resolution, Resolution::play(SourceKind::Cache, LOW));
    }

    #[test]
    fn slow_network_prefers_low_bitrate_then_primary() {
        let resolution = resolve_source(&sources(), &slow(), false, false);
        assert_eq!(resolution, Resolution::play(SourceKind::LowBitrate, LOW));

        let primary_only = MediaSources {
            primary: PRIMARY.to_string(),
            low_bitrate: None,
        };
        let resolution = resolve_source(&primary_only, &slow(), false, false);
        assert_eq!(resolution, Resolution::play(SourceKind::Streaming, PRIMARY));
    }

    #[test]
    fn offline_with_nothing_cached_is_unavailable() {
        let resolution = resolve_source(&sources(), &offline(), false, false);
        assert_eq!(resolution.kind, SourceKind::Unavailable);
        assert_eq!(resolution.url, None);
        assert_eq!(resolution.background_cache, None);
    }

    #[tokio::test]
    async fn offline_empty_cache_shows_placeholder_without_fetching() {
        let (player, _cache, fetcher) = player(sources());
        player.set_visible(true).await;
        assert_eq!(player.state(), PlayerState::Detecting);

        player.on_network_change(offline()).await;
        assert_eq!(player.state(), PlayerState::OfflineUnavailable);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fetcher.urls().is_empty());
    }

    #[tokio::test]
    async fn hidden_player_waits_for_visibility() {
        let (player, _cache, fetcher) = player(sources());
        player.on_network_change(fast()).await;
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(fetcher.urls().is_empty());

        player.set_visible(true).await;
        assert_eq!(
            player.state(),
            PlayerState::Playing {
                kind: SourceKind::Streaming,
                url: PRIMARY.to_string()
            }
        );
    }

    #[tokio::test]
    async fn streaming_caches_low_bitrate_then_survives_going_offline() {
        let (player, cache, fetcher) = player(sources());
        player.set_visible(true).await;
        player.on_network_change(fast()).await;

        wait_cached(&cache, LOW).await;
        assert_eq!(fetcher.urls(), vec![LOW.to_string()]);

        player.on_network_change(offline()).await;
        assert_eq!(
            player.state(),
            PlayerState::Playing {
                kind: SourceKind::Cache,
                url: LOW.to_string()
            }
        );
    }

    #[tokio::test]
    async fn playback_error_falls_back_once() {
        let (player, _cache, _fetcher) = player(sources());
        player.set_visible(true).await;
        player.on_network_change(fast()).await;

        let state = player.on_playback_error("segment request failed");
        assert_eq!(
            state,
            PlayerState::Playing {
                kind: SourceKind::LowBitrate,
                url: LOW.to_string()
            }
        );

        let state = player.on_playback_error("segment request failed");
        assert!(matches!(state, PlayerState::Failed { .. }));
        assert_eq!(player.state(), state);
    }

    fn playing(kind: SourceKind, url: &str) -> PlayerState {
        PlayerState::Playing {
            kind,
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn same_network_keeps_the_fallen_back_tier() {
        let (player, _cache, _fetcher) = player(sources());
        player.set_visible(true).await;
        player.on_network_change(fast()).await;
        player.on_playback_error("segment 404");

        // A fresh reading of the same fast network
        player.on_network_change(NetworkSample::online(None, Some(35))).await;
        assert_eq!(player.state(), playing(SourceKind::LowBitrate, LOW));

        // Reappearing on screen does not go back to the failed stream either
        player.set_visible(false).await;
        player.set_visible(true).await;
        assert_eq!(player.state(), playing(SourceKind::LowBitrate, LOW));
    }

    #[tokio::test]
    async fn network_change_restores_the_fallback() {
        let (player, _cache, _fetcher) = player(sources());
        player.set_visible(true).await;
        player.on_network_change(fast()).await;
        assert_eq!(
            player.on_playback_error("segment 404"),
            playing(SourceKind::LowBitrate, LOW)
        );

        player.on_network_change(slow()).await;
        player.on_network_change(fast()).await;
        assert_eq!(player.state(), playing(SourceKind::Streaming, PRIMARY));

        assert_eq!(
            player.on_playback_error("segment 404"),
            playing(SourceKind::LowBitrate, LOW)
        );
    }

    #[tokio::test]
    async fn error_without_low_bitrate_fails_immediately() {
        let (player, _cache, _fetcher) = player(MediaSources {
            primary: PRIMARY.to_string(),
            low_bitrate: None,
        });
        player.set_visible(true).await;
        player.on_network_change(slow()).await;

        assert!(matches!(
            player.on_playback_error("decode error"),
            PlayerState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn follows_monitor_samples() {
        let (player, _cache, _fetcher) = player(sources());
        player.set_visible(true).await;

        let (tx, rx) = watch::channel(slow());
        let shutdown = CancellationToken::new();
        let task = player.follow(rx, shutdown.clone());
        let mut states = player.subscribe();

        let low = PlayerState::Playing {
            kind: SourceKind::LowBitrate,
            url: LOW.to_string(),
        };
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == low))
            .await
            .unwrap()
            .unwrap();

        tx.send(offline()).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == PlayerState::OfflineUnavailable),
        )
        .await
        .unwrap()
        .unwrap();

        tx.send(fast()).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == playing(SourceKind::Streaming, PRIMARY)),
        )
        .await
        .unwrap()
        .unwrap();
        player.on_playback_error("segment 404");

        // Same classification again, as a monitor tick would deliver
        tx.send(NetworkSample::online(None, Some(25))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(player.state(), playing(SourceKind::LowBitrate, LOW));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn http_fetcher_refuses_oversized_bodies() {
        let app = Router::new()
            .route("/small", get(|| async { "tiny" }))
            .route("/big", get(|| async { vec![0u8; 64] }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let fetcher = HttpMediaFetcher::new(reqwest::Client::new());
        let body = fetcher
            .fetch(&format!("http://{}/small", addr), 16)
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"tiny"));

        let err = fetcher
            .fetch(&format!("http://{}/big", addr), 16)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::TooLarge { limit: 16 }));

        let err = fetcher
            .fetch(&format!("http://{}/missing", addr), 16)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Status(404)));
    }
}
