//! Network monitor
//!
//! Classifies the link as online/offline and fast/slow from a host-reported
//! link status plus a timed round trip to the backend's `/health` route.
//! Offline is authoritative: no probe is attempted while the host reports no
//! connectivity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Round trips slower than this mark the network slow
pub const SLOW_LATENCY_MS: u64 = 200;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Link type reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[serde(rename = "wifi")]
    Wifi,
    #[serde(rename = "ethernet")]
    Ethernet,
}

impl ConnectionType {
    pub fn is_slow(&self) -> bool {
        matches!(self, ConnectionType::Slow2g | ConnectionType::TwoG)
    }
}

/// Connectivity as reported by the host platform
pub trait LinkStatus: Send + Sync {
    fn is_online(&self) -> bool;
    fn connection_type(&self) -> Option<ConnectionType>;
}

/// Link status set explicitly by the embedding application
#[derive(Debug)]
pub struct ManualLink {
    online: AtomicBool,
    connection_type: Mutex<Option<ConnectionType>>,
}

impl ManualLink {
    pub fn new(online: bool, connection_type: Option<ConnectionType>) -> Self {
        Self {
            online: AtomicBool::new(online),
            connection_type: Mutex::new(connection_type),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_connection_type(&self, connection_type: Option<ConnectionType>) {
        if let Ok(mut current) = self.connection_type.lock() {
            *current = connection_type;
        }
    }
}

impl LinkStatus for ManualLink {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn connection_type(&self) -> Option<ConnectionType> {
        self.connection_type.lock().ok().and_then(|c| *c)
    }
}

/// Measures one round trip; `None` on timeout or transport error
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn round_trip(&self) -> Option<Duration>;
}

/// `HEAD` request against a lightweight endpoint
#[derive(Debug, Clone)]
pub struct HttpLatencyProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpLatencyProbe {
    /// Probe `{base_url}/health`
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LatencyProbe for HttpLatencyProbe {
    async fn round_trip(&self) -> Option<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.client.head(&self.url).send()).await {
            Ok(Ok(_)) => Some(started.elapsed()),
            Ok(Err(e)) => {
                debug!("Latency probe failed: {}", e);
                None
            }
            Err(_) => {
                debug!("Latency probe timed out after {:?}", self.timeout);
                None
            }
        }
    }
}

/// One classification of the network
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSample {
    is_online: bool,
    connection_type_hint: Option<ConnectionType>,
    latency_ms: Option<u64>,
    is_slow_network: bool,
    sampled_at: DateTime<Utc>,
}

impl NetworkSample {
    /// Sample of a connected host; slowness is derived from latency and hint
    pub fn online(connection_type_hint: Option<ConnectionType>, latency_ms: Option<u64>) -> Self {
        let is_slow_network = match latency_ms {
            None => true,
            Some(ms) => ms > SLOW_LATENCY_MS,
        } || connection_type_hint.is_some_and(|c| c.is_slow());

        Self {
            is_online: true,
            connection_type_hint,
            latency_ms,
            is_slow_network,
            sampled_at: Utc::now(),
        }
    }

    pub fn offline(connection_type_hint: Option<ConnectionType>) -> Self {
        Self {
            is_online: false,
            connection_type_hint,
            latency_ms: None,
            is_slow_network: true,
            sampled_at: Utc::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn connection_type_hint(&self) -> Option<ConnectionType> {
        self.connection_type_hint
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn is_slow_network(&self) -> bool {
        self.is_slow_network
    }

    pub fn sampled_at(&self) -> DateTime<Utc> {
        self.sampled_at
    }

    /// Both samples put the link in the same class; latency and time are ignored
    pub fn same_classification(&self, other: &NetworkSample) -> bool {
        self.is_online == other.is_online
            && self.is_slow_network == other.is_slow_network
            && self.connection_type_hint == other.connection_type_hint
    }
}

/// Host events that trigger an immediate sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
    Online,
    Offline,
    ConnectionChanged,
}

pub struct NetworkMonitor {
    link: Arc<dyn LinkStatus>,
    probe: Arc<dyn LatencyProbe>,
}

impl NetworkMonitor {
    pub fn new(link: Arc<dyn LinkStatus>, probe: Arc<dyn LatencyProbe>) -> Self {
        Self { link, probe }
    }

    pub async fn sample(&self) -> NetworkSample {
        let hint = self.link.connection_type();
        if !self.link.is_online() {
            return NetworkSample::offline(hint);
        }

        let latency_ms = self
            .probe
            .round_trip()
            .await
            .map(|d| d.as_millis() as u64);
        NetworkSample::online(hint, latency_ms)
    }

    /// Sample every `interval` and on every host signal until `shutdown`.
    ///
    /// Probes run detached, so a slow probe never delays the next cycle. A
    /// probe result older than the sample already published is discarded.
    /// Every sample refreshes the channel value, but receivers are only
    /// notified when the classification changes.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        signals: mpsc::Receiver<NetworkSignal>,
        shutdown: CancellationToken,
    ) -> watch::Receiver<NetworkSample> {
        let initial = if self.link.is_online() {
            NetworkSample::online(self.link.connection_type(), None)
        } else {
            NetworkSample::offline(self.link.connection_type())
        };
        let (tx, rx) = watch::channel(initial);

        tokio::spawn(async move {
            let (results_tx, mut results) = mpsc::unbounded_channel::<(u64, NetworkSample)>();
            let mut signals = Some(signals);
            let mut ticker = tokio::time::interval(interval);
            let mut issued = 0u64;
            let mut applied = 0u64;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some((seq, sample)) = results.recv() => {
                        if seq > applied {
                            applied = seq;
                            publish(&tx, sample);
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                    signal = next_signal(&mut signals) => match signal {
                        Some(signal) => debug!(?signal, "Network signal"),
                        None => {
                            signals = None;
                            continue;
                        }
                    },
                }

                issued += 1;
                let seq = issued;

                if !self.link.is_online() {
                    applied = seq;
                    publish(&tx, NetworkSample::offline(self.link.connection_type()));
                    continue;
                }

                let monitor = self.clone();
                let results_tx = results_tx.clone();
                tokio::spawn(async move {
                    let sample = monitor.sample().await;
                    let _ = results_tx.send((seq, sample));
                });
            }
        });

        rx
    }
}

fn publish(tx: &watch::Sender<NetworkSample>, sample: NetworkSample) {
    let changed = tx.send_if_modified(|current| {
        let changed = !current.same_classification(&sample);
        *current = sample;
        changed
    });
    if changed {
        debug!(sample = ?*tx.borrow(), "Network classification changed");
    }
}

async fn next_signal(signals: &mut Option<mpsc::Receiver<NetworkSignal>>) -> Option<NetworkSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
