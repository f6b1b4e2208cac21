// Connectivity oracle: reports network/battery telemetry and gates sync
// operations on an ordered rule chain.


use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// Average throughput assumptions per transport (bytes per second), tuned for
// rural connectivity.
const WIFI_BYTES_PER_SEC: f64 = 2_000_000.0;
const CELLULAR_BYTES_PER_SEC: f64 = 500_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    None,
    Unknown,
}

impl std::fmt::Display for ConnectionType {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ConnectionType::Wifi => write!(f, "wifi"),
            ConnectionType::Cellular => write!(f, "cellular"),
            ConnectionType::None => write!(f, "none"),
            ConnectionType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Transport as reported by the host, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Wifi,
    Cellular,
    None,
    /// Connected over something else: ethernet, VPN, bluetooth. Emulators
    /// frequently land here.
    Other,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub is_connected: bool,
    pub link: LinkType,
    pub internet_reachable: Option<bool>,
}

impl Default for NetworkSnapshot {
    #[inline]
    fn default() -> Self {
        Self {
            is_connected: true,
            link: LinkType::Wifi,
            internet_reachable: Some(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityStatus {
    pub is_connected: bool,
    pub connection: ConnectionType,
    pub internet_reachable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionQuality {
    pub latency_ms: i64,
    pub quality: QualityRating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRules {
    pub require_wifi: bool,
    pub min_battery_level: u8,
    pub allow_cellular: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEligibility {
    pub eligible: bool,
    pub reason: Option<String>,
    pub battery_level: u8,
    pub connection: ConnectionType,
}

/// Host-provided device telemetry. The OS integration layer implements this;
/// tests inject fakes.
pub trait Telemetry: Send + Sync {
    fn network(&self) -> NetworkSnapshot;
    fn battery_percent(&self) -> anyhow::Result<u8>;
}

/// Telemetry source updated explicitly by the host. Defaults to a connected
/// WiFi link with a full battery.
#[derive(Debug, Default)]
pub struct ManualTelemetry {
    network: Mutex<NetworkSnapshot>,
    battery: Mutex<Option<u8>>,
}

impl ManualTelemetry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set_network(&self, snapshot: NetworkSnapshot) {
        if let Ok(mut guard) = self.network.lock() {
            *guard = snapshot;
        }
    }

    #[inline]
    pub fn set_battery(&self, percent: u8) {
        if let Ok(mut guard) = self.battery.lock() {
            *guard = Some(percent);
        }
    }
}

impl Telemetry for ManualTelemetry {
    #[inline]
    fn network(&self) -> NetworkSnapshot {
        self.network
            .lock()
            .map(|guard| *guard)
            .unwrap_or_default()
    }

    #[inline]
    fn battery_percent(&self) -> anyhow::Result<u8> {
        let guard = self
            .battery
            .lock()
            .map_err(|_| anyhow::anyhow!("battery state poisoned"))?;
        guard.ok_or_else(|| anyhow::anyhow!("battery level not reported"))
    }
}

type ChangeCallback = Box<dyn Fn(&ConnectivityStatus) + Send>;

/// Opaque handle for removing a connectivity-change subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

pub struct ConnectivityService {
    telemetry: std::sync::Arc<dyn Telemetry>,
    listeners: Mutex<Vec<(u64, ChangeCallback)>>,
    next_handle: AtomicU64,
    http: reqwest::Client,
}

impl ConnectivityService {
    #[inline]
    pub fn new(telemetry: std::sync::Arc<dyn Telemetry>) -> Self {
        Self {
            telemetry,
            listeners: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            http: reqwest::Client::new(),
        }
    }

    /// Current connectivity, with any connected-but-unclassified transport
    /// normalized to WiFi for quota-friendliness decisions.
    #[inline]
    pub fn status(&self) -> ConnectivityStatus {
        let snapshot = self.telemetry.network();
        let connection = match snapshot.link {
            LinkType::Wifi => ConnectionType::Wifi,
            LinkType::Cellular => ConnectionType::Cellular,
            LinkType::None => ConnectionType::None,
            LinkType::Other if snapshot.is_connected => ConnectionType::Wifi,
            LinkType::Other | LinkType::Unknown => ConnectionType::Unknown,
        };

        ConnectivityStatus {
            is_connected: snapshot.is_connected,
            connection,
            internet_reachable: snapshot.internet_reachable,
        }
    }

    /// Battery percentage, assuming a full battery when the probe fails so a
    /// telemetry hiccup never blocks sync on its own.
    #[inline]
    pub fn battery_level(&self) -> u8 {
        match self.telemetry.battery_percent() {
            Ok(level) => level.min(100),
            Err(e) => {
                error!("Error getting battery level: {}", e);
                100
            }
        }
    }

    /// Evaluate the sync rule chain in order, short-circuiting on the first
    /// failing check: connected, reachable, WiFi requirement, battery floor,
    /// cellular allowance.
    #[inline]
    pub fn check_sync_eligibility(&self, rules: &SyncRules) -> SyncEligibility {
        let status = self.status();
        let battery_level = self.battery_level();

        let ineligible = |reason: String| SyncEligibility {
            eligible: false,
            reason: Some(reason),
            battery_level,
            connection: status.connection,
        };

        if !status.is_connected {
            return ineligible("No internet connection available".to_string());
        }

        if status.internet_reachable == Some(false) {
            return ineligible("Internet not reachable".to_string());
        }

        if rules.require_wifi && status.connection != ConnectionType::Wifi {
            return ineligible("WiFi connection required for sync".to_string());
        }

        if battery_level < rules.min_battery_level {
            return ineligible(format!(
                "Battery too low ({}%). Minimum required: {}%",
                battery_level, rules.min_battery_level
            ));
        }

        if !rules.allow_cellular && status.connection == ConnectionType::Cellular {
            return ineligible("Cellular data not allowed for sync".to_string());
        }

        SyncEligibility {
            eligible: true,
            reason: None,
            battery_level,
            connection: status.connection,
        }
    }

    /// Estimated seconds to download `bytes` over the current transport;
    /// infinite when disconnected.
    #[inline]
    pub fn estimate_download_time(&self, bytes: u64) -> f64 {
        let speed = match self.status().connection {
            ConnectionType::Wifi => WIFI_BYTES_PER_SEC,
            ConnectionType::Cellular | ConnectionType::Unknown => CELLULAR_BYTES_PER_SEC,
            ConnectionType::None => 0.0,
        };

        if speed == 0.0 {
            return f64::INFINITY;
        }

        (bytes as f64 / speed).ceil()
    }

    /// Lightweight latency probe against the API's health endpoint. Never
    /// fails: an unreachable or slow server reports as poor with latency -1.
    #[inline]
    pub async fn test_connection_quality(&self, api_base_url: &str) -> ConnectionQuality {
        let url = format!("{}/health", api_base_url.trim_end_matches('/'));
        let start = Instant::now();

        let probe = self.http.head(&url).timeout(PROBE_TIMEOUT).send().await;

        match probe {
            Ok(_) => {
                let latency_ms = start.elapsed().as_millis() as i64;
                let quality = if latency_ms < 100 {
                    QualityRating::Excellent
                } else if latency_ms < 300 {
                    QualityRating::Good
                } else if latency_ms < 1000 {
                    QualityRating::Fair
                } else {
                    QualityRating::Poor
                };
                ConnectionQuality { latency_ms, quality }
            }
            Err(e) => {
                warn!("Connection quality test failed: {}", e);
                ConnectionQuality {
                    latency_ms: -1,
                    quality: QualityRating::Poor,
                }
            }
        }
    }

    /// Register a callback invoked on every connectivity transition reported
    /// through [`Self::emit_change`].
    #[inline]
    pub fn on_change<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ConnectivityStatus) + Send + 'static,
    {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((handle, Box::new(callback)));
        }
        SubscriptionHandle(handle)
    }

    /// Remove a subscriber. Idempotent: removing an already-removed handle is
    /// a no-op.
    #[inline]
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(id, _)| *id != handle.0);
        }
    }

    /// Notify all subscribers of the current connectivity state. Each call is
    /// isolated so one panicking subscriber cannot break the rest.
    #[inline]
    pub fn emit_change(&self) {
        let status = self.status();
        debug!(
            "Connectivity change: connected={} type={}",
            status.is_connected, status.connection
        );

        if let Ok(listeners) = self.listeners.lock() {
            for (id, callback) in listeners.iter() {
                if catch_unwind(AssertUnwindSafe(|| callback(&status))).is_err() {
                    error!("Connectivity listener {} panicked", id);
                }
            }
        }
    }

    /// Drop all subscribers. Called on service shutdown.
    #[inline]
    pub fn shutdown(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }
}

impl std::fmt::Debug for ConnectivityService {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityService")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
