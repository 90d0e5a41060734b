//! Device directory cache (spec §3, §4.D).
//!
//! Single-writer, atomic-snapshot-swap discipline: readers (the uplink
//! pipeline) never observe a partially-filled entry because the whole map
//! is replaced behind a lock-guarded pointer, not mutated in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Immutable record obtained from the directory (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub dev_eui: String,
    pub app_eui: String,
    pub dev_addr: String,
    pub nwk_skey: [u8; 16],
    pub app_skey: [u8; 16],
}

/// The out-of-scope external capability (spec §1, §6): `get_by(column?,
/// value?) -> map<dev_addr_hex, Device>`. When both arguments are `None`,
/// the full directory is returned.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_by(&self, column: Option<&str>, value: Option<&str>) -> anyhow::Result<HashMap<String, Device>>;
}

/// In-memory directory for tests and operators without a catalog service.
#[derive(Debug, Default)]
pub struct StaticDeviceDirectory {
    devices: HashMap<String, Device>,
}

impl StaticDeviceDirectory {
    pub fn new(devices: HashMap<String, Device>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceDirectory for StaticDeviceDirectory {
    async fn get_by(&self, column: Option<&str>, value: Option<&str>) -> anyhow::Result<HashMap<String, Device>> {
        match (column, value) {
            (None, None) => Ok(self.devices.clone()),
            (Some("dev_addr"), Some(v)) => Ok(self
                .devices
                .get(v)
                .cloned()
                .into_iter()
                .map(|d| (v.to_string(), d))
                .collect()),
            _ => Ok(HashMap::new()),
        }
    }
}

/// `DevAddr → Device` cache, refreshed on a 60 s cadence and lazily
/// populated on miss (spec §4.D).
///
/// The map itself is never mutated in place: each refresh or miss-fetch
/// builds a whole new `Arc<HashMap>` and swaps the pointer behind a brief
/// write-lock, so a reader's `lookup` only ever sees a complete map,
/// never a torn one (spec §9).
/// HTTP device-catalog client implementing `DeviceDirectory` (spec §4.D,
/// the out-of-scope "external collaborator"). Borrows the teacher's
/// `AirlockClient` request/`Context`-wrapped-error style.
#[cfg(feature = "http-directory")]
pub struct HttpDeviceDirectory {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[cfg(feature = "http-directory")]
#[derive(serde::Deserialize)]
struct DeviceRow {
    dev_eui: String,
    app_eui: String,
    dev_addr: String,
    nwk_skey: String,
    app_skey: String,
}

#[cfg(feature = "http-directory")]
impl TryFrom<DeviceRow> for Device {
    type Error = anyhow::Error;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let mut nwk_skey = [0u8; 16];
        let nwk_bytes = hex::decode(&row.nwk_skey)?;
        anyhow::ensure!(nwk_bytes.len() == 16, "nwk_skey must be 16 bytes");
        nwk_skey.copy_from_slice(&nwk_bytes);

        let mut app_skey = [0u8; 16];
        let app_bytes = hex::decode(&row.app_skey)?;
        anyhow::ensure!(app_bytes.len() == 16, "app_skey must be 16 bytes");
        app_skey.copy_from_slice(&app_bytes);

        Ok(Device {
            dev_eui: row.dev_eui,
            app_eui: row.app_eui,
            dev_addr: row.dev_addr,
            nwk_skey,
            app_skey,
        })
    }
}

#[cfg(feature = "http-directory")]
impl HttpDeviceDirectory {
    pub fn new(base_url: String, token: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base_url, token })
    }
}

#[cfg(feature = "http-directory")]
#[async_trait]
impl DeviceDirectory for HttpDeviceDirectory {
    async fn get_by(&self, column: Option<&str>, value: Option<&str>) -> anyhow::Result<HashMap<String, Device>> {
        use anyhow::Context;

        let mut request = self.http.get(&self.base_url).bearer_auth(&self.token);
        if let (Some(column), Some(value)) = (column, value) {
            request = request.query(&[("column", column), ("value", value)]);
        }

        let response = request.send().await.context("device directory request failed")?;
        anyhow::ensure!(response.status().is_success(), "device directory returned {}", response.status());

        let rows: Vec<DeviceRow> = response.json().await.context("invalid device directory response")?;
        rows.into_iter()
            .map(|row| Device::try_from(row).map(|d| (d.dev_addr.clone(), d)))
            .collect()
    }
}

pub struct DirectoryCache {
    snapshot: RwLock<Arc<HashMap<String, Device>>>,
    directory: Arc<dyn DeviceDirectory>,
}

/// Refresh cadence (spec §4.D, §4.E).
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

impl DirectoryCache {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            directory,
        }
    }

    /// O(1) read against the current snapshot.
    pub async fn lookup(&self, dev_addr_hex: &str) -> Option<Device> {
        self.snapshot.read().await.get(dev_addr_hex).cloned()
    }

    /// Full replace of the cache from the directory. Failure is non-fatal:
    /// the previous cache is retained (spec §4.D, §7 `DirectoryUnavailable`).
    pub async fn refresh_all(&self) {
        match self.directory.get_by(None, None).await {
            Ok(devices) => {
                info!("directory refresh: {} devices", devices.len());
                *self.snapshot.write().await = Arc::new(devices);
            }
            Err(e) => {
                error!("{}", crate::error::BridgeError::DirectoryUnavailable(e));
            }
        }
    }

    /// On miss, perform one synchronous single-address fetch and insert on
    /// success (spec §4.D invariant 8). Returns `None` if still absent.
    pub async fn lookup_or_fetch(&self, dev_addr_hex: &str) -> Option<Device> {
        if let Some(device) = self.lookup(dev_addr_hex).await {
            return Some(device);
        }

        debug!("cache miss for {dev_addr_hex}, querying directory");
        match self.directory.get_by(Some("dev_addr"), Some(dev_addr_hex)).await {
            Ok(mut found) => {
                if let Some(device) = found.remove(dev_addr_hex) {
                    let mut next = (*self.snapshot.read().await).as_ref().clone();
                    next.insert(dev_addr_hex.to_string(), device.clone());
                    *self.snapshot.write().await = Arc::new(next);
                    Some(device)
                } else {
                    warn!("unknown device for DevAddr {dev_addr_hex}");
                    None
                }
            }
            Err(e) => {
                error!("{} (during miss fetch)", crate::error::BridgeError::DirectoryUnavailable(e));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(dev_addr: &str) -> Device {
        Device {
            dev_eui: format!("eui-{dev_addr}"),
            app_eui: "app".into(),
            dev_addr: dev_addr.into(),
            nwk_skey: [0u8; 16],
            app_skey: [1u8; 16],
        }
    }

    #[tokio::test]
    async fn refresh_all_populates_cache() {
        let mut devices = HashMap::new();
        devices.insert("26011BDA".to_string(), device("26011BDA"));
        let directory = Arc::new(StaticDeviceDirectory::new(devices));
        let cache = DirectoryCache::new(directory);

        assert!(cache.lookup("26011BDA").await.is_none());
        cache.refresh_all().await;
        assert!(cache.lookup("26011BDA").await.is_some());
    }

    /// Invariant 8: cache miss path — exactly one query, observable after.
    #[tokio::test]
    async fn lookup_or_fetch_resolves_miss() {
        let mut devices = HashMap::new();
        devices.insert("AABBCCDD".to_string(), device("AABBCCDD"));
        let directory = Arc::new(StaticDeviceDirectory::new(devices));
        let cache = DirectoryCache::new(directory);

        assert!(cache.lookup("AABBCCDD").await.is_none());
        let found = cache.lookup_or_fetch("AABBCCDD").await;
        assert!(found.is_some());
        assert!(cache.lookup("AABBCCDD").await.is_some());
    }

    #[tokio::test]
    async fn lookup_or_fetch_none_for_unknown() {
        let directory = Arc::new(StaticDeviceDirectory::new(HashMap::new()));
        let cache = DirectoryCache::new(directory);
        assert!(cache.lookup_or_fetch("DEADBEEF").await.is_none());
    }
}
