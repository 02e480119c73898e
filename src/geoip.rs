// log-enricher - geoip.rs
//
// 4.L GeoIP stage: look up country (and city, if available) for public IPs
// using a local binary database, survive live updates.
//
// The reloadable handle is an
// atomically-swappable `Arc<maxminddb::Reader<...>>` behind a
// `parking_lot::RwLock`: readers clone the `Arc` out under a read lock then
// release it before querying. Reload swaps in the new handle under a write
// lock and lets the old one drop once its last reader is done with it.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use maxminddb::geoip2;
use notify::{RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::PersistedCache;
use crate::model::{FieldValue, LogEntry};
use crate::util::constants::{GEOIP_RELOAD_RETRY_ATTEMPTS, GEOIP_RELOAD_RETRY_INTERVAL_MS};
use crate::util::error::EnrichmentError;

type Handle = Arc<maxminddb::Reader<Vec<u8>>>;

pub struct GeoIpStage {
    path: PathBuf,
    handle: RwLock<Option<Handle>>,
    cache: Arc<PersistedCache<String>>,
}

impl GeoIpStage {
    /// Open the database at `path`, returning a `GeoIpOpenFailed` error if
    /// the initial open fails. The application wiring treats this as fatal
    /// at startup.
    pub fn open(path: PathBuf, cache: Arc<PersistedCache<String>>) -> Result<Arc<Self>, EnrichmentError> {
        let reader = open_reader(&path)?;
        Ok(Arc::new(GeoIpStage {
            path,
            handle: RwLock::new(Some(Arc::new(reader))),
            cache,
        }))
    }

    /// Skip private/loopback/link-local/multicast IPs; consult the
    /// persisted cache; on miss, query the current handle under a read
    /// lock.
    pub fn process(&self, entry: &mut LogEntry) {
        let Some(ip_str) = entry.fields.get("client_ip").and_then(FieldValue::as_str_lossy) else {
            return;
        };
        let Ok(ip) = ip_str.parse::<IpAddr>() else {
            return;
        };
        if is_non_routable(&ip) {
            return;
        }

        if let Some(country) = self.cache.get(&ip_str) {
            entry.fields.insert("country_iso".to_string(), FieldValue::String(country));
            return;
        }

        let handle = self.handle.read().clone();
        let Some(handle) = handle else { return };

        match handle.lookup::<geoip2::City>(ip) {
            Ok(Some(city)) => {
                let Some(iso) = city.country.as_ref().and_then(|c| c.iso_code) else {
                    return;
                };
                self.cache.insert(ip_str, iso.to_string());
                entry.fields.insert("country_iso".to_string(), FieldValue::String(iso.to_string()));
                if let Some(name) = city
                    .city
                    .as_ref()
                    .and_then(|c| c.names.as_ref())
                    .and_then(|names| names.get("en"))
                {
                    entry.fields.insert("city".to_string(), FieldValue::String((*name).to_string()));
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(ip = %ip_str, error = %e, "geoip lookup failed");
            }
        }
    }

    /// Reopen the database with retry and swap the handle under a write
    /// lock. If reopen fails, the previous handle remains installed.
    async fn reload(&self) {
        for attempt in 1..=GEOIP_RELOAD_RETRY_ATTEMPTS {
            match open_reader(&self.path) {
                Ok(reader) => {
                    let new_handle = Arc::new(reader);
                    let old = self.handle.write().replace(new_handle);
                    drop(old); // last Arc reference drops once no reader holds a clone
                    tracing::info!(path = %self.path.display(), "geoip database reloaded");
                    return;
                }
                Err(e) if attempt < GEOIP_RELOAD_RETRY_ATTEMPTS => {
                    tracing::warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "geoip reload attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(GEOIP_RELOAD_RETRY_INTERVAL_MS)).await;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "geoip reload exhausted retries, keeping previous handle"
                    );
                }
            }
        }
    }

    /// Spawn the filesystem-watch reload task. Fires on write/create/rename
    /// events for the database path.
    pub fn spawn_reload_watcher(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>, notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        let stage = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _watcher = watcher; // keep alive for the task's lifetime
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        if !event.paths.iter().any(|p| p == &stage.path) {
                            continue;
                        }
                        use notify::EventKind;
                        if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            stage.reload().await;
                        }
                    }
                }
            }
        });
        Ok(handle)
    }
}

fn open_reader(path: &Path) -> Result<maxminddb::Reader<Vec<u8>>, EnrichmentError> {
    maxminddb::Reader::open_readfile(path).map_err(|e| EnrichmentError::GeoIpOpenFailed {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    })
}

fn is_non_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_multicast() || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_routable_ipv4_detection() {
        assert!(is_non_routable(&"127.0.0.1".parse().unwrap()));
        assert!(is_non_routable(&"10.0.0.1".parse().unwrap()));
        assert!(is_non_routable(&"169.254.1.1".parse().unwrap()));
        assert!(is_non_routable(&"224.0.0.1".parse().unwrap()));
        assert!(!is_non_routable(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn non_routable_ipv6_link_local() {
        assert!(is_non_routable(&"fe80::1".parse().unwrap()));
        assert!(!is_non_routable(&"2001:4860:4860::8888".parse().unwrap()));
    }
}
