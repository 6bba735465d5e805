//! Peer discovery over mDNS/DNS-SD (component D).
//!
//! yank advertises itself as `_yank._tcp.local.` with a single `device_id`
//! TXT record. Discovery is best-effort: callers fall back to an explicit
//! `--peer <ip>` when nothing resolves within the timeout.

use crate::error::{Error, Result};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SERVICE_TYPE: &str = "_yank._tcp.local.";
pub const DEVICE_ID_KEY: &str = "device_id";
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// The best-known address and identity for a peer, as resolved from mDNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub device_id: String,
    pub address: SocketAddr,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Advertises this device on the LAN at `port`.
    async fn announce(&self, device_id: &str, port: u16) -> Result<()>;
    /// Waits up to `timeout` for any peer to resolve, keeping only the most
    /// recently seen address per `device_id`.
    async fn discover(&self, timeout: Duration) -> Vec<PeerInfo>;
}

fn local_hostname() -> String {
    let raw = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{raw}.local.")
}

/// Real mDNS discovery, backed by `mdns-sd`.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    registered: Mutex<Option<String>>,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| Error::InternalError(format!("mDNS daemon error: {e}")))?;
        Ok(Self { daemon, registered: Mutex::new(None) })
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn announce(&self, device_id: &str, port: u16) -> Result<()> {
        let instance_name = format!("yank-{device_id}");
        let hostname = local_hostname();
        let properties = vec![(DEVICE_ID_KEY, device_id.to_string())];

        let service_info = ServiceInfo::new(SERVICE_TYPE, &instance_name, &hostname, (), port, properties.as_slice())
            .map_err(|e| Error::InternalError(format!("failed to build mDNS service info: {e}")))?;

        self.daemon
            .register(service_info)
            .map_err(|e| Error::InternalError(format!("failed to register mDNS service: {e}")))?;

        *self.registered.lock().unwrap() = Some(instance_name);
        Ok(())
    }

    async fn discover(&self, timeout: Duration) -> Vec<PeerInfo> {
        let Ok(receiver) = self.daemon.browse(SERVICE_TYPE) else {
            return Vec::new();
        };

        let mut peers: std::collections::HashMap<String, PeerInfo> = std::collections::HashMap::new();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(Ok(event)) = tokio::time::timeout(remaining, receiver.recv_async()).await else {
                break;
            };
            if let ServiceEvent::ServiceResolved(info) = event {
                if let Some(peer) = peer_from_service_info(&info) {
                    peers.insert(peer.device_id.clone(), peer);
                }
            }
        }

        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        peers.into_values().collect()
    }
}

fn peer_from_service_info(info: &ServiceInfo) -> Option<PeerInfo> {
    let device_id = info.get_properties().get(DEVICE_ID_KEY)?.val_str().to_string();
    let ip: IpAddr = *info.get_addresses().iter().find(|addr| addr.is_ipv4())?;
    Some(PeerInfo { device_id, address: SocketAddr::new(ip, info.get_port()) })
}

/// A fixed, in-process peer list, for tests that don't want to touch the
/// real network.
#[derive(Default, Clone)]
pub struct MockDiscovery {
    peers: Arc<Mutex<Vec<PeerInfo>>>,
}

impl MockDiscovery {
    pub fn new(peers: Vec<PeerInfo>) -> Self {
        Self { peers: Arc::new(Mutex::new(peers)) }
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn announce(&self, _device_id: &str, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn discover(&self, _timeout: Duration) -> Vec<PeerInfo> {
        self.peers.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_is_well_formed() {
        assert!(SERVICE_TYPE.starts_with("_yank._tcp"));
        assert!(SERVICE_TYPE.ends_with(".local."));
    }

    #[tokio::test]
    async fn mock_discovery_returns_configured_peers() {
        let peer = PeerInfo { device_id: "abc".into(), address: "10.0.0.5:9876".parse().unwrap() };
        let discovery = MockDiscovery::new(vec![peer.clone()]);
        let found = discovery.discover(Duration::from_millis(10)).await;
        assert_eq!(found, vec![peer]);
    }

    #[tokio::test]
    async fn mock_discovery_announce_is_noop() {
        let discovery = MockDiscovery::default();
        discovery.announce("dev", 9876).await.unwrap();
        assert!(discovery.discover(Duration::from_millis(1)).await.is_empty());
    }
}
