//! Tenant networks and their address leases

use crate::config::NetworkConfig;
use lanlink_proto::NetworkDescriptor;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    Dynamic,
    /// Pinned by configuration; survives disconnects
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub uuid: String,
    pub alias: String,
    pub network: String,
    pub address: Ipv4Addr,
    /// Connection currently holding the lease, empty when offline
    pub client: String,
    pub kind: LeaseKind,
}

impl Lease {
    fn owned_by(&self, uuid: &str, alias: &str) -> bool {
        self.uuid == uuid || (!alias.is_empty() && self.alias == alias)
    }
}

struct Pool {
    config: NetworkConfig,
    start: Option<Ipv4Addr>,
    end: Option<Ipv4Addr>,
    reserved: HashSet<Ipv4Addr>,
}

impl Pool {
    fn new(config: NetworkConfig) -> Self {
        let mut reserved = HashSet::new();
        if let Some(own) = NetworkDescriptor::new(config.name.clone(), &config.address).address() {
            reserved.insert(own);
        }
        Self {
            start: config.subnet.start.parse().ok(),
            end: config.subnet.end.parse().ok(),
            reserved,
            config,
        }
    }
}

#[derive(Default)]
struct Inner {
    pools: HashMap<String, Pool>,
    leases: Vec<Lease>,
}

/// Networks served by a switch and every address handed out on them
#[derive(Default)]
pub struct NetworkStore {
    inner: RwLock<Inner>,
}

impl NetworkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with `networks` registered and their hosts pinned
    pub fn from_configs(networks: &[NetworkConfig]) -> Self {
        let mut inner = Inner::default();
        for network in networks {
            for host in &network.hosts {
                match host.address.parse::<Ipv4Addr>() {
                    Ok(address) => inner.leases.push(Lease {
                        uuid: host.uuid.clone(),
                        alias: host.uuid.clone(),
                        network: network.name.clone(),
                        address,
                        client: String::new(),
                        kind: LeaseKind::Static,
                    }),
                    Err(e) => warn!(host = %host.uuid, "Ignoring static address: {}", e),
                }
            }
            inner
                .pools
                .insert(network.name.clone(), Pool::new(network.clone()));
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub async fn add_network(&self, network: NetworkConfig) {
        info!(network = %network.name, "Adding network");
        self.inner
            .write()
            .await
            .pools
            .insert(network.name.clone(), Pool::new(network));
    }

    pub async fn get_network(&self, name: &str) -> Option<NetworkConfig> {
        self.inner
            .read()
            .await
            .pools
            .get(name)
            .map(|pool| pool.config.clone())
    }

    pub async fn list_networks(&self) -> Vec<String> {
        self.inner.read().await.pools.keys().cloned().collect()
    }

    pub async fn add_static(&self, network: &str, uuid: &str, address: Ipv4Addr) {
        let mut inner = self.inner.write().await;
        inner
            .leases
            .retain(|lease| !(lease.network == network && lease.uuid == uuid));
        inner.leases.push(Lease {
            uuid: uuid.to_string(),
            alias: uuid.to_string(),
            network: network.to_string(),
            address,
            client: String::new(),
            kind: LeaseKind::Static,
        });
    }

    pub async fn leases(&self) -> Vec<Lease> {
        self.inner.read().await.leases.clone()
    }

    pub async fn lease(&self, network: &str, uuid: &str) -> Option<Lease> {
        self.inner
            .read()
            .await
            .leases
            .iter()
            .find(|lease| lease.network == network && lease.uuid == uuid)
            .cloned()
    }

    /// Lease for an identity: its existing one (matched by alias or uuid),
    /// else the first free address of the pool. `None` when exhausted.
    pub async fn acquire(
        &self,
        network: &str,
        uuid: &str,
        alias: &str,
        client: &str,
    ) -> Option<Lease> {
        let mut inner = self.inner.write().await;

        if let Some(lease) = inner
            .leases
            .iter_mut()
            .find(|lease| lease.network == network && lease.owned_by(uuid, alias))
        {
            lease.client = client.to_string();
            debug!(network, uuid, address = %lease.address, "Lease recalled");
            return Some(lease.clone());
        }

        let pool = inner.pools.get(network)?;
        let (start, end) = (pool.start?, pool.end?);
        let used: HashSet<Ipv4Addr> = inner
            .leases
            .iter()
            .filter(|lease| lease.network == network)
            .map(|lease| lease.address)
            .collect();
        let free = (u32::from(start)..=u32::from(end))
            .map(Ipv4Addr::from)
            .find(|address| !used.contains(address) && !pool.reserved.contains(address))?;

        let lease = Lease {
            uuid: uuid.to_string(),
            alias: alias.to_string(),
            network: network.to_string(),
            address: free,
            client: client.to_string(),
            kind: LeaseKind::Dynamic,
        };
        info!(network, uuid, address = %free, "Lease allocated");
        inner.leases.push(lease.clone());
        Some(lease)
    }

    /// Record the address a point already uses as its current lease
    pub async fn record(
        &self,
        network: &str,
        uuid: &str,
        alias: &str,
        client: &str,
        address: Ipv4Addr,
    ) -> Lease {
        let mut inner = self.inner.write().await;
        if let Some(other) = inner
            .leases
            .iter()
            .find(|lease| lease.network == network && lease.address == address && lease.uuid != uuid)
        {
            warn!(network, uuid, %address, holder = %other.uuid, "Address already leased to another point");
        }

        let kind = match inner
            .leases
            .iter()
            .position(|lease| lease.network == network && lease.uuid == uuid)
        {
            Some(index) => inner.leases.remove(index).kind,
            None => LeaseKind::Dynamic,
        };
        let lease = Lease {
            uuid: uuid.to_string(),
            alias: alias.to_string(),
            network: network.to_string(),
            address,
            client: client.to_string(),
            kind,
        };
        inner.leases.push(lease.clone());
        lease
    }

    /// Give back the leases held by `client`; static ones are kept
    pub async fn release(&self, client: &str) -> Vec<Lease> {
        let mut inner = self.inner.write().await;
        let mut released = Vec::new();
        inner.leases.retain_mut(|lease| {
            if lease.client != client {
                return true;
            }
            lease.client.clear();
            if lease.kind == LeaseKind::Static {
                return true;
            }
            released.push(lease.clone());
            false
        });
        for lease in &released {
            info!(network = %lease.network, uuid = %lease.uuid, address = %lease.address, "Lease released");
        }
        released
    }

    /// Network descriptor with `address` filled in as the interface address
    pub async fn descriptor(&self, network: &str, address: Ipv4Addr) -> Option<NetworkDescriptor> {
        let inner = self.inner.read().await;
        let pool = inner.pools.get(network)?;
        let mut descriptor = pool.config.descriptor();
        descriptor.if_addr = address.to_string();
        Some(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, SubnetConfig};

    fn lab() -> NetworkConfig {
        NetworkConfig {
            name: "default".to_string(),
            address: "10.0.0.1/24".to_string(),
            subnet: SubnetConfig {
                start: "10.0.0.1".to_string(),
                end: "10.0.0.3".to_string(),
                netmask: "255.255.255.0".to_string(),
            },
            hosts: vec![HostConfig {
                uuid: "printer".to_string(),
                address: "10.0.0.2".to_string(),
            }],
            ..Default::default()
        }
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_same_identity_gets_same_address() {
        let store = NetworkStore::from_configs(&[lab()]);

        let first = store.acquire("default", "a", "alpha", "c1").await.unwrap();
        let again = store.acquire("default", "a", "alpha", "c1").await.unwrap();
        assert_eq!(first.address, addr("10.0.0.3"));
        assert_eq!(again.address, first.address);
        assert_eq!(store.leases().await.len(), 2);
    }

    #[tokio::test]
    async fn test_released_address_goes_to_new_identity() {
        let store = NetworkStore::from_configs(&[lab()]);

        let first = store.acquire("default", "a", "alpha", "c1").await.unwrap();
        assert!(store.acquire("default", "b", "beta", "c2").await.is_none());

        let released = store.release("c1").await;
        assert_eq!(released.len(), 1);
        let second = store.acquire("default", "b", "beta", "c2").await.unwrap();
        assert_eq!(second.address, first.address);
    }

    #[tokio::test]
    async fn test_static_lease_survives_release() {
        let store = NetworkStore::from_configs(&[lab()]);

        let lease = store
            .acquire("default", "ffff-0001", "printer", "c1")
            .await
            .unwrap();
        assert_eq!(lease.address, addr("10.0.0.2"));
        assert_eq!(lease.kind, LeaseKind::Static);

        assert!(store.release("c1").await.is_empty());
        let lease = store.lease("default", "printer").await.unwrap();
        assert!(lease.client.is_empty());
    }

    #[tokio::test]
    async fn test_record_keeps_reported_address() {
        let store = NetworkStore::from_configs(&[lab()]);

        let lease = store
            .record("default", "a", "alpha", "c1", addr("10.0.0.77"))
            .await;
        assert_eq!(lease.address, addr("10.0.0.77"));
        let recalled = store.acquire("default", "a", "alpha", "c1").await.unwrap();
        assert_eq!(recalled.address, addr("10.0.0.77"));

        let descriptor = store.descriptor("default", lease.address).await.unwrap();
        assert_eq!(descriptor.cidr().as_deref(), Some("10.0.0.77/24"));
        assert_eq!(descriptor.ip_start, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_unknown_network_has_no_lease() {
        let store = NetworkStore::new();
        assert!(store.acquire("nowhere", "a", "", "c1").await.is_none());
    }
}
