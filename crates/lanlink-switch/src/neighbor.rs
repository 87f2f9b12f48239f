//! Neighbor table learned from ARP traffic crossing the switch

use chrono::{DateTime, Utc};
use lanlink_proto::packet::{format_hw_addr, ArpPacket, HwAddr};
use lanlink_proto::NeighborEntry;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct Neighbor {
    hw_addr: HwAddr,
    /// Connection the ARP came in on
    client: String,
    remote: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

#[derive(Default)]
pub struct NeighborTable {
    entries: RwLock<HashMap<Ipv4Addr, Neighbor>>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn the sender of an ARP frame; other frames are ignored
    pub async fn learn(&self, frame: &[u8], client: &str, remote: &str) {
        let Some(arp) = ArpPacket::from_frame(frame) else {
            return;
        };
        if arp.sender_ip.is_unspecified() {
            return;
        }

        let now = Utc::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(&arp.sender_ip) {
            Some(neighbor) if neighbor.hw_addr == arp.sender_hw && neighbor.client == client => {
                neighbor.updated = now;
            }
            _ => {
                debug!(
                    ip = %arp.sender_ip,
                    hw = %format_hw_addr(&arp.sender_hw),
                    client = remote,
                    "Neighbor learned"
                );
                entries.insert(
                    arp.sender_ip,
                    Neighbor {
                        hw_addr: arp.sender_hw,
                        client: client.to_string(),
                        remote: remote.to_string(),
                        created: now,
                        updated: now,
                    },
                );
            }
        }
    }

    pub async fn list(&self) -> Vec<NeighborEntry> {
        let now = Utc::now();
        let mut list: Vec<NeighborEntry> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(ip, neighbor)| NeighborEntry {
                hw_addr: format_hw_addr(&neighbor.hw_addr),
                ip_addr: ip.to_string(),
                client: neighbor.remote.clone(),
                uptime: (now - neighbor.created).num_seconds(),
            })
            .collect();
        list.sort_by(|a, b| a.ip_addr.cmp(&b.ip_addr));
        list
    }

    /// Last time `ip` was seen
    pub async fn last_seen(&self, ip: Ipv4Addr) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(&ip).map(|neighbor| neighbor.updated)
    }

    pub async fn remove_client(&self, client: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, neighbor| neighbor.client != client);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
