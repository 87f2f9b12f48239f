//! Neighbor cache for routed devices

use lanlink_proto::packet::HwAddr;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub hw_addr: HwAddr,
    pub ip_addr: Ipv4Addr,
    pub created: Instant,
    pub updated: Instant,
}

/// Result of one expiry scan
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    /// Dropped from the cache
    pub expired: Vec<Ipv4Addr>,
    /// Kept, but due for re-confirmation
    pub stale: Vec<Ipv4Addr>,
}

impl Sweep {
    /// Every address that should be resolved again
    pub fn to_resolve(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.expired.iter().chain(self.stale.iter()).copied()
    }
}

pub struct NeighborCache {
    entries: RwLock<HashMap<Ipv4Addr, Neighbor>>,
    timeout: Duration,
    refresh: Duration,
}

impl NeighborCache {
    pub fn new(timeout: Duration, refresh: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
            refresh,
        }
    }

    pub fn add(&self, ip_addr: Ipv4Addr, hw_addr: HwAddr) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(ip_addr)
            .and_modify(|neighbor| {
                neighbor.hw_addr = hw_addr;
                neighbor.updated = now;
            })
            .or_insert(Neighbor {
                hw_addr,
                ip_addr,
                created: now,
                updated: now,
            });
    }

    pub fn get(&self, ip_addr: Ipv4Addr) -> Option<HwAddr> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip_addr)
            .map(|neighbor| neighbor.hw_addr)
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<Neighbor> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect()
    }

    /// Drop entries idle past the timeout, report the ones past the refresh
    /// interval
    pub fn sweep(&self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|ip, neighbor| {
            let idle = now.saturating_duration_since(neighbor.updated);
            if idle >= self.timeout {
                sweep.expired.push(*ip);
                false
            } else {
                if idle >= self.refresh {
                    sweep.stale.push(*ip);
                }
                true
            }
        });
        sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW: HwAddr = [0x02, 0, 0, 0, 0, 0x01];

    #[tokio::test(start_paused = true)]
    async fn test_sweep_refresh_then_expire() {
        let cache = NeighborCache::new(Duration::from_secs(180), Duration::from_secs(60));
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        cache.add(ip, HW);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.sweep(Instant::now()), Sweep::default());

        tokio::time::advance(Duration::from_secs(40)).await;
        let sweep = cache.sweep(Instant::now());
        assert_eq!(sweep.stale, vec![ip]);
        assert!(sweep.expired.is_empty());
        assert_eq!(cache.get(ip), Some(HW));

        tokio::time::advance(Duration::from_secs(120)).await;
        let sweep = cache.sweep(Instant::now());
        assert_eq!(sweep.expired, vec![ip]);
        assert_eq!(sweep.to_resolve().collect::<Vec<_>>(), vec![ip]);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_refreshes_entry() {
        let cache = NeighborCache::new(Duration::from_secs(180), Duration::from_secs(60));
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        cache.add(ip, HW);

        tokio::time::advance(Duration::from_secs(100)).await;
        cache.add(ip, [0x02, 0, 0, 0, 0, 0x02]);
        tokio::time::advance(Duration::from_secs(100)).await;

        let sweep = cache.sweep(Instant::now());
        assert!(sweep.expired.is_empty());
        assert_eq!(cache.get(ip), Some([0x02, 0, 0, 0, 0, 0x02]));
        assert_eq!(cache.list()[0].created + Duration::from_secs(100), cache.list()[0].updated);
    }
}
