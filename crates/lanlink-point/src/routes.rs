//! Next-hop selection for routed devices

use ipnetwork::Ipv4Network;
use lanlink_proto::NetworkDescriptor;
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// Maps a packet destination to the address that must be resolved on the
/// overlay
pub trait NextHop: Send + Sync {
    fn next_hop(&self, destination: Ipv4Addr) -> Ipv4Addr;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Directly reachable on the overlay subnet
    Local,
    /// Reached through `next_hop`
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixRule {
    pub destination: Ipv4Network,
    pub next_hop: Ipv4Addr,
    pub kind: RuleKind,
}

/// Ordered prefix rules; the first match wins
#[derive(Debug, Default)]
pub struct RouteTable {
    rules: RwLock<Vec<PrefixRule>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the rules from a negotiated network
    pub fn replace(&self, network: &NetworkDescriptor) {
        let own = network.address();
        let mut rules = Vec::with_capacity(network.routes.len() + 1);

        if let Some(subnet) = network.subnet() {
            let local = Ipv4Network::new(subnet.network(), subnet.prefix()).unwrap_or(subnet);
            rules.push(PrefixRule {
                destination: local,
                next_hop: Ipv4Addr::UNSPECIFIED,
                kind: RuleKind::Local,
            });
        }

        for route in &network.routes {
            let destination = match route.prefix.parse::<Ipv4Network>() {
                Ok(destination) => destination,
                Err(e) => {
                    warn!(prefix = %route.prefix, "Skipping route: {}", e);
                    continue;
                }
            };
            let next_hop = match route.nexthop.parse::<Ipv4Addr>() {
                Ok(next_hop) => next_hop,
                Err(e) => {
                    warn!(nexthop = %route.nexthop, "Skipping route: {}", e);
                    continue;
                }
            };
            if Some(next_hop) == own {
                debug!(prefix = %destination, "Route points at ourselves, ignored");
                continue;
            }
            rules.push(PrefixRule {
                destination,
                next_hop,
                kind: RuleKind::Static,
            });
        }

        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = rules;
    }

    pub fn clear(&self) {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn rules(&self) -> Vec<PrefixRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NextHop for RouteTable {
    fn next_hop(&self, destination: Ipv4Addr) -> Ipv4Addr {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        match rules.iter().find(|rule| rule.destination.contains(destination)) {
            Some(rule) if rule.kind == RuleKind::Static => rule.next_hop,
            _ => destination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_proto::RouteEntry;

    fn route(prefix: &str, nexthop: &str) -> RouteEntry {
        RouteEntry {
            prefix: prefix.to_string(),
            nexthop: nexthop.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_static_route_next_hop() {
        let mut network = NetworkDescriptor::new("default", "10.0.0.5/24");
        network.routes.push(route("192.168.10.0/24", "10.0.0.1"));
        let table = RouteTable::new();
        table.replace(&network);

        assert_eq!(table.rules().len(), 2);
        assert_eq!(
            table.next_hop("192.168.10.7".parse().unwrap()),
            "10.0.0.1".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            table.next_hop("10.0.0.9".parse().unwrap()),
            "10.0.0.9".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            table.next_hop("8.8.8.8".parse().unwrap()),
            "8.8.8.8".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_route_via_self_is_ignored() {
        let mut network = NetworkDescriptor::new("default", "10.0.0.5/24");
        network.routes.push(route("192.168.10.0/24", "10.0.0.5"));
        network.routes.push(route("not-a-prefix", "10.0.0.1"));
        let table = RouteTable::new();
        table.replace(&network);

        assert_eq!(table.rules().len(), 1);
        assert_eq!(table.rules()[0].kind, RuleKind::Local);
        table.clear();
        assert!(table.rules().is_empty());
    }
}
