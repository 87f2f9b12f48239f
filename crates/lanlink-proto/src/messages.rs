//! JSON bodies carried by control messages

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Login request sent by a point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub name: String,
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub network: String,
    pub uuid: String,
    pub alias: String,
    pub system: String,
}

/// Static route pushed along with a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteEntry {
    pub prefix: String,
    pub nexthop: String,
    pub metric: i32,
    pub mode: String,
}

/// A tenant network as exchanged in address requests and responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant: String,
    pub if_addr: String,
    pub ip_start: String,
    pub ip_end: String,
    pub netmask: String,
    pub routes: Vec<RouteEntry>,
}

impl NetworkDescriptor {
    /// Descriptor for `name` with an interface address such as `10.0.0.5/24`.
    ///
    /// A bare address keeps an empty netmask.
    pub fn new(name: impl Into<String>, address: &str) -> Self {
        let mut network = Self {
            name: name.into(),
            ..Default::default()
        };
        if address.contains('/') {
            if let Ok(net) = address.parse::<Ipv4Network>() {
                network.if_addr = net.ip().to_string();
                network.netmask = net.mask().to_string();
            }
        } else {
            network.if_addr = address.to_string();
        }
        network
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.if_addr.parse().ok()
    }

    pub fn prefix_len(&self) -> Option<u8> {
        let mask: Ipv4Addr = self.netmask.parse().ok()?;
        ipnetwork::ipv4_mask_to_prefix(mask).ok()
    }

    /// Interface address in CIDR notation, `None` until an address is known
    pub fn cidr(&self) -> Option<String> {
        let address = self.address()?;
        let prefix = self.prefix_len().unwrap_or(32);
        Some(format!("{}/{}", address, prefix))
    }

    pub fn subnet(&self) -> Option<Ipv4Network> {
        let address = self.address()?;
        Ipv4Network::new(address, self.prefix_len()?).ok()
    }
}

/// One row of the switch neighbor table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NeighborEntry {
    pub hw_addr: String,
    pub ip_addr: String,
    pub client: String,
    pub uptime: i64,
}

/// Point presence carried by keepalive pings and the leave notice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceMessage {
    pub datetime: i64,
    pub uuid: String,
    pub alias: String,
    pub address: String,
    pub connection: String,
}

impl PresenceMessage {
    pub fn now(
        uuid: impl Into<String>,
        alias: impl Into<String>,
        address: impl Into<String>,
        connection: impl Into<String>,
    ) -> Self {
        Self {
            datetime: chrono::Utc::now().timestamp(),
            uuid: uuid.into(),
            alias: alias.into(),
            address: address.into(),
            connection: connection.into(),
        }
    }
}

/// Prompt sent by a switch asking a point to log in again
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignInMessage {
    pub address: String,
    pub switch: String,
}
