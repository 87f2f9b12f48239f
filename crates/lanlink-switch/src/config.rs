//! Switch configuration

use lanlink_auth::{Credential, CredentialStore, Role};
use lanlink_proto::{CryptConfig, FrameCodec, NetworkDescriptor, RouteEntry, DEFAULT_NETWORK};
use lanlink_transport::{Acceptor, TcpAcceptor, TransportResult, UdpAcceptor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Dynamic address pool of a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetConfig {
    pub start: String,
    pub end: String,
    pub netmask: String,
}

/// Address pinned to a point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    #[serde(alias = "alias")]
    pub uuid: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
    /// The switch's own address on this network, `10.0.0.1/24`; never leased
    pub address: String,
    pub subnet: SubnetConfig,
    pub routes: Vec<RouteEntry>,
    pub hosts: Vec<HostConfig>,
    pub users: Vec<UserConfig>,
}

impl NetworkConfig {
    /// Fill the netmask from the network address when the subnet omits it
    pub fn normalize(&mut self) {
        if self.name.is_empty() {
            self.name = DEFAULT_NETWORK.to_string();
        }
        if self.subnet.netmask.is_empty() && !self.address.is_empty() {
            self.subnet.netmask = NetworkDescriptor::new(self.name.clone(), &self.address).netmask;
        }
    }

    /// Network as handed out to points, without an interface address
    pub fn descriptor(&self) -> NetworkDescriptor {
        NetworkDescriptor {
            name: self.name.clone(),
            ip_start: self.subnet.start.clone(),
            ip_end: self.subnet.end.clone(),
            netmask: self.subnet.netmask.clone(),
            routes: self.routes.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub listen: String,
    pub protocol: Protocol,
    /// Name announced in sign-in prompts, defaults to the host name
    pub alias: String,
    /// Read/write deadline of accepted connections
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_clients: usize,
    pub crypt: Option<CryptConfig>,
    /// Credentials file, `name@network:password[:role]` per line
    pub users_file: Option<String>,
    pub networks: Vec<NetworkConfig>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", lanlink_proto::DEFAULT_PORT),
            protocol: Protocol::Tcp,
            alias: String::new(),
            timeout: Duration::from_secs(60),
            max_clients: 128,
            crypt: None,
            users_file: None,
            networks: Vec::new(),
        }
    }
}

impl SwitchConfig {
    pub fn builder() -> SwitchConfigBuilder {
        SwitchConfigBuilder::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: SwitchConfig = serde_yaml::from_str(&content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn normalize(&mut self) {
        if self.alias.is_empty() {
            self.alias = hostname::get()
                .map(|name| name.to_string_lossy().to_lowercase())
                .unwrap_or_default();
        }
        if self.networks.is_empty() {
            self.networks.push(NetworkConfig::default());
        }
        for network in &mut self.networks {
            network.normalize();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("listen is required".to_string()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be positive".to_string()));
        }
        for network in &self.networks {
            let start = network.subnet.start.parse::<std::net::Ipv4Addr>();
            let end = network.subnet.end.parse::<std::net::Ipv4Addr>();
            match (start, end) {
                (Ok(start), Ok(end)) if start > end => {
                    return Err(ConfigError::Invalid(format!(
                        "network {}: subnet start {} is after end {}",
                        network.name, start, end
                    )));
                }
                (Err(_), _) | (_, Err(_))
                    if !network.subnet.start.is_empty() || !network.subnet.end.is_empty() =>
                {
                    return Err(ConfigError::Invalid(format!(
                        "network {}: invalid subnet range",
                        network.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn codec(&self) -> FrameCodec {
        let cipher = self
            .crypt
            .as_ref()
            .and_then(|crypt| crypt.build())
            .map(Arc::new);
        FrameCodec::new().with_cipher(cipher)
    }

    /// Bind the configured listener
    pub async fn bind(&self) -> TransportResult<Arc<dyn Acceptor>> {
        Ok(match self.protocol {
            Protocol::Tcp => Arc::new(TcpAcceptor::bind(&self.listen, self.codec()).await?),
            Protocol::Udp => Arc::new(UdpAcceptor::bind(&self.listen, self.codec()).await?),
        })
    }

    /// Credential store from the users file plus every network's inline users
    pub async fn credentials(&self) -> Result<CredentialStore, ConfigError> {
        let store = match &self.users_file {
            Some(path) => CredentialStore::from_file(Path::new(path))
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            None => CredentialStore::new(),
        };
        for network in &self.networks {
            for user in &network.users {
                let (name, user_network) = match user.name.split_once('@') {
                    Some((name, user_network)) => (name, user_network),
                    None => (user.name.as_str(), network.name.as_str()),
                };
                store
                    .add(Credential::new(name, user_network, &user.password, user.role))
                    .await;
            }
        }
        info!(count = store.len().await, "Credentials ready");
        Ok(store)
    }
}

/// Builder for [`SwitchConfig`]
#[derive(Default)]
pub struct SwitchConfigBuilder {
    config: SwitchConfig,
}

impl SwitchConfigBuilder {
    pub fn listen(mut self, listen: impl Into<String>) -> Self {
        self.config.listen = listen.into();
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.config.alias = alias.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.config.max_clients = max_clients;
        self
    }

    pub fn crypt(mut self, crypt: CryptConfig) -> Self {
        self.config.crypt = Some(crypt);
        self
    }

    pub fn network(mut self, network: NetworkConfig) -> Self {
        self.config.networks.push(network);
        self
    }

    pub fn build(self) -> Result<SwitchConfig, String> {
        let mut config = self.config;
        config.normalize();
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}
