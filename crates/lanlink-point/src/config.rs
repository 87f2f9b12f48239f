//! Point configuration

use crate::reconnect::ReconnectConfig;
use lanlink_proto::{CryptConfig, FrameCodec, LoginRequest, DEFAULT_NETWORK, DEFAULT_PORT};
use lanlink_transport::{Connector, DeviceMode, TcpConnector, UdpConnector};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

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

/// Local device settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    pub name: String,
    pub mtu: usize,
    /// Static tunnel address in CIDR notation, empty for none
    pub address: String,
    pub mode: DeviceMode,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            mtu: 1518,
            address: String::new(),
            mode: DeviceMode::Tap,
        }
    }
}

/// Point configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointConfig {
    /// Switch address, `host[:port]`
    pub connection: String,
    pub protocol: Protocol,
    /// `name` or `name@network`
    pub username: String,
    pub password: String,
    pub network: String,
    pub alias: String,
    pub uuid: String,
    /// Read/write deadline and idle timeout before reconnecting
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Ask the switch for an address
    pub request_addr: bool,
    pub interface: InterfaceConfig,
    pub crypt: Option<CryptConfig>,
    #[serde(with = "duration_secs")]
    pub keepalive: Duration,
    #[serde(skip)]
    pub tick: Duration,
    #[serde(skip)]
    pub reconnect: ReconnectConfig,
}

/// Helper module for serializing Duration as seconds
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
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            protocol: Protocol::Tcp,
            username: String::new(),
            password: String::new(),
            network: String::new(),
            alias: String::new(),
            uuid: String::new(),
            timeout: Duration::from_secs(60),
            request_addr: true,
            interface: InterfaceConfig::default(),
            crypt: None,
            keepalive: Duration::from_secs(10),
            tick: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl PointConfig {
    pub fn builder() -> PointConfigBuilder {
        PointConfigBuilder::default()
    }

    /// Parse a YAML or JSON file as is
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load from a YAML or JSON file and normalize
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read(path)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill defaults derived from other fields
    pub fn normalize(&mut self) {
        if let Some((name, network)) = self.username.split_once('@') {
            self.network = network.to_string();
            self.username = name.to_string();
        }
        if self.network.is_empty() {
            self.network = DEFAULT_NETWORK.to_string();
        }
        if self.alias.is_empty() {
            self.alias = hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        self.alias = self.alias.to_lowercase();
        if self.uuid.is_empty() {
            self.uuid = self.alias.clone();
        }
        if !self.connection.is_empty() && !self.connection.contains(':') {
            self.connection = format!("{}:{}", self.connection, DEFAULT_PORT);
        }
        if self.interface.name.is_empty() {
            self.interface.name = self.interface.mode.to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.is_empty() {
            return Err(ConfigError::Invalid("connection is required".to_string()));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Invalid("username is required".to_string()));
        }
        if self.tick.is_zero() || self.keepalive.is_zero() {
            return Err(ConfigError::Invalid(
                "tick and keepalive must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Credential key as the switch sees it
    pub fn id(&self) -> String {
        format!("{}@{}", self.username, self.network)
    }

    pub fn login_request(&self) -> LoginRequest {
        LoginRequest {
            name: self.id(),
            password: self.password.clone(),
            token: String::new(),
            network: self.network.clone(),
            uuid: self.uuid.clone(),
            alias: self.alias.clone(),
            system: std::env::consts::OS.to_string(),
        }
    }

    pub fn codec(&self) -> FrameCodec {
        let cipher = self
            .crypt
            .as_ref()
            .and_then(|crypt| crypt.build())
            .map(Arc::new);
        FrameCodec::new().with_cipher(cipher)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        match self.protocol {
            Protocol::Tcp => Arc::new(TcpConnector::new(&self.connection, self.codec())),
            Protocol::Udp => Arc::new(UdpConnector::new(&self.connection, self.codec())),
        }
    }
}

/// Builder for [`PointConfig`]
#[derive(Default)]
pub struct PointConfigBuilder {
    config: PointConfig,
}

impl PointConfigBuilder {
    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.config.connection = connection.into();
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.config.alias = alias.into();
        self
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.config.uuid = uuid.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn request_addr(mut self, request: bool) -> Self {
        self.config.request_addr = request;
        self
    }

    pub fn interface(mut self, interface: InterfaceConfig) -> Self {
        self.config.interface = interface;
        self
    }

    pub fn crypt(mut self, crypt: CryptConfig) -> Self {
        self.config.crypt = Some(crypt);
        self
    }

    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.config.keepalive = keepalive;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.config.tick = tick;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn build(self) -> Result<PointConfig, String> {
        let mut config = self.config;
        config.normalize();
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builder_normalizes() {
        let config = PointConfig::builder()
            .connection("switch.example.com")
            .username("hi@lab")
            .password("pw")
            .alias("Laptop")
            .build()
            .unwrap();

        assert_eq!(config.connection, "switch.example.com:10002");
        assert_eq!(config.username, "hi");
        assert_eq!(config.network, "lab");
        assert_eq!(config.alias, "laptop");
        assert_eq!(config.uuid, "laptop");
        assert_eq!(config.interface.name, "tap");
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_builder_requires_username() {
        let result = PointConfig::builder().connection("127.0.0.1:10002").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_login_request() {
        let config = PointConfig::builder()
            .connection("127.0.0.1:10002")
            .username("hi")
            .password("pw")
            .alias("box")
            .uuid("7f3a")
            .build()
            .unwrap();
        let login = config.login_request();

        assert_eq!(login.name, "hi@default");
        assert_eq!(login.uuid, "7f3a");
        assert_eq!(login.alias, "box");
        assert!(!login.system.is_empty());
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
connection: 10.1.1.1:10002
protocol: udp
username: hi@lab
password: pw
alias: box
timeout: 30
interface:
  mode: tun
  address: 192.168.100.7/24
crypt:
  algorithm: aes-256
  secret: topsecret
"#
        )
        .unwrap();

        let config = PointConfig::load(file.path()).unwrap();
        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(config.network, "lab");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.interface.mode, DeviceMode::Tun);
        assert_eq!(config.interface.mtu, 1518);
        assert_eq!(config.keepalive, Duration::from_secs(10));
        assert!(config.codec().cipher().is_some());
    }

    #[test]
    fn test_load_yaml_cipher_name_any_case() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
connection: 10.1.1.1:10002
username: hi
password: pw
crypt:
  algorithm: Aes256
  secret: topsecret
"#
        )
        .unwrap();

        let config = PointConfig::load(file.path()).unwrap();
        let crypt = config.crypt.as_ref().unwrap();
        assert_eq!(crypt.algorithm, lanlink_proto::CipherAlgorithm::Aes256);
        assert_eq!(
            config.codec().cipher().map(|c| c.algorithm()),
            Some(lanlink_proto::CipherAlgorithm::Aes256)
        );
    }
}
