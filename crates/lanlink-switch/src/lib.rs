//! Switch (server) side of the overlay
//!
//! Every inbound connection passes the [`Access`] gate before any of its
//! frames are bridged to a per-session device; authenticated control
//! requests are answered by the [`RequestHandler`].

pub mod access;
pub mod config;
pub mod neighbor;
pub mod network;
pub mod registry;
pub mod request;
pub mod switch;

pub use access::{Access, AccessStats};
pub use config::{
    ConfigError, HostConfig, NetworkConfig, Protocol, SubnetConfig, SwitchConfig,
    SwitchConfigBuilder, UserConfig,
};
pub use neighbor::NeighborTable;
pub use network::{Lease, LeaseKind, NetworkStore};
pub use registry::{PointRegistry, PointSession};
pub use request::RequestHandler;
pub use switch::{ServerStats, Switch};

use lanlink_auth::AuthError;
use lanlink_proto::ProtocolError;
use lanlink_transport::TransportError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Switch errors
#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] std::io::Error),

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

pub type SwitchResult<T> = Result<T, SwitchError>;

/// Connections queued for teardown
pub type OfflineSender = mpsc::UnboundedSender<Arc<lanlink_transport::Connection>>;
