//! Transport abstraction layer
//!
//! A [`Connection`] drives one duplex session over any backend that can
//! produce a [`Link`]: a pair of frame reader/writer halves plus the peer
//! addresses. Backends are composed by construction through the
//! [`Connector`] (client side) and [`Acceptor`] (server side) traits.

pub mod connection;
pub mod device;
pub mod link;
pub mod memory;
pub mod status;
pub mod tcp;
pub mod udp;

pub use connection::{Connection, ConnectionStats, StatusListener};
pub use device::{
    Device, DeviceFactory, DeviceMode, VirtualDevice, VirtualDeviceFactory, VirtualDeviceHandle,
};
pub use link::{Acceptor, Connector, FrameSink, FrameSource, Link};
pub use memory::{MemoryAcceptor, MemoryConnector};
pub use status::Status;
pub use tcp::{TcpAcceptor, TcpConnector};
pub use udp::{UdpAcceptor, UdpConnector};

use lanlink_proto::ProtocolError;
use thiserror::Error;

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
