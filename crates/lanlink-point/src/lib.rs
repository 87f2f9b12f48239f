//! Point (client) side of the overlay
//!
//! A [`Point`] pairs a [`SocketWorker`], which keeps one authenticated
//! connection to a switch alive, with a [`TapWorker`], which moves frames
//! between that connection and a local device.

pub mod config;
pub mod event;
pub mod neighbor;
pub mod point;
pub mod reconnect;
pub mod routes;
pub mod socket;
pub mod tap;

pub use config::{ConfigError, InterfaceConfig, PointConfig, PointConfigBuilder, Protocol};
pub use event::WorkerEvent;
pub use neighbor::{Neighbor, NeighborCache};
pub use point::{NoopListener, Point, PointListener};
pub use reconnect::{ReconnectConfig, ReconnectManager};
pub use routes::{NextHop, PrefixRule, RouteTable, RuleKind};
pub use socket::{SocketListener, SocketWorker};
pub use tap::{Egress, Ingress, TapConfig, TapCore, TapWorker};

/// Frames buffered between the two workers in each direction
pub const FRAME_QUEUE: usize = 1024;
