//! Overlay LAN protocol definitions
//!
//! Wire framing, payload ciphers, the control-message vocabulary, the JSON
//! bodies exchanged between points and switches, and the small amount of
//! Ethernet/ARP/IPv4 parsing needed to run a routed (TUN) device.

pub mod cipher;
pub mod control;
pub mod error;
pub mod frame;
pub mod messages;
pub mod packet;

pub use cipher::{BlockCrypt, CipherAlgorithm, CryptConfig};
pub use control::{Action, ControlMessage, Operator};
pub use error::ProtocolError;
pub use frame::{Frame, FrameCodec};
pub use messages::*;

/// Network name used when a login or lease request does not name one
pub const DEFAULT_NETWORK: &str = "default";

/// Default switch listen port
pub const DEFAULT_PORT: u16 = 10002;
