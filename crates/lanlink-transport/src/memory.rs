//! In-process transport over `tokio::io::duplex`
//!
//! Used to run a point against a switch inside one process (tests, demos).

use crate::link::{Acceptor, Connector, Link};
use crate::{TransportError, TransportResult};
use async_trait::async_trait;
use lanlink_proto::FrameCodec;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex};

const DUPLEX_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
pub struct MemoryConnector {
    address: String,
    codec: FrameCodec,
    incoming: mpsc::UnboundedSender<Link>,
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

#[derive(Debug)]
pub struct MemoryAcceptor {
    address: String,
    incoming: Mutex<mpsc::UnboundedReceiver<Link>>,
}

impl MemoryConnector {
    /// Connector and the acceptor it dials
    pub fn pair(address: impl Into<String>, codec: FrameCodec) -> (Self, MemoryAcceptor) {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                address: address.clone(),
                codec,
                incoming: tx,
                refusing: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
            },
            MemoryAcceptor {
                address,
                incoming: Mutex::new(rx),
            },
        )
    }

    /// Make subsequent dials fail as if the switch were unreachable
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of dial attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> TransportResult<Link> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(format!(
                "{}: connection refused",
                self.address
            )));
        }

        let local = format!("memory:{}", attempt);
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let server_link = Link::from_stream(server, self.codec.clone(), &self.address, &local);
        self.incoming
            .send(server_link)
            .map_err(|_| TransportError::ConnectionError("acceptor dropped".to_string()))?;

        Ok(Link::from_stream(
            client,
            self.codec.clone(),
            local,
            &self.address,
        ))
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn protocol(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> TransportResult<Link> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Err(TransportError::ConfigurationError(format!(
            "{} is an in-memory acceptor",
            self.address
        )))
    }
}
