//! UDP datagram transport: exactly one frame per datagram

use crate::link::{Acceptor, Connector, FrameSink, FrameSource, Link};
use crate::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use lanlink_proto::frame::MAX_BUF;
use lanlink_proto::{Frame, FrameCodec};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Datagrams buffered per peer before new ones are dropped
const PEER_QUEUE: usize = 256;

/// Links accepted but not yet picked up
const ACCEPT_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct UdpConnector {
    address: String,
    codec: FrameCodec,
}

impl UdpConnector {
    pub fn new(address: impl Into<String>, codec: FrameCodec) -> Self {
        Self {
            address: address.into(),
            codec,
        }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    async fn connect(&self) -> TransportResult<Link> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.address).await?;
        let local = socket.local_addr()?.to_string();
        let remote = socket.peer_addr()?.to_string();
        let socket = Arc::new(socket);

        Ok(Link {
            source: Box::new(ConnectedSource {
                socket: socket.clone(),
                codec: self.codec.clone(),
                buf: vec![0u8; MAX_BUF],
            }),
            sink: Box::new(DatagramSink {
                socket,
                peer: None,
                codec: self.codec.clone(),
            }),
            local_addr: local,
            remote_addr: remote,
            max_size: self.codec.max_size(),
            min_size: self.codec.min_size(),
        })
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn protocol(&self) -> &'static str {
        "udp"
    }
}

/// Server side: demultiplexes datagrams by peer address into links
#[derive(Debug)]
pub struct UdpAcceptor {
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<Link>>,
    task: JoinHandle<()>,
}

impl UdpAcceptor {
    pub async fn bind(address: &str, codec: FrameCodec) -> TransportResult<Self> {
        let socket = Arc::new(UdpSocket::bind(address).await?);
        let local_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let task = tokio::spawn(demultiplex(socket, codec, tx));
        Ok(Self {
            local_addr,
            incoming: Mutex::new(rx),
            task,
        })
    }
}

impl Drop for UdpAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Acceptor for UdpAcceptor {
    async fn accept(&self) -> TransportResult<Link> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }
}

async fn demultiplex(socket: Arc<UdpSocket>, codec: FrameCodec, accepted: mpsc::Sender<Link>) {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; MAX_BUF];
    let local = socket
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                continue;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        if peers.get(&peer).is_some_and(|tx| tx.is_closed()) {
            peers.remove(&peer);
        }
        if !peers.contains_key(&peer) {
            let (tx, rx) = mpsc::channel(PEER_QUEUE);
            let link = Link {
                source: Box::new(PeerSource {
                    datagrams: rx,
                    codec: codec.clone(),
                }),
                sink: Box::new(DatagramSink {
                    socket: socket.clone(),
                    peer: Some(peer),
                    codec: codec.clone(),
                }),
                local_addr: local.clone(),
                remote_addr: peer.to_string(),
                max_size: codec.max_size(),
                min_size: codec.min_size(),
            };
            if accepted.try_send(link).is_err() {
                debug!(%peer, "Accept queue full, dropping datagram");
                continue;
            }
            admit_peer(&mut peers, peer, tx);
        }

        if let Some(tx) = peers.get(&peer) {
            if tx.try_send(datagram).is_err() {
                debug!(%peer, "Peer queue full, dropping datagram");
            }
        }
    }
}

/// Register a peer's queue, forgetting peers whose links have closed
fn admit_peer(
    peers: &mut HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
) {
    peers.retain(|_, tx| !tx.is_closed());
    peers.insert(peer, tx);
}

struct ConnectedSource {
    socket: Arc<UdpSocket>,
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl std::fmt::Debug for ConnectedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSource")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FrameSource for ConnectedSource {
    async fn recv(&mut self) -> TransportResult<Frame> {
        let n = self.socket.recv(&mut self.buf).await?;
        Ok(self.codec.decode_datagram(&self.buf[..n])?)
    }
}

#[derive(Debug)]
struct PeerSource {
    datagrams: mpsc::Receiver<Bytes>,
    codec: FrameCodec,
}

#[async_trait]
impl FrameSource for PeerSource {
    async fn recv(&mut self) -> TransportResult<Frame> {
        let datagram = self.datagrams.recv().await.ok_or(TransportError::Closed)?;
        Ok(self.codec.decode_datagram(&datagram)?)
    }
}

#[derive(Debug)]
struct DatagramSink {
    socket: Arc<UdpSocket>,
    /// `None` when the socket is connected
    peer: Option<SocketAddr>,
    codec: FrameCodec,
}

#[async_trait]
impl FrameSink for DatagramSink {
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        let datagram = self.codec.encode_datagram(&frame)?;
        match self.peer {
            Some(peer) => self.socket.send_to(&datagram, peer).await?,
            None => self.socket.send(&datagram).await?,
        };
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_peer_sweeps_closed_links() {
        let mut peers = HashMap::new();
        let gone: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let kept: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let fresh: SocketAddr = "10.0.0.3:4000".parse().unwrap();

        let (tx, gone_rx) = mpsc::channel::<Bytes>(1);
        admit_peer(&mut peers, gone, tx);
        let (tx, _kept_rx) = mpsc::channel::<Bytes>(1);
        admit_peer(&mut peers, kept, tx);
        assert_eq!(peers.len(), 2);

        drop(gone_rx);
        let (tx, _fresh_rx) = mpsc::channel::<Bytes>(1);
        admit_peer(&mut peers, fresh, tx);

        assert_eq!(peers.len(), 2);
        assert!(!peers.contains_key(&gone));
        assert!(peers.contains_key(&kept));
        assert!(peers.contains_key(&fresh));
    }
}
