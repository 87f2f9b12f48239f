//! TCP stream transport

use crate::link::{Acceptor, Connector, Link};
use crate::TransportResult;
use async_trait::async_trait;
use lanlink_proto::FrameCodec;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    codec: FrameCodec,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, codec: FrameCodec) -> Self {
        Self {
            address: address.into(),
            codec,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> TransportResult<Link> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        debug!(%local, %remote, "TCP connected");
        Ok(Link::from_stream(
            stream,
            self.codec.clone(),
            local.to_string(),
            remote.to_string(),
        ))
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn protocol(&self) -> &'static str {
        "tcp"
    }
}

#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    codec: FrameCodec,
}

impl TcpAcceptor {
    pub async fn bind(address: &str, codec: FrameCodec) -> TransportResult<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, codec })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> TransportResult<Link> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        Ok(Link::from_stream(
            stream,
            self.codec.clone(),
            local.to_string(),
            remote.to_string(),
        ))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
