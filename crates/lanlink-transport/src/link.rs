//! Frame-level halves of a transport and the traits that produce them

use crate::{TransportError, TransportResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lanlink_proto::{Frame, FrameCodec};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Receiving half of a link
#[async_trait]
pub trait FrameSource: Send + fmt::Debug {
    /// Receive the next frame; `TransportError::Closed` once the peer is gone
    async fn recv(&mut self) -> TransportResult<Frame>;
}

/// Sending half of a link
#[async_trait]
pub trait FrameSink: Send + fmt::Debug {
    async fn send(&mut self, frame: Frame) -> TransportResult<()>;

    /// Flush and shut down the sending direction
    async fn close(&mut self) -> TransportResult<()>;
}

/// An established transport, split into independent halves
#[derive(Debug)]
pub struct Link {
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
    pub local_addr: String,
    pub remote_addr: String,
    pub max_size: usize,
    pub min_size: usize,
}

impl Link {
    /// Frame a reliable byte stream with `codec`
    pub fn from_stream<S>(
        stream: S,
        codec: FrameCodec,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            max_size: codec.max_size(),
            min_size: codec.min_size(),
            source: Box::new(StreamSource {
                inner: FramedRead::new(reader, codec.clone()),
            }),
            sink: Box::new(StreamSink {
                inner: FramedWrite::new(writer, codec),
            }),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }
}

/// Client side: dials a switch
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> TransportResult<Link>;

    /// Address being dialed
    fn address(&self) -> &str;

    fn protocol(&self) -> &'static str;
}

/// Server side: yields one link per inbound peer
#[async_trait]
pub trait Acceptor: Send + Sync + fmt::Debug {
    async fn accept(&self) -> TransportResult<Link>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;
}

struct StreamSource<S> {
    inner: FramedRead<ReadHalf<S>, FrameCodec>,
}

impl<S> fmt::Debug for StreamSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("codec", self.inner.decoder())
            .finish()
    }
}

#[async_trait]
impl<S> FrameSource for StreamSource<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn recv(&mut self) -> TransportResult<Frame> {
        match self.inner.next().await {
            Some(frame) => Ok(frame?),
            None => Err(TransportError::Closed),
        }
    }
}

struct StreamSink<S> {
    inner: FramedWrite<WriteHalf<S>, FrameCodec>,
}

impl<S> fmt::Debug for StreamSink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("codec", self.inner.encoder())
            .finish()
    }
}

#[async_trait]
impl<S> FrameSink for StreamSink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        self.inner.send(frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        SinkExt::<Frame>::close(&mut self.inner).await?;
        Ok(())
    }
}
