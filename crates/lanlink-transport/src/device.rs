//! Local network device abstraction
//!
//! A device is a duplex stream of whole frames (TAP) or IP packets (TUN)
//! with a name and an MTU. The OS-backed implementation lives with the
//! embedding application; [`VirtualDevice`] is a channel-backed device whose
//! far end is held by a [`VirtualDeviceHandle`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const DEVICE_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Bridged: Ethernet frames in both directions
    #[default]
    Tap,
    /// Routed: bare IP packets on the device side
    Tun,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Tap => f.write_str("tap"),
            DeviceMode::Tun => f.write_str("tun"),
        }
    }
}

/// Read and write may run concurrently; each direction has one user.
#[async_trait]
pub trait Device: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn mtu(&self) -> usize;

    fn mode(&self) -> DeviceMode;

    /// Next frame (or packet in TUN mode) from the host
    async fn read(&self) -> io::Result<Bytes>;

    /// Deliver a frame (or packet) to the host
    async fn write(&self, frame: Bytes) -> io::Result<()>;

    /// Release the device; pending and future reads fail
    async fn close(&self);
}

/// Opens devices, possibly repeatedly after a reset
#[async_trait]
pub trait DeviceFactory: Send + Sync + fmt::Debug {
    async fn open(&self) -> io::Result<Arc<dyn Device>>;
}

#[derive(Debug)]
pub struct VirtualDevice {
    name: String,
    mtu: usize,
    mode: DeviceMode,
    from_host: Mutex<mpsc::Receiver<Bytes>>,
    to_host: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// Host side of a [`VirtualDevice`]
#[derive(Debug)]
pub struct VirtualDeviceHandle {
    name: String,
    inject: mpsc::Sender<Bytes>,
    written: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl VirtualDevice {
    pub fn pair(
        name: impl Into<String>,
        mtu: usize,
        mode: DeviceMode,
    ) -> (Arc<VirtualDevice>, VirtualDeviceHandle) {
        let name = name.into();
        let (inject, from_host) = mpsc::channel(DEVICE_QUEUE);
        let (to_host, written) = mpsc::channel(DEVICE_QUEUE);
        let closed = CancellationToken::new();
        (
            Arc::new(VirtualDevice {
                name: name.clone(),
                mtu,
                mode,
                from_host: Mutex::new(from_host),
                to_host,
                closed: closed.clone(),
            }),
            VirtualDeviceHandle {
                name,
                inject,
                written,
                closed,
            },
        )
    }
}

#[async_trait]
impl Device for VirtualDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn mode(&self) -> DeviceMode {
        self.mode
    }

    async fn read(&self) -> io::Result<Bytes> {
        let mut from_host = self.from_host.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(io::Error::new(io::ErrorKind::NotConnected, "device closed")),
            frame = from_host.recv() => frame.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "host side gone")),
        }
    }

    async fn write(&self, frame: Bytes) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        self.to_host
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host side gone"))
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

impl VirtualDeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a frame to the device as if the host had sent it
    pub async fn inject(&self, frame: impl Into<Bytes>) -> io::Result<()> {
        self.inject
            .send(frame.into())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))
    }

    /// Next frame written to the device
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.written.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.written.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Factory producing a fresh [`VirtualDevice`] per open, publishing each
/// host handle on a channel
#[derive(Debug)]
pub struct VirtualDeviceFactory {
    name: String,
    mtu: usize,
    mode: DeviceMode,
    handles: mpsc::UnboundedSender<VirtualDeviceHandle>,
    opened: AtomicUsize,
}

impl VirtualDeviceFactory {
    pub fn new(
        name: impl Into<String>,
        mtu: usize,
        mode: DeviceMode,
    ) -> (Self, mpsc::UnboundedReceiver<VirtualDeviceHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                mtu,
                mode,
                handles: tx,
                opened: AtomicUsize::new(0),
            },
            rx,
        )
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceFactory for VirtualDeviceFactory {
    async fn open(&self) -> io::Result<Arc<dyn Device>> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let (device, handle) = VirtualDevice::pair(format!("{}{}", self.name, n), self.mtu, self.mode);
        // nobody watching is fine: writes then fail and the worker logs them
        let _ = self.handles.send(handle);
        Ok(device)
    }
}
