//! TapWorker: bridges the local device and the socket worker
//!
//! In TAP mode frames pass through untouched. In TUN mode the device only
//! speaks IP, so [`TapCore`] synthesizes the Ethernet layer: it resolves
//! next hops through ARP, answers ARP for its own address and strips
//! headers on the way in.

use crate::event::WorkerEvent;
use crate::neighbor::NeighborCache;
use crate::routes::NextHop;
use bytes::Bytes;
use ipnetwork::Ipv4Network;
use lanlink_proto::packet::{
    self, ArpOperation, ArpPacket, EthernetHeader, HwAddr, BROADCAST_HW, ETHERNET_HEADER_SIZE,
    ETH_P_ARP, ETH_P_IP4,
};
use lanlink_proto::Frame;
use lanlink_transport::{Device, DeviceFactory, DeviceMode};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TapConfig {
    pub neighbor_tick: Duration,
    pub neighbor_timeout: Duration,
    pub neighbor_refresh: Duration,
    /// Wait before reopening a failed device
    pub reopen_delay: Duration,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            neighbor_tick: Duration::from_secs(5),
            neighbor_timeout: Duration::from_secs(180),
            neighbor_refresh: Duration::from_secs(60),
            reopen_delay: Duration::from_secs(5),
        }
    }
}

/// Outcome of a packet read from the device
#[derive(Debug, PartialEq, Eq)]
pub enum Egress {
    Forward(Frame),
    /// Next hop unknown; the packet is gone and this ARP request goes out
    /// instead
    Resolve(Frame),
    Drop,
}

/// Outcome of a frame received from the switch
#[derive(Debug, PartialEq, Eq)]
pub enum Ingress {
    /// Write to the device
    Deliver(Bytes),
    /// Send back to the switch
    Reply(Frame),
    Consumed,
    Drop,
}

/// Per-session packet logic, shared by the device reader and the worker loop
pub struct TapCore {
    mode: DeviceMode,
    hw_addr: HwAddr,
    address: RwLock<Option<Ipv4Addr>>,
    neighbors: NeighborCache,
    next_hop: Option<Arc<dyn NextHop>>,
}

impl TapCore {
    pub fn new(mode: DeviceMode, config: &TapConfig, next_hop: Option<Arc<dyn NextHop>>) -> Self {
        Self {
            mode,
            hw_addr: packet::random_hw_addr(),
            address: RwLock::new(None),
            neighbors: NeighborCache::new(config.neighbor_timeout, config.neighbor_refresh),
            next_hop,
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn hw_addr(&self) -> HwAddr {
        self.hw_addr
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        *self.address.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a new protocol address; learned neighbors no longer apply
    pub fn set_address(&self, address: Option<Ipv4Addr>) {
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = address;
        self.neighbors.clear();
    }

    pub fn neighbors(&self) -> &NeighborCache {
        &self.neighbors
    }

    /// Broadcast ARP request for `target`, if we have an address to ask from
    pub fn resolve(&self, target: Ipv4Addr) -> Option<Frame> {
        let Some(own) = self.address() else {
            debug!(%target, "No local address, cannot resolve");
            return None;
        };
        let request = ArpPacket::request(self.hw_addr, own, target);
        Some(Frame::new(request.to_frame(BROADCAST_HW)))
    }

    pub fn egress(&self, packet: Bytes) -> Egress {
        if self.mode == DeviceMode::Tap {
            return Egress::Forward(Frame::new(packet));
        }

        let Some(destination) = packet::ipv4_destination(&packet) else {
            return Egress::Drop;
        };
        if destination.is_broadcast() || destination.is_multicast() {
            let header = EthernetHeader::new(BROADCAST_HW, self.hw_addr, ETH_P_IP4);
            return Egress::Forward(Frame::new(header.wrap(&packet)));
        }

        let hop = match &self.next_hop {
            Some(next_hop) => next_hop.next_hop(destination),
            None => destination,
        };
        match self.neighbors.get(hop) {
            Some(hw) => {
                let header = EthernetHeader::new(hw, self.hw_addr, ETH_P_IP4);
                Egress::Forward(Frame::new(header.wrap(&packet)))
            }
            None => match self.resolve(hop) {
                Some(request) => Egress::Resolve(request),
                None => Egress::Drop,
            },
        }
    }

    pub fn ingress(&self, frame: Frame) -> Ingress {
        if self.mode == DeviceMode::Tap {
            return Ingress::Deliver(frame.into_payload());
        }

        let payload = frame.into_payload();
        let Some(header) = EthernetHeader::decode(&payload) else {
            return Ingress::Drop;
        };
        match header.ether_type {
            ETH_P_ARP => self.handle_arp(&payload[ETHERNET_HEADER_SIZE..]),
            ETH_P_IP4 => {
                let group = header.dst[0] & 0x01 == 0x01;
                if header.dst != self.hw_addr && !group {
                    return Ingress::Drop;
                }
                Ingress::Deliver(payload.slice(ETHERNET_HEADER_SIZE..))
            }
            _ => Ingress::Drop,
        }
    }

    fn handle_arp(&self, data: &[u8]) -> Ingress {
        let Some(arp) = ArpPacket::decode(data) else {
            return Ingress::Drop;
        };
        let own = self.address();
        match arp.operation {
            ArpOperation::Request if own == Some(arp.target_ip) => {
                self.neighbors.add(arp.sender_ip, arp.sender_hw);
                let reply = arp.reply(self.hw_addr);
                Ingress::Reply(Frame::new(reply.to_frame(arp.sender_hw)))
            }
            ArpOperation::Reply if arp.target_hw == self.hw_addr => {
                debug!(ip = %arp.sender_ip, hw = %packet::format_hw_addr(&arp.sender_hw), "Neighbor learned");
                self.neighbors.add(arp.sender_ip, arp.sender_hw);
                Ingress::Consumed
            }
            _ => Ingress::Consumed,
        }
    }
}

/// Owns the local device and moves frames to and from the socket worker
pub struct TapWorker {
    core: Arc<TapCore>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TapWorker {
    /// Spawn the worker.
    ///
    /// Frames read from the device go to `uplink`; frames arriving on
    /// `downlink` are written to the device.
    pub fn start(
        config: TapConfig,
        core: Arc<TapCore>,
        devices: Arc<dyn DeviceFactory>,
        uplink: mpsc::Sender<Frame>,
        downlink: mpsc::Receiver<Frame>,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let worker = TapLoop {
            config,
            core: core.clone(),
            devices,
            uplink,
            events: events.clone(),
            device: None,
            generation: 0,
            reader: None,
            reopen_at: None,
        };
        let task = tokio::spawn(worker.run(events_rx, downlink));
        Self {
            core,
            events,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn core(&self) -> &Arc<TapCore> {
        &self.core
    }

    /// Rebind to a negotiated address (`10.0.0.5/24`); empty clears it
    pub fn on_address_changed(&self, cidr: &str) {
        let _ = self.events.send(WorkerEvent::AddressChanged(cidr.to_string()));
    }

    /// Close and reopen the device
    pub fn reset(&self) {
        let _ = self.events.send(WorkerEvent::DeviceReset);
    }

    pub async fn stop(&self) {
        let _ = self.events.send(WorkerEvent::Stop);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct TapLoop {
    config: TapConfig,
    core: Arc<TapCore>,
    devices: Arc<dyn DeviceFactory>,
    uplink: mpsc::Sender<Frame>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    device: Option<Arc<dyn Device>>,
    /// Bumped on every open and close so errors of a stale reader are ignored
    generation: u64,
    reader: Option<JoinHandle<()>>,
    reopen_at: Option<Instant>,
}

impl TapLoop {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut downlink: mpsc::Receiver<Frame>,
    ) {
        self.open().await;

        let mut neighbor_tick = tokio::time::interval(self.config.neighbor_tick);
        neighbor_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reopen_at = self.reopen_at;
            tokio::select! {
                event = events.recv() => match event {
                    None | Some(WorkerEvent::Stop) => break,
                    Some(event) => self.handle_event(event).await,
                },
                frame = downlink.recv() => match frame {
                    Some(frame) => self.ingress(frame).await,
                    None => break,
                },
                _ = neighbor_tick.tick() => self.refresh_neighbors().await,
                _ = tokio::time::sleep_until(reopen_at.unwrap_or_else(Instant::now)), if reopen_at.is_some() => {
                    self.reopen_at = None;
                    self.open().await;
                }
            }
        }

        self.close_device().await;
        debug!("Tap worker stopped");
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::AddressChanged(cidr) => self.change_address(&cidr).await,
            WorkerEvent::DeviceReset => {
                self.close_device().await;
                self.open().await;
            }
            WorkerEvent::ReadError { generation, reason } => {
                if generation != self.generation {
                    return;
                }
                warn!(generation, "Device read failed: {}", reason);
                self.schedule_reopen().await;
            }
            other => debug!(event = ?other, "Ignoring event"),
        }
    }

    async fn change_address(&mut self, cidr: &str) {
        let address = if cidr.is_empty() {
            None
        } else {
            match cidr.parse::<Ipv4Network>() {
                Ok(network) => Some(network.ip()),
                Err(e) => {
                    warn!(cidr, "Ignoring invalid address: {}", e);
                    return;
                }
            }
        };

        let previous = self.core.address();
        if previous == address {
            return;
        }
        info!(address = cidr, "Device address changed");
        self.core.set_address(address);

        if previous.is_some() && address.is_some() {
            self.close_device().await;
            self.open().await;
        }
    }

    async fn ingress(&mut self, frame: Frame) {
        match self.core.ingress(frame) {
            Ingress::Deliver(data) => {
                let Some(device) = self.device.clone() else {
                    debug!(size = data.len(), "No device, frame dropped");
                    return;
                };
                if let Err(e) = device.write(data).await {
                    warn!(device = %device.name(), "Device write failed: {}", e);
                    self.schedule_reopen().await;
                }
            }
            Ingress::Reply(frame) => {
                let _ = self.uplink.send(frame).await;
            }
            Ingress::Consumed | Ingress::Drop => {}
        }
    }

    async fn refresh_neighbors(&mut self) {
        let sweep = self.core.neighbors().sweep(Instant::now());
        for ip in sweep.to_resolve() {
            if let Some(request) = self.core.resolve(ip) {
                let _ = self.uplink.send(request).await;
            }
        }
    }

    async fn open(&mut self) {
        match self.devices.open().await {
            Ok(device) => {
                info!(device = %device.name(), mtu = device.mtu(), mode = %device.mode(), "Device opened");
                self.generation += 1;
                self.device = Some(device.clone());
                self.spawn_reader(device);
            }
            Err(e) => {
                warn!("Failed to open device: {}", e);
                self.reopen_at = Some(Instant::now() + self.config.reopen_delay);
            }
        }
    }

    async fn schedule_reopen(&mut self) {
        self.close_device().await;
        self.reopen_at = Some(Instant::now() + self.config.reopen_delay);
    }

    async fn close_device(&mut self) {
        self.generation += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(device) = self.device.take() {
            device.close().await;
            debug!(device = %device.name(), "Device closed");
        }
    }

    fn spawn_reader(&mut self, device: Arc<dyn Device>) {
        let generation = self.generation;
        let core = self.core.clone();
        let uplink = self.uplink.clone();
        let events = self.events.clone();

        self.reader = Some(tokio::spawn(async move {
            loop {
                let packet = match device.read().await {
                    Ok(packet) => packet,
                    Err(e) => {
                        let _ = events.send(WorkerEvent::ReadError {
                            generation,
                            reason: e.to_string(),
                        });
                        return;
                    }
                };
                let frame = match core.egress(packet) {
                    Egress::Forward(frame) | Egress::Resolve(frame) => frame,
                    Egress::Drop => continue,
                };
                if uplink.send(frame).await.is_err() {
                    return;
                }
            }
        }));
    }
}
