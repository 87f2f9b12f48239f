//! A running point: socket worker, tap worker and the glue between them

use crate::config::PointConfig;
use crate::routes::{NextHop, RouteTable};
use crate::socket::{SocketListener, SocketWorker};
use crate::tap::{TapConfig, TapCore, TapWorker};
use crate::FRAME_QUEUE;
use lanlink_proto::{NetworkDescriptor, RouteEntry};
use lanlink_transport::{Connection, Connector, DeviceFactory, Status};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Hooks for reprogramming the host when the overlay address or routes
/// change. The point itself never touches the OS.
pub trait PointListener: Send + Sync {
    fn add_addr(&self, _cidr: &str) {}
    fn del_addr(&self, _cidr: &str) {}
    fn add_routes(&self, _routes: &[RouteEntry]) {}
    fn del_routes(&self, _routes: &[RouteEntry]) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl PointListener for NoopListener {}

pub struct Point {
    config: Arc<PointConfig>,
    socket: SocketWorker,
    tap: Arc<TapWorker>,
    hooks: Arc<PointHooks>,
}

impl Point {
    /// Start both workers and begin dialing the switch
    pub fn start(
        config: PointConfig,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn DeviceFactory>,
        listener: Arc<dyn PointListener>,
    ) -> Self {
        let config = Arc::new(config);
        let (uplink, uplink_rx) = mpsc::channel(FRAME_QUEUE);
        let (downlink, downlink_rx) = mpsc::channel(FRAME_QUEUE);

        let routes = Arc::new(RouteTable::new());
        let tap_config = TapConfig::default();
        let core = Arc::new(TapCore::new(
            config.interface.mode,
            &tap_config,
            Some(routes.clone() as Arc<dyn NextHop>),
        ));
        let tap = Arc::new(TapWorker::start(tap_config, core, devices, uplink, downlink_rx));

        let hooks = Arc::new(PointHooks {
            static_address: config.interface.address.clone(),
            listener,
            tap: tap.clone(),
            routes,
            applied: Mutex::new(Applied::default()),
        });

        let connection = Arc::new(Connection::client(connector, config.timeout));
        let socket = SocketWorker::start(
            config.clone(),
            connection,
            hooks.clone(),
            uplink_rx,
            downlink,
        );

        info!(
            user = %config.id(),
            alias = %config.alias,
            mode = %config.interface.mode,
            "Point started"
        );
        Self {
            config,
            socket,
            tap,
            hooks,
        }
    }

    pub fn config(&self) -> &PointConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.socket.status()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        self.socket.connection()
    }

    /// Address currently applied to the device, in CIDR notation
    pub fn address(&self) -> Option<String> {
        self.hooks.applied().address.clone()
    }

    pub fn tap(&self) -> &TapWorker {
        &self.tap
    }

    pub async fn stop(&self) {
        self.socket.stop().await;
        self.tap.stop().await;
        self.hooks.release();
        info!(user = %self.config.id(), "Point stopped");
    }
}

#[derive(Debug, Default)]
struct Applied {
    address: Option<String>,
    routes: Vec<RouteEntry>,
}

/// Reacts to socket worker callbacks on behalf of the device and the host
struct PointHooks {
    static_address: String,
    listener: Arc<dyn PointListener>,
    tap: Arc<TapWorker>,
    routes: Arc<RouteTable>,
    applied: Mutex<Applied>,
}

impl PointHooks {
    fn applied(&self) -> MutexGuard<'_, Applied> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_address(&self, cidr: &str) {
        let previous = {
            let mut applied = self.applied();
            if applied.address.as_deref() == Some(cidr) {
                return;
            }
            applied.address.replace(cidr.to_string())
        };
        if let Some(previous) = previous {
            self.listener.del_addr(&previous);
        }
        info!(address = cidr, "Applying address");
        self.listener.add_addr(cidr);
        self.tap.on_address_changed(cidr);
    }

    fn set_routes(&self, network: &NetworkDescriptor) {
        self.routes.replace(network);
        let previous = std::mem::replace(&mut self.applied().routes, network.routes.clone());
        if previous == network.routes {
            return;
        }
        if !previous.is_empty() {
            self.listener.del_routes(&previous);
        }
        if !network.routes.is_empty() {
            debug!(count = network.routes.len(), "Applying routes");
            self.listener.add_routes(&network.routes);
        }
    }

    /// Undo everything applied to the host
    fn release(&self) {
        let applied = std::mem::take(&mut *self.applied());
        if !applied.routes.is_empty() {
            self.listener.del_routes(&applied.routes);
        }
        if let Some(address) = applied.address {
            self.listener.del_addr(&address);
        }
        self.routes.clear();
    }
}

impl SocketListener for PointHooks {
    fn on_success(&self) {
        if !self.static_address.is_empty() {
            self.set_address(&self.static_address);
        }
    }

    fn on_close(&self) {
        // dynamic addresses are re-negotiated after the next login
        let applied = self.applied().address.clone();
        if self.static_address.is_empty() && applied.is_some() {
            self.release();
        }
    }

    fn on_ip_addr(&self, network: &NetworkDescriptor) {
        if let Some(cidr) = network.cidr() {
            self.set_address(&cidr);
        }
        self.set_routes(network);
    }
}
