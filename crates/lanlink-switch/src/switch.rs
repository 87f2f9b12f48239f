//! Switch server: accept loop and per-connection frame pipeline

use crate::access::Access;
use crate::config::SwitchConfig;
use crate::neighbor::NeighborTable;
use crate::network::NetworkStore;
use crate::registry::{PointRegistry, PointSession};
use crate::request::RequestHandler;
use crate::SwitchResult;
use lanlink_auth::CredentialStore;
use lanlink_proto::{Action, ControlMessage, Frame};
use lanlink_transport::{Acceptor, Connection, DeviceFactory, TransportError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot of switch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub accepted: u64,
    pub refused: u64,
    /// Open connections, authenticated or not
    pub online: usize,
    pub authenticated: usize,
    pub login_success: u64,
    pub login_failed: u64,
}

pub struct Switch {
    config: Arc<SwitchConfig>,
    clients: RwLock<HashMap<String, Arc<Connection>>>,
    points: Arc<PointRegistry>,
    networks: Arc<NetworkStore>,
    neighbors: Arc<NeighborTable>,
    access: Access,
    request: RequestHandler,
    offline: Mutex<Option<mpsc::UnboundedReceiver<Arc<Connection>>>>,
    shutdown: CancellationToken,
    accepted: AtomicU64,
    refused: AtomicU64,
}

impl Switch {
    pub fn new(
        config: SwitchConfig,
        credentials: Arc<CredentialStore>,
        devices: Arc<dyn DeviceFactory>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let (offline_tx, offline_rx) = mpsc::unbounded_channel();
        let points = Arc::new(PointRegistry::new());
        let networks = Arc::new(NetworkStore::from_configs(&config.networks));
        let neighbors = Arc::new(NeighborTable::new());

        let access = Access::new(
            credentials,
            points.clone(),
            devices,
            offline_tx.clone(),
            config.alias.clone(),
        );
        let request = RequestHandler::new(networks.clone(), neighbors.clone(), offline_tx);

        Arc::new(Self {
            config,
            clients: RwLock::new(HashMap::new()),
            points,
            networks,
            neighbors,
            access,
            request,
            offline: Mutex::new(Some(offline_rx)),
            shutdown: CancellationToken::new(),
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    pub fn points(&self) -> &Arc<PointRegistry> {
        &self.points
    }

    pub fn networks(&self) -> &Arc<NetworkStore> {
        &self.networks
    }

    pub fn neighbors(&self) -> &Arc<NeighborTable> {
        &self.neighbors
    }

    pub async fn stats(&self) -> ServerStats {
        let access = self.access.stats();
        ServerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            online: self.clients.read().await.len(),
            authenticated: self.points.len().await,
            login_success: access.success,
            login_failed: access.failed,
        }
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve `acceptor` until shutdown or until it stops yielding links
    pub async fn run(self: Arc<Self>, acceptor: Arc<dyn Acceptor>) -> SwitchResult<()> {
        let offline = self.offline.lock().await.take();
        if let Some(mut offline) = offline {
            let switch = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = switch.shutdown.cancelled() => break,
                        conn = offline.recv() => match conn {
                            Some(conn) => switch.off_client(&conn).await,
                            None => break,
                        },
                    }
                }
            });
        }

        info!(
            listen = %self.config.listen,
            alias = %self.config.alias,
            max_clients = self.config.max_clients,
            "Switch running"
        );

        loop {
            let link = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                link = acceptor.accept() => link,
            };
            let link = match link {
                Ok(link) => link,
                Err(TransportError::Closed) => {
                    info!("Acceptor closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let conn = Arc::new(Connection::accepted(link, self.config.timeout));
            if !self.admit_client(&conn).await {
                continue;
            }
            self.accepted.fetch_add(1, Ordering::Relaxed);
            info!(connection = %conn.remote_address(), "New connection");

            let switch = self.clone();
            tokio::spawn(async move {
                switch.serve(conn).await;
            });
        }

        let clients: Vec<Arc<Connection>> = self.clients.read().await.values().cloned().collect();
        for conn in clients {
            self.off_client(&conn).await;
        }
        info!("Switch stopped");
        Ok(())
    }

    /// Register a new connection unless the switch is full
    async fn admit_client(&self, conn: &Arc<Connection>) -> bool {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.config.max_clients {
            drop(clients);
            self.refused.fetch_add(1, Ordering::Relaxed);
            warn!(
                connection = %conn.remote_address(),
                max_clients = self.config.max_clients,
                "Too many clients, refusing connection"
            );
            conn.close().await;
            return false;
        }
        clients.insert(conn.id().to_string(), conn.clone());
        true
    }

    async fn serve(&self, conn: Arc<Connection>) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = conn.read_message() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(connection = %conn.remote_address(), "Read finished: {}", e);
                    break;
                }
            };

            if frame.is_control() {
                match frame.to_control() {
                    Ok(message) => self.on_control(&conn, message).await,
                    Err(e) => warn!(connection = %conn.remote_address(), "Dropping control frame: {}", e),
                }
            } else {
                self.on_data(&conn, frame).await;
            }
        }
        self.off_client(&conn).await;
    }

    async fn on_control(&self, conn: &Arc<Connection>, message: ControlMessage) {
        if message.action == Action::Login && message.is_request() {
            // failures are answered and logged by the access gate
            let _ = self.access.login(conn, &message).await;
            return;
        }

        let session = match self.access.admit(conn, &message).await {
            Ok(session) => session,
            Err(e) => {
                debug!(
                    connection = %conn.remote_address(),
                    action = %message.action,
                    "Dropping control message: {}", e
                );
                return;
            }
        };
        if let Err(e) = self.request.handle(conn, &session, &message).await {
            warn!(
                connection = %conn.remote_address(),
                action = %message.action,
                "Request failed: {}", e
            );
        }
    }

    async fn on_data(&self, conn: &Connection, frame: Frame) {
        let Some(session) = self.session(conn) else {
            debug!(connection = %conn.remote_address(), "Dropping data from unauthenticated point");
            return;
        };

        self.neighbors
            .learn(frame.payload(), conn.id(), &conn.remote_address())
            .await;
        if let Err(e) = session.device.write(frame.into_payload()).await {
            warn!(device = %session.device.name(), "Failed to write device: {}", e);
        }
    }

    fn session(&self, conn: &Connection) -> Option<Arc<PointSession>> {
        if !conn.is_authenticated() {
            return None;
        }
        conn.private::<PointSession>()
    }

    /// Tear a connection down; safe to call more than once
    pub async fn off_client(&self, conn: &Connection) {
        let client = conn.id();
        self.clients.write().await.remove(client);

        if let Some(session) = self.points.remove(client).await {
            let released = self.networks.release(client).await;
            session.device.close().await;
            let forgotten = self.neighbors.remove_client(client).await;
            info!(
                user = %session.user,
                alias = %session.alias,
                uuid = %session.uuid,
                leases = released.len(),
                neighbors = forgotten,
                "Point offline"
            );
        }
        conn.close().await;
    }
}
