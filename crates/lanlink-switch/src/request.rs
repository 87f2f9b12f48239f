//! Control requests from authenticated points

use crate::neighbor::NeighborTable;
use crate::network::NetworkStore;
use crate::registry::PointSession;
use crate::{OfflineSender, SwitchResult};
use lanlink_proto::control::NO_FREE_ADDRESS;
use lanlink_proto::{Action, ControlMessage, NetworkDescriptor};
use lanlink_transport::Connection;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RequestHandler {
    networks: Arc<NetworkStore>,
    neighbors: Arc<NeighborTable>,
    offline: OfflineSender,
}

impl RequestHandler {
    pub fn new(
        networks: Arc<NetworkStore>,
        neighbors: Arc<NeighborTable>,
        offline: OfflineSender,
    ) -> Self {
        Self {
            networks,
            neighbors,
            offline,
        }
    }

    pub async fn handle(
        &self,
        conn: &Arc<Connection>,
        session: &PointSession,
        message: &ControlMessage,
    ) -> SwitchResult<()> {
        if message.is_response() {
            debug!(action = %message.action, "Ignoring response from point");
            return Ok(());
        }

        match message.action {
            Action::Neighbor => {
                let neighbors = self.neighbors.list().await;
                reply(conn, ControlMessage::response_json(Action::Neighbor, &neighbors)?).await
            }
            Action::IpAddr => self.handle_ip_addr(conn, session, message).await,
            Action::Leave => {
                info!(alias = %session.alias, uuid = %session.uuid, "Point leaving");
                let _ = self.offline.send(conn.clone());
                Ok(())
            }
            Action::Login => Ok(()),
            _ => reply(conn, ControlMessage::response(Action::Pong, message.body.clone())).await,
        }
    }

    /// Confirm the address a point reports, or lease it one
    async fn handle_ip_addr(
        &self,
        conn: &Arc<Connection>,
        session: &PointSession,
        message: &ControlMessage,
    ) -> SwitchResult<()> {
        let request: NetworkDescriptor = message.parse_json()?;
        let network = if request.name.is_empty() {
            session.network.clone()
        } else {
            request.name.clone()
        };

        let lease = match request.address() {
            Some(address) => Some(
                self.networks
                    .record(&network, &session.uuid, &session.alias, session.client(), address)
                    .await,
            ),
            None => {
                self.networks
                    .acquire(&network, &session.uuid, &session.alias, session.client())
                    .await
            }
        };
        let descriptor = match lease {
            Some(lease) => self.networks.descriptor(&network, lease.address).await,
            None => None,
        };

        match descriptor {
            Some(descriptor) => {
                debug!(
                    network = %network,
                    uuid = %session.uuid,
                    address = %descriptor.if_addr,
                    "Address confirmed"
                );
                reply(conn, ControlMessage::response_json(Action::IpAddr, &descriptor)?).await
            }
            None => {
                warn!(network = %network, uuid = %session.uuid, "No address for point");
                reply(conn, ControlMessage::response(Action::IpAddr, NO_FREE_ADDRESS)).await
            }
        }
    }
}

async fn reply(conn: &Connection, message: ControlMessage) -> SwitchResult<()> {
    conn.write_message(message.into_frame()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, SubnetConfig};
    use chrono::Utc;
    use lanlink_auth::Role;
    use lanlink_proto::FrameCodec;
    use lanlink_transport::{
        Acceptor, Connector, DeviceFactory, DeviceMode, MemoryConnector, VirtualDeviceFactory,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        handler: RequestHandler,
        session: PointSession,
        server: Arc<Connection>,
        point: Connection,
        offline: mpsc::UnboundedReceiver<Arc<Connection>>,
    }

    async fn fixture(start: &str, end: &str) -> Fixture {
        let network = NetworkConfig {
            name: "default".to_string(),
            address: "10.0.0.1/24".to_string(),
            subnet: SubnetConfig {
                start: start.to_string(),
                end: end.to_string(),
                netmask: "255.255.255.0".to_string(),
            },
            ..Default::default()
        };
        let (tx, offline) = mpsc::unbounded_channel();
        let handler = RequestHandler::new(
            Arc::new(NetworkStore::from_configs(&[network])),
            Arc::new(NeighborTable::new()),
            tx,
        );

        let (connector, acceptor) = MemoryConnector::pair("switch:10002", FrameCodec::new());
        let connector: Arc<dyn Connector> = Arc::new(connector);
        let point = Connection::client(connector, Duration::from_secs(5));
        point.connect().await.unwrap();
        let server = Arc::new(Connection::accepted(
            acceptor.accept().await.unwrap(),
            Duration::from_secs(5),
        ));

        let (devices, _handles) = VirtualDeviceFactory::new("sw", 1500, DeviceMode::Tap);
        let session = PointSession {
            uuid: "u-1".to_string(),
            alias: "alpha".to_string(),
            network: "default".to_string(),
            user: "hi@default".to_string(),
            role: Role::Member,
            system: "linux".to_string(),
            connection: server.clone(),
            device: devices.open().await.unwrap(),
            connected_at: Utc::now(),
        };

        Fixture {
            handler,
            session,
            server,
            point,
            offline,
        }
    }

    async fn answer(f: &Fixture, request: ControlMessage) -> ControlMessage {
        f.handler.handle(&f.server, &f.session, &request).await.unwrap();
        f.point.read_message().await.unwrap().to_control().unwrap()
    }

    #[tokio::test]
    async fn test_ip_addr_leases_from_pool() {
        let f = fixture("10.0.0.5", "10.0.0.20").await;
        let request = ControlMessage::request_json(
            Action::IpAddr,
            &NetworkDescriptor {
                name: "default".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

        let response = answer(&f, request).await;
        assert!(response.is_response());
        let descriptor: NetworkDescriptor = response.parse_json().unwrap();
        assert_eq!(descriptor.cidr().as_deref(), Some("10.0.0.5/24"));
    }

    #[tokio::test]
    async fn test_ip_addr_confirms_reported_address() {
        let f = fixture("10.0.0.5", "10.0.0.20").await;
        let request = ControlMessage::request_json(
            Action::IpAddr,
            &NetworkDescriptor::new("default", "10.0.0.9/24"),
        )
        .unwrap();

        let descriptor: NetworkDescriptor = answer(&f, request).await.parse_json().unwrap();
        assert_eq!(descriptor.if_addr, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_ip_addr_exhausted_pool() {
        let f = fixture("10.0.0.1", "10.0.0.1").await;
        let request = ControlMessage::request_json(Action::IpAddr, &NetworkDescriptor::default())
            .unwrap();

        let response = answer(&f, request).await;
        assert_eq!(response.body_str().unwrap(), NO_FREE_ADDRESS);
    }

    #[tokio::test]
    async fn test_ping_gets_pong_with_same_body() {
        let f = fixture("10.0.0.5", "10.0.0.20").await;
        let response = answer(&f, ControlMessage::request(Action::Ping, "hello")).await;
        assert_eq!(response.action, Action::Pong);
        assert_eq!(response.body_str().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_neighbor_list_is_json() {
        let f = fixture("10.0.0.5", "10.0.0.20").await;
        let response = answer(&f, ControlMessage::request(Action::Neighbor, "")).await;
        let list: Vec<lanlink_proto::NeighborEntry> = response.parse_json().unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_leave_queues_connection() {
        let mut f = fixture("10.0.0.5", "10.0.0.20").await;
        f.handler
            .handle(&f.server, &f.session, &ControlMessage::request(Action::Leave, "{}"))
            .await
            .unwrap();
        let queued = f.offline.recv().await.unwrap();
        assert_eq!(queued.id(), f.server.id());
    }
}
