use lanlink_auth::{Credential, CredentialStore, Role};
use lanlink_proto::control::LOGIN_OKAY;
use lanlink_proto::packet::{ArpPacket, BROADCAST_HW};
use lanlink_proto::{
    Action, ControlMessage, Frame, FrameCodec, LoginRequest, NeighborEntry, NetworkDescriptor,
    SignInMessage,
};
use lanlink_switch::{NetworkConfig, SubnetConfig, Switch, SwitchConfig};
use lanlink_transport::{
    Connection, Connector, DeviceMode, MemoryConnector, VirtualDeviceFactory,
    VirtualDeviceHandle,
};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    switch: Arc<Switch>,
    connector: Arc<dyn Connector>,
    handles: mpsc::UnboundedReceiver<VirtualDeviceHandle>,
}

async fn start(max_clients: usize) -> Harness {
    let network = NetworkConfig {
        name: "default".to_string(),
        address: "10.0.0.1/24".to_string(),
        subnet: SubnetConfig {
            start: "10.0.0.5".to_string(),
            end: "10.0.0.20".to_string(),
            netmask: "255.255.255.0".to_string(),
        },
        ..Default::default()
    };
    let config = SwitchConfig::builder()
        .alias("sw1")
        .max_clients(max_clients)
        .network(network)
        .build()
        .unwrap();

    let credentials = CredentialStore::new();
    credentials
        .add(Credential::new("hi", "default", "secret", Role::Member))
        .await;
    let (devices, handles) = VirtualDeviceFactory::new("sw", 1500, DeviceMode::Tap);
    let (connector, acceptor) = MemoryConnector::pair("switch:10002", FrameCodec::new());

    let switch = Switch::new(config, Arc::new(credentials), Arc::new(devices));
    tokio::spawn(switch.clone().run(Arc::new(acceptor)));

    Harness {
        switch,
        connector: Arc::new(connector),
        handles,
    }
}

async fn dial(h: &Harness) -> Connection {
    let conn = Connection::client(h.connector.clone(), Duration::from_secs(5));
    conn.connect().await.unwrap();
    conn
}

async fn request(conn: &Connection, message: ControlMessage) -> ControlMessage {
    conn.write_message(message.into_frame()).await.unwrap();
    loop {
        let frame = conn.read_message().await.unwrap();
        if frame.is_control() {
            return frame.to_control().unwrap();
        }
    }
}

async fn login(conn: &Connection, uuid: &str) -> String {
    let message = ControlMessage::request_json(
        Action::Login,
        &LoginRequest {
            name: "hi".to_string(),
            password: "secret".to_string(),
            uuid: uuid.to_string(),
            alias: uuid.to_string(),
            ..Default::default()
        },
    )
    .unwrap();
    let response = request(conn, message).await;
    assert_eq!(response.action, Action::Login);
    response.body_str().unwrap().to_string()
}

async fn lease(conn: &Connection) -> NetworkDescriptor {
    let message = ControlMessage::request_json(
        Action::IpAddr,
        &NetworkDescriptor {
            name: "default".to_string(),
            ..Default::default()
        },
    )
    .unwrap();
    request(conn, message).await.parse_json().unwrap()
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_second_login_with_same_uuid_replaces_first() {
    let mut h = start(16).await;

    let first = dial(&h).await;
    assert_eq!(login(&first, "u-1").await, LOGIN_OKAY);
    let first_device = h.handles.recv().await.unwrap();

    let second = dial(&h).await;
    assert_eq!(login(&second, "u-1").await, LOGIN_OKAY);

    // the first session is torn down: its device closed, its link dropped
    let device = &first_device;
    wait_until(|| async move { device.is_closed() }).await;
    assert!(first.read_message().await.is_err());

    let switch = h.switch.clone();
    wait_until(|| {
        let switch = switch.clone();
        async move { switch.points().len().await == 1 }
    })
    .await;
    assert_eq!(h.switch.points().by_uuid("u-1").await.len(), 1);
    assert_eq!(lease(&second).await.if_addr, "10.0.0.5");
    assert_eq!(h.switch.stats().await.login_success, 2);
}

#[tokio::test]
async fn test_lease_follows_identity_until_disconnect() {
    let h = start(16).await;

    let conn = dial(&h).await;
    login(&conn, "u-1").await;
    let descriptor = lease(&conn).await;
    assert_eq!(descriptor.cidr().as_deref(), Some("10.0.0.5/24"));
    assert_eq!(descriptor.ip_start, "10.0.0.5");
    assert_eq!(lease(&conn).await.if_addr, "10.0.0.5");

    let other = dial(&h).await;
    login(&other, "u-2").await;
    assert_eq!(lease(&other).await.if_addr, "10.0.0.6");

    conn.close().await;
    let switch = h.switch.clone();
    wait_until(|| {
        let switch = switch.clone();
        async move { switch.points().len().await == 1 }
    })
    .await;

    let third = dial(&h).await;
    login(&third, "u-3").await;
    assert_eq!(lease(&third).await.if_addr, "10.0.0.5");
}

#[tokio::test]
async fn test_frames_bridged_and_neighbors_learned() {
    let mut h = start(16).await;

    let conn = dial(&h).await;
    login(&conn, "u-1").await;
    let mut device = h.handles.recv().await.unwrap();

    let arp = ArpPacket::request(
        [0x02, 0, 0, 0, 0, 0x05],
        Ipv4Addr::new(10, 0, 0, 5),
        Ipv4Addr::new(10, 0, 0, 1),
    );
    let frame = arp.to_frame(BROADCAST_HW);
    conn.write_message(Frame::new(frame.clone())).await.unwrap();
    assert_eq!(device.recv().await.unwrap(), frame);

    let response = request(&conn, ControlMessage::request(Action::Neighbor, "")).await;
    let neighbors: Vec<NeighborEntry> = response.parse_json().unwrap();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].ip_addr, "10.0.0.5");

    device.inject(vec![0xabu8; 60]).await.unwrap();
    let from_host = conn.read_message().await.unwrap();
    assert!(!from_host.is_control());
    assert_eq!(from_host.payload().as_ref(), &[0xabu8; 60][..]);
}

#[tokio::test]
async fn test_unauthenticated_ping_asks_for_sign_in() {
    let h = start(16).await;

    let conn = dial(&h).await;
    let prompt = request(&conn, ControlMessage::request(Action::Ping, "{}")).await;
    assert_eq!(prompt.action, Action::SignIn);
    let sign_in: SignInMessage = prompt.parse_json().unwrap();
    assert_eq!(sign_in.switch, "sw1");

    // data from an unauthenticated point goes nowhere
    conn.write_message(Frame::new(vec![0u8; 60])).await.unwrap();
    assert_eq!(login(&conn, "u-1").await, LOGIN_OKAY);
}

#[tokio::test]
async fn test_max_clients_refuses_extra_connection() {
    let h = start(1).await;

    let first = dial(&h).await;
    assert_eq!(login(&first, "u-1").await, LOGIN_OKAY);

    let second = dial(&h).await;
    assert!(second.read_message().await.is_err());

    let stats = h.switch.stats().await;
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.refused, 1);
    assert_eq!(stats.online, 1);
    assert_eq!(lease(&first).await.if_addr, "10.0.0.5");
}

#[tokio::test]
async fn test_leave_takes_point_offline() {
    let h = start(16).await;

    let conn = dial(&h).await;
    login(&conn, "u-1").await;
    lease(&conn).await;
    conn.write_message(ControlMessage::request(Action::Leave, "{}").into_frame())
        .await
        .unwrap();

    let switch = h.switch.clone();
    wait_until(|| {
        let switch = switch.clone();
        async move { switch.stats().await.online == 0 }
    })
    .await;
    assert!(h.switch.networks().leases().await.is_empty());
}
