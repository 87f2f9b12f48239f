//! Connections over real loopback sockets

use lanlink_proto::{
    Action, BlockCrypt, CipherAlgorithm, ControlMessage, Frame, FrameCodec,
};
use lanlink_transport::{
    Acceptor, Connection, Status, TcpAcceptor, TcpConnector, UdpAcceptor, UdpConnector,
};
use std::sync::Arc;
use std::time::Duration;

fn codec() -> FrameCodec {
    let cipher = Arc::new(BlockCrypt::new(CipherAlgorithm::Aes256, "loopback"));
    FrameCodec::new().with_cipher(Some(cipher))
}

fn login() -> Frame {
    Frame::control(&ControlMessage::request(
        Action::Login,
        r#"{"name":"hi","password":"pw"}"#,
    ))
}

#[tokio::test]
async fn test_tcp_connection_exchange() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", codec()).await.unwrap();
    let address = acceptor.local_addr().unwrap().to_string();

    let client = Connection::client(
        Arc::new(TcpConnector::new(address, codec())),
        Duration::from_secs(5),
    );
    let (connected, link) = tokio::join!(client.connect(), acceptor.accept());
    connected.unwrap();
    let server = Connection::accepted(link.unwrap(), Duration::from_secs(5));

    assert_eq!(client.status(), Status::Connected);
    assert_eq!(server.remote_address(), client.local_address());

    client.write_message(login()).await.unwrap();
    let received = server.read_message().await.unwrap();
    assert_eq!(received.to_control().unwrap().action, Action::Login);

    server
        .write_message(Frame::control(&ControlMessage::response(
            Action::Login,
            "okay",
        )))
        .await
        .unwrap();
    let reply = client.read_message().await.unwrap().to_control().unwrap();
    assert_eq!(reply.body_str().unwrap(), "okay");

    client.close().await;
    assert!(server.read_message().await.is_err());
}

#[tokio::test]
async fn test_tcp_read_deadline() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", codec()).await.unwrap();
    let address = acceptor.local_addr().unwrap().to_string();

    let client = Connection::client(
        Arc::new(TcpConnector::new(address, codec())),
        Duration::from_millis(200),
    );
    let (connected, _link) = tokio::join!(client.connect(), acceptor.accept());
    connected.unwrap();

    let result = client.read_message().await;
    assert!(matches!(
        result,
        Err(lanlink_transport::TransportError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_udp_connection_exchange() {
    let acceptor = UdpAcceptor::bind("127.0.0.1:0", codec()).await.unwrap();
    let address = acceptor.local_addr().unwrap().to_string();

    let client = Connection::client(
        Arc::new(UdpConnector::new(address, codec())),
        Duration::from_secs(5),
    );
    client.connect().await.unwrap();
    client.write_message(login()).await.unwrap();

    let server = Connection::accepted(acceptor.accept().await.unwrap(), Duration::from_secs(5));
    assert_eq!(server.remote_address(), client.local_address());
    let received = server.read_message().await.unwrap();
    assert_eq!(received, login());

    let pong = Frame::control(&ControlMessage::response(Action::Pong, "{}"));
    server.write_message(pong.clone()).await.unwrap();
    assert_eq!(client.read_message().await.unwrap(), pong);
}
