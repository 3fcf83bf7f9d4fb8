//! End-to-end tests driving a real [`Multiplexer`]/[`Connection`] pair
//! against a minimal hand-rolled BattlEye server on loopback UDP.
//!
//! Unlike the unit tests beside the codec, these exercise the full async
//! stack: socket binding, the multiplexer's receive/send tasks, and the
//! connection's login/command/message state machine, the way they would
//! actually run against a game server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use battleye_rcon::{ConnectionDetails, ConnectionOptions, Error, Multiplexer, MultiplexerOptions};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wrap(payload: &[u8]) -> Vec<u8> {
    let crc = crc32fast::hash(payload);
    let mut buf = vec![b'B', b'E'];
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn login_reply(accepted: bool) -> Vec<u8> {
    wrap(&[0xFF, 0x00, if accepted { 1 } else { 0 }])
}

fn command_reply(sequence: u8, data: &str) -> Vec<u8> {
    let mut payload = vec![0xFFu8, 0x01, sequence];
    payload.extend_from_slice(data.as_bytes());
    wrap(&payload)
}

fn command_fragment(sequence: u8, total: u8, index: u8, part: &[u8]) -> Vec<u8> {
    let mut payload = vec![0xFFu8, 0x01, sequence, 0x00, total, index];
    payload.extend_from_slice(part);
    wrap(&payload)
}

fn message_indication(sequence: u8, text: &str) -> Vec<u8> {
    let mut payload = vec![0xFFu8, 0x02, sequence];
    payload.extend_from_slice(text.as_bytes());
    wrap(&payload)
}

/// A throwaway loopback socket standing in for a BattlEye game server,
/// giving the test full control over what gets sent back and when.
struct FakeServer {
    socket: UdpSocket,
    client: SocketAddr,
}

impl FakeServer {
    async fn bind() -> (Self, SocketAddr) {
        let socket = UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        (
            Self {
                socket,
                client: "0.0.0.0:0".parse().unwrap(),
            },
            addr,
        )
    }

    /// Wait for the next datagram, recording the sender so replies can be
    /// routed back.
    async fn recv(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let (len, from) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for client datagram")
            .unwrap();
        self.client = from;
        buf.truncate(len);
        buf
    }

    async fn send(&self, bytes: &[u8]) {
        self.socket.send_to(bytes, self.client).await.unwrap();
    }
}

async fn connect_pair(
) -> (std::sync::Arc<battleye_rcon::Multiplexer>, FakeServer, std::sync::Arc<battleye_rcon::Connection>)
{
    init_tracing();

    let (mux, mut mux_events) = Multiplexer::bind(MultiplexerOptions {
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
    })
    .await
    .unwrap();
    tokio::spawn(async move { while mux_events.recv().await.is_some() {} });

    let (server, server_addr) = FakeServer::bind().await;

    let details = ConnectionDetails::new(server_addr.ip(), server_addr.port());
    let options = ConnectionOptions {
        keep_alive: false,
        timeout: false,
        ..ConnectionOptions::default()
    };
    let (connection, mut events) = mux.connection(details, "letmein", options, false).unwrap();
    tokio::spawn(async move { while events.recv().await.is_some() {} });

    (mux, server, connection)
}

#[tokio::test]
async fn test_login_success() {
    let (_mux, mut server, connection) = connect_pair().await;

    let login = tokio::spawn(async move { connection.connect().await });

    let request = server.recv().await;
    assert_eq!(&request[0..2], b"BE");
    server.send(&login_reply(true)).await;

    assert!(login.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_login_rejected() {
    let (_mux, mut server, connection) = connect_pair().await;

    let login = tokio::spawn(async move {
        let result = connection.connect().await;
        (connection, result)
    });

    server.recv().await;
    server.send(&login_reply(false)).await;

    let (connection, result) = login.await.unwrap();
    assert_eq!(result.unwrap_err(), Error::InvalidPassword);
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_command_round_trip() {
    let (_mux, mut server, connection) = connect_pair().await;

    let conn = Arc::clone(&connection);
    let login = tokio::spawn(async move { conn.connect().await });
    server.recv().await;
    server.send(&login_reply(true)).await;
    login.await.unwrap().unwrap();

    let conn = Arc::clone(&connection);
    let command = tokio::spawn(async move { conn.command("players").await });

    let request = server.recv().await;
    // BE header (6) + 0xFF + type(1) + seq(0) + "players"
    assert_eq!(&request[6..9], &[0xFF, 1, 0]);
    server.send(&command_reply(0, "1 players online: admin")).await;

    let response = command.await.unwrap().unwrap();
    assert_eq!(response.data.as_deref(), Some("1 players online: admin"));
    assert_eq!(response.command.as_deref(), Some("players"));
}

#[tokio::test]
async fn test_unknown_command() {
    let (_mux, mut server, connection) = connect_pair().await;

    let conn = Arc::clone(&connection);
    let login = tokio::spawn(async move { conn.connect().await });
    server.recv().await;
    server.send(&login_reply(true)).await;
    login.await.unwrap().unwrap();

    let conn = Arc::clone(&connection);
    let command = tokio::spawn(async move { conn.command("frobnicate").await });

    server.recv().await;
    server.send(&command_reply(0, "Unknown command")).await;

    let err = command.await.unwrap().unwrap_err();
    assert_eq!(err, Error::UnknownCommand("frobnicate".to_string()));
}

#[tokio::test]
async fn test_multipart_reassembly() {
    let (_mux, mut server, connection) = connect_pair().await;

    let conn = Arc::clone(&connection);
    let login = tokio::spawn(async move { conn.connect().await });
    server.recv().await;
    server.send(&login_reply(true)).await;
    login.await.unwrap().unwrap();

    let conn = Arc::clone(&connection);
    let command = tokio::spawn(async move { conn.command("admins").await });
    server.recv().await;

    // Out-of-order fragment delivery: reassembly must not depend on arrival
    // order.
    server
        .send(&command_fragment(0, 3, 2, b"gamma"))
        .await;
    server
        .send(&command_fragment(0, 3, 0, b"alpha "))
        .await;
    server
        .send(&command_fragment(0, 3, 1, b"beta "))
        .await;

    let response = command.await.unwrap().unwrap();
    assert_eq!(response.data.as_deref(), Some("alpha beta gamma"));
}

#[tokio::test]
async fn test_message_indication_is_acked() {
    let (_mux, mut server, connection) = connect_pair().await;

    let conn = Arc::clone(&connection);
    let login = tokio::spawn(async move { conn.connect().await });
    server.recv().await;
    server.send(&login_reply(true)).await;
    login.await.unwrap().unwrap();

    server
        .send(&message_indication(9, "Player Foo connected"))
        .await;

    let ack = server.recv().await;
    assert_eq!(&ack[6..], &[0xFF, 0x02, 0x09]);
}

#[tokio::test]
async fn test_auto_connect_logs_in_without_an_explicit_connect_call() {
    init_tracing();

    let (mux, mut mux_events) = Multiplexer::bind(MultiplexerOptions {
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
    })
    .await
    .unwrap();
    tokio::spawn(async move { while mux_events.recv().await.is_some() {} });

    let (mut server, server_addr) = FakeServer::bind().await;
    let details = ConnectionDetails::new(server_addr.ip(), server_addr.port());
    let options = ConnectionOptions {
        keep_alive: false,
        timeout: false,
        ..ConnectionOptions::default()
    };
    let (connection, mut events) = mux.connection(details, "letmein", options, true).unwrap();
    tokio::spawn(async move { while events.recv().await.is_some() {} });

    let request = server.recv().await;
    assert_eq!(&request[0..2], b"BE");
    server.send(&login_reply(true)).await;

    timeout(Duration::from_secs(2), async {
        while !connection.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("auto-connect never logged in");
}

#[tokio::test]
async fn test_connecting_twice_tears_down_first_session() {
    let (_mux, mut server, connection) = connect_pair().await;

    let conn = Arc::clone(&connection);
    let first = tokio::spawn(async move { conn.connect().await });
    server.recv().await;
    server.send(&login_reply(true)).await;
    first.await.unwrap().unwrap();
    assert!(connection.is_connected());

    let conn = Arc::clone(&connection);
    let second = tokio::spawn(async move { conn.connect().await });
    server.recv().await;
    server.send(&login_reply(true)).await;
    second.await.unwrap().unwrap();
    assert!(connection.is_connected());
}
