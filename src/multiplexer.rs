//! The single owner of the UDP socket, described in `spec.md` §4.4 and §5:
//! one receive task routes inbound datagrams to the right
//! [`Connection`](crate::Connection), one send task is the only writer of
//! the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{ConnectionDetails, ConnectionOptions, MultiplexerOptions};
use crate::connection::Connection;
use crate::events::{ConnectionEvent, MultiplexerEvent};
use crate::id::ConnectionId;
use crate::packet::Packet;
use crate::socket::{OutboundDatagram, SocketHandle};
use crate::Error;

/// Maximum size of a single BattlEye UDP datagram this crate will attempt to
/// decode. Well above any legitimate multipart fragment.
const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Owns the local UDP socket and the table of registered connections.
///
/// A [`Multiplexer`] is constructed with [`Multiplexer::bind`], which spawns
/// its receive and send background tasks immediately. Connections are
/// registered with [`Multiplexer::connection`]; each gets its own
/// [`SocketHandle`] capability rather than a reference back to the
/// multiplexer (see `spec.md` §9).
pub struct Multiplexer {
    local_addr: SocketAddr,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    outbound: mpsc::UnboundedSender<OutboundDatagram>,
    events: mpsc::UnboundedSender<MultiplexerEvent>,
}

impl Multiplexer {
    /// Bind the local UDP socket and start the background receive/send
    /// tasks.
    pub async fn bind(
        options: MultiplexerOptions,
    ) -> Result<(Arc<Multiplexer>, mpsc::UnboundedReceiver<MultiplexerEvent>), std::io::Error>
    {
        let socket = UdpSocket::bind((options.ip, options.port)).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let multiplexer = Arc::new(Multiplexer {
            local_addr,
            connections: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            events: events_tx,
        });

        multiplexer.spawn_receive_task(Arc::clone(&socket));
        multiplexer.spawn_send_task(socket, outbound_rx);

        info!(%local_addr, "multiplexer listening");
        multiplexer.emit(MultiplexerEvent::Listening { local_addr });

        Ok((multiplexer, events_rx))
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn emit(&self, event: MultiplexerEvent) {
        let _ = self.events.send(event);
    }

    /// Register a new connection to `details`, authenticating with
    /// `password`. Fails with [`Error::ConnectionExists`] if a connection to
    /// the same remote endpoint is already registered.
    ///
    /// If `auto_connect` is set, [`Connection::connect`] is kicked off on a
    /// background task immediately — the socket is always listening by the
    /// time a [`Multiplexer`] exists to register connections against, so
    /// there is no "wait for listening" case to handle (unlike the source
    /// protocol, where socket binding and connection registration can race).
    pub fn connection(
        self: &Arc<Self>,
        details: ConnectionDetails,
        password: impl Into<String>,
        options: ConnectionOptions,
        auto_connect: bool,
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<ConnectionEvent>), Error> {
        let id = ConnectionId::new(details.ip, details.port);

        let mut connections = self.connections.lock().unwrap();
        if connections.contains_key(&id) {
            return Err(Error::ConnectionExists);
        }

        let target = SocketAddr::new(details.ip, details.port);
        let handle = SocketHandle::new(id, target, self.outbound.clone());
        let (connection, events) = Connection::new(details, password, options, handle);

        connections.insert(id, Arc::clone(&connection));

        if auto_connect {
            let this = Arc::clone(&connection);
            tokio::spawn(async move {
                if let Err(error) = this.connect().await {
                    warn!(?error, "auto-connect failed");
                }
            });
        }

        Ok((connection, events))
    }

    /// Look up a registered connection by id.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(&id).cloned()
    }

    /// Remove a connection from the routing table without affecting its
    /// session state. Typically called after the caller observes a terminal
    /// [`ConnectionEvent::Disconnected`] it does not want retried.
    pub fn remove(&self, id: ConnectionId) {
        self.connections.lock().unwrap().remove(&id);
    }

    fn spawn_send_task(
        self: &Arc<Self>,
        socket: Arc<UdpSocket>,
        mut outbound_rx: mpsc::UnboundedReceiver<OutboundDatagram>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(datagram) = outbound_rx.recv().await {
                match socket.send_to(&datagram.bytes, datagram.target).await {
                    Ok(bytes) => {
                        this.emit(MultiplexerEvent::Sent {
                            packet: datagram.packet,
                            buffer: datagram.bytes,
                            bytes,
                            connection: datagram.connection,
                        });
                    }
                    Err(err) => {
                        let error = Error::PacketError(err.to_string());
                        warn!(%error, "failed to write datagram to socket");
                        this.emit(MultiplexerEvent::Error {
                            error: error.clone(),
                        });
                        this.kill(error);
                    }
                }
            }
        });
    }

    fn spawn_receive_task(self: &Arc<Self>, socket: Arc<UdpSocket>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                let (len, remote) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        let error = Error::PacketError(err.to_string());
                        warn!(%error, "failed to read from socket");
                        this.emit(MultiplexerEvent::Error {
                            error: error.clone(),
                        });
                        this.kill(error);
                        break;
                    }
                };

                this.handle_datagram(&buf[..len], remote);
            }
        });
    }

    fn handle_datagram(&self, buf: &[u8], remote: SocketAddr) {
        let packet = match Packet::from_buffer(buf) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%error, %remote, "failed to decode inbound datagram");
                let id = ConnectionId::new(remote.ip(), remote.port());
                if let Some(connection) = self.connections.lock().unwrap().get(&id).cloned() {
                    connection.report_error(error.clone());
                }
                self.emit(MultiplexerEvent::Error { error });
                return;
            }
        };

        let id = ConnectionId::new(remote.ip(), remote.port());
        let connection = self.connections.lock().unwrap().get(&id).cloned();

        match connection {
            Some(connection) => {
                self.emit(MultiplexerEvent::Received {
                    resolved: true,
                    packet: packet.clone(),
                    buffer: buf.to_vec(),
                    connection: id,
                    remote,
                });
                connection.receive(packet);
            }
            None => {
                let error = Error::UnknownConnection(id, remote.ip(), remote.port());
                warn!(%error, "datagram from unregistered remote");
                self.emit(MultiplexerEvent::Received {
                    resolved: false,
                    packet,
                    buffer: buf.to_vec(),
                    connection: id,
                    remote,
                });
                self.emit(MultiplexerEvent::Error { error });
            }
        }
    }

    /// Tear down every registered connection with `error` (the socket is
    /// gone; nothing further can be sent or received).
    fn kill(&self, error: Error) {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().unwrap().values().cloned().collect();
        for connection in connections {
            connection.kill(error.clone());
        }
    }
}
