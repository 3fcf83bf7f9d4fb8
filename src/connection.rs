//! The per-remote-endpoint session state machine described in `spec.md`
//! §4.3: login, sequence allocation, the pending-request table, multipart
//! reassembly, keep-alive, timeout, and reconnection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{ConnectionDetails, ConnectionOptions};
use crate::events::ConnectionEvent;
use crate::id::ConnectionId;
use crate::packet::Packet;
use crate::request::{OutboundPacket, PendingRequest, Response};
use crate::socket::SocketHandle;
use crate::Error;

const UNKNOWN_COMMAND_TEXT: &str = "Unknown command";

/// A session with one remote BattlEye RCon endpoint.
///
/// A `Connection` is always held behind an [`Arc`] (as returned by
/// [`Connection::new`]) since its keep-alive and timeout schedulers, and a
/// `ServerTimeout`-triggered reconnect, run as background tasks that
/// outlive any single call into it.
pub struct Connection {
    id: ConnectionId,
    details: ConnectionDetails,
    password: String,
    options: ConnectionOptions,
    socket: SocketHandle,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    weak_self: Weak<Connection>,
    state: Mutex<State>,
}

struct State {
    connected: bool,
    sequence_counter: u8,
    last_packet_at: Instant,
    login_pending: Option<PendingRequest>,
    pending: Box<[Option<PendingRequest>; 256]>,
    reassembly: Box<[Option<Reassembly>; 256]>,
    /// Bumped on every connect/disconnect cycle; scheduler ticks carrying a
    /// stale generation are dropped. See `spec.md` §9, "Timer lifecycle".
    generation: u64,
}

impl State {
    fn new() -> Self {
        Self {
            connected: false,
            // Wraps to 0 on the first call; see `test_sequence_wrap`.
            sequence_counter: 0xFF,
            last_packet_at: Instant::now(),
            login_pending: None,
            pending: Box::new(std::array::from_fn(|_| None)),
            reassembly: Box::new(std::array::from_fn(|_| None)),
            generation: 0,
        }
    }

    fn next_sequence(&mut self) -> u8 {
        self.sequence_counter = self.sequence_counter.wrapping_add(1);
        self.sequence_counter
    }
}

/// The fragments collected so far for one multipart command reply.
struct Reassembly {
    fragments: Vec<Option<Vec<u8>>>,
}

impl Reassembly {
    fn new(total: u8) -> Self {
        Self {
            fragments: vec![None; total as usize],
        }
    }

    fn set(&mut self, index: u8, part: Vec<u8>) {
        if let Some(slot) = self.fragments.get_mut(index as usize) {
            *slot = Some(part);
        }
    }

    /// Concatenate all fragments in index order, or `None` if any slot is
    /// still missing.
    fn concatenate(&self) -> Option<Vec<u8>> {
        if self.fragments.iter().any(Option::is_none) {
            return None;
        }
        let mut out = Vec::new();
        for part in &self.fragments {
            out.extend_from_slice(part.as_ref().expect("checked above"));
        }
        Some(out)
    }
}

enum RetryOutcome {
    Retransmit(Packet, Vec<u8>),
    Expire,
}

/// Decide whether a pending request is due for retransmission or has
/// exhausted its retry budget.
///
/// The threshold is checked before the elapsed-time condition: once
/// `sent_count` reaches the configured threshold the request is expired
/// outright, matching the "Retry monotonicity" property in `spec.md` §8
/// (`sent_count == k+1` fails *iff* `sent_count >= packetTimeoutThresholded`,
/// which would not hold if a request kept being retransmitted past the
/// threshold).
fn evaluate_retry(
    pending: &mut PendingRequest,
    packet_timeout: Duration,
    threshold: u32,
) -> Option<RetryOutcome> {
    let sent_count = pending.outbound().sent_count();
    if sent_count >= threshold {
        return Some(RetryOutcome::Expire);
    }

    let due = packet_timeout.saturating_mul(sent_count.max(1));
    if pending.outbound().created_at().elapsed() < due {
        return None;
    }

    match pending.outbound_mut().serialise() {
        Ok(bytes) => Some(RetryOutcome::Retransmit(
            pending.outbound().packet().clone(),
            bytes,
        )),
        Err(_) => Some(RetryOutcome::Expire),
    }
}

impl Connection {
    /// Construct a new, not-yet-connected [`Connection`] and its event
    /// receiver.
    pub(crate) fn new(
        details: ConnectionDetails,
        password: impl Into<String>,
        options: ConnectionOptions,
        socket: SocketHandle,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let id = ConnectionId::new(details.ip, details.port);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let connection = Arc::new_cyclic(|weak| Connection {
            id,
            details,
            password: password.into(),
            options,
            socket,
            events: events_tx,
            weak_self: weak.clone(),
            state: Mutex::new(State::new()),
        });

        (connection, events_rx)
    }

    /// This connection's stable identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote endpoint this connection talks to.
    pub fn details(&self) -> ConnectionDetails {
        self.details
    }

    /// `true` iff the most recent Login Reply accepted the password and no
    /// subsequent disconnect has occurred.
    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn current_generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    fn emit(&self, event: ConnectionEvent) {
        // An unbounded channel only fails to send if every receiver has
        // been dropped; the embedder no longer cares about this
        // connection's events, which is not this crate's problem.
        let _ = self.events.send(event);
    }

    /// Connect (or reconnect) to the remote endpoint and log in.
    ///
    /// If already connected, performs a local disconnect first. Starts the
    /// keep-alive and timeout schedulers (if enabled), sends the Login
    /// Request, and resolves once the Login Reply is received (or the
    /// request exhausts its retries).
    pub async fn connect(&self) -> Result<(), Error> {
        if self.is_connected() {
            self.disconnect_with_reason(Error::ServerDisconnect);
        }

        let generation = {
            let mut state = self.state.lock().unwrap();
            state.generation = state.generation.wrapping_add(1);
            state.last_packet_at = Instant::now();
            state.generation
        };
        self.start_schedulers(generation);

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            state.login_pending = Some(PendingRequest::new(
                OutboundPacket::new(Packet::LoginRequest {
                    password: Some(self.password.clone()),
                }),
                0,
                tx,
            ));
        }

        if let Err(e) = self.send_pending_login() {
            let mut state = self.state.lock().unwrap();
            state.login_pending = None;
            return Err(e);
        }

        match rx.await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(Error::ServerDisconnect),
        }
    }

    fn send_pending_login(&self) -> Result<(), Error> {
        let (packet, bytes) = {
            let mut state = self.state.lock().unwrap();
            let pending = state
                .login_pending
                .as_mut()
                .expect("send_pending_login called without a pending login");
            let bytes = pending.outbound_mut().serialise()?;
            pending.set_bytes(bytes.len());
            (pending.outbound().packet().clone(), bytes)
        };

        if !self.socket.enqueue(packet, bytes) {
            return Err(Error::NoConnection);
        }
        Ok(())
    }

    /// Send a command and await its reply.
    ///
    /// Assigns the next sequence number, registers a pending request, and
    /// transmits it. Fails immediately with [`Error::NoConnection`] if not
    /// connected, or [`Error::PacketOverflow`] if the allocated sequence
    /// number already has an in-flight request (256 commands outstanding
    /// at once).
    pub async fn command(&self, text: impl Into<String>) -> Result<Response, Error> {
        let text = text.into();

        if !self.is_connected() {
            return Err(Error::NoConnection);
        }

        let (seq, rx) = {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_sequence();
            if state.pending[seq as usize].is_some() {
                return Err(Error::PacketOverflow);
            }

            let (tx, rx) = oneshot::channel();
            let outbound = OutboundPacket::new(Packet::CommandRequest {
                sequence: Some(seq),
                command: Some(text),
            });
            state.pending[seq as usize] = Some(PendingRequest::new(outbound, 0, tx));
            (seq, rx)
        };

        if let Err(e) = self.send_pending_command(seq) {
            let mut state = self.state.lock().unwrap();
            state.pending[seq as usize] = None;
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ServerDisconnect),
        }
    }

    fn send_pending_command(&self, seq: u8) -> Result<(), Error> {
        let (packet, bytes) = {
            let mut state = self.state.lock().unwrap();
            let pending = state.pending[seq as usize]
                .as_mut()
                .expect("send_pending_command called without a pending slot");
            let bytes = pending.outbound_mut().serialise()?;
            pending.set_bytes(bytes.len());
            (pending.outbound().packet().clone(), bytes)
        };

        if !self.socket.enqueue(packet, bytes) {
            return Err(Error::NoConnection);
        }
        Ok(())
    }

    /// Report a transport-level error (e.g. a decode failure) on this
    /// connection's own event channel, alongside whatever socket-level
    /// channel the [`Multiplexer`](crate::Multiplexer) also reports it on.
    /// Per `spec.md` §4.4, a decode failure for a datagram from a known
    /// sender is surfaced on both channels; this does not mutate connection
    /// state or count as an inbound packet for liveness purposes.
    pub(crate) fn report_error(&self, error: Error) {
        self.emit(ConnectionEvent::Error { error });
    }

    /// Dispatch an inbound (already decoded) packet. Called by the
    /// [`Multiplexer`](crate::Multiplexer) once it has routed a datagram to
    /// this connection.
    pub(crate) fn receive(&self, packet: Packet) {
        {
            let mut state = self.state.lock().unwrap();
            state.last_packet_at = Instant::now();
        }

        match packet {
            Packet::LoginReply { login } => self.handle_login_reply(login, packet),
            Packet::CommandReply { sequence, data } => {
                self.handle_command_reply(sequence, data, packet)
            }
            Packet::CommandFragment {
                sequence,
                total,
                index,
                part,
            } => self.handle_fragment(sequence, total, index, part),
            Packet::MessageIndication { sequence, message } => {
                self.handle_message(sequence, message, packet)
            }
            Packet::LoginRequest { .. }
            | Packet::CommandRequest { .. }
            | Packet::MessageAck { .. } => {
                self.emit(ConnectionEvent::Debug {
                    text: "ignoring request-shaped packet received from server".to_string(),
                });
            }
        }
    }

    fn handle_login_reply(&self, login: bool, packet: Packet) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.connected = login;
            state.login_pending.take()
        };

        if let Some(mut pending) = pending {
            let response = Response {
                command: None,
                data: None,
                sent: pending.outbound().packet().clone(),
                received: Some(packet),
                bytes: pending.bytes(),
                connection: self.id,
            };
            if login {
                pending.complete(Ok(response));
            } else {
                pending.complete(Err(Error::InvalidPassword));
            }
        }

        if login {
            self.emit(ConnectionEvent::Connected);
        } else {
            // Terminal: password rejection never triggers a reconnect.
            self.disconnect_with_reason(Error::InvalidPassword);
        }
    }

    fn handle_command_reply(&self, sequence: u8, data: String, packet: Packet) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.pending[sequence as usize].take()
        };
        let resolved = pending.is_some();

        if let Some(mut pending) = pending {
            if data == UNKNOWN_COMMAND_TEXT {
                let command = match pending.outbound().packet() {
                    Packet::CommandRequest {
                        command: Some(c), ..
                    } => c.clone(),
                    _ => String::new(),
                };
                pending.complete(Err(Error::UnknownCommand(command)));
            } else {
                let command = match pending.outbound().packet() {
                    Packet::CommandRequest { command, .. } => command.clone(),
                    _ => None,
                };
                let response = Response {
                    command,
                    data: Some(data.clone()),
                    sent: pending.outbound().packet().clone(),
                    received: Some(packet.clone()),
                    bytes: pending.bytes(),
                    connection: self.id,
                };
                pending.complete(Ok(response));
            }
        }

        self.emit(ConnectionEvent::Command {
            data,
            resolved,
            packet,
        });
    }

    fn handle_fragment(&self, sequence: u8, total: u8, index: u8, part: Vec<u8>) {
        enum Outcome {
            Pending,
            Complete(Vec<u8>),
            Retransmit(Packet, Vec<u8>),
            Fail,
        }

        let outcome = {
            let mut state = self.state.lock().unwrap();
            let slot = &mut state.reassembly[sequence as usize];
            let reassembly = slot.get_or_insert_with(|| Reassembly::new(total));
            reassembly.set(index, part);

            if (index as usize) + 1 < total as usize {
                Outcome::Pending
            } else if let Some(data) = reassembly.concatenate() {
                state.reassembly[sequence as usize] = None;
                Outcome::Complete(data)
            } else {
                // Gap: only worth a raw retransmit once the underlying
                // command has already been retried a few times naturally.
                match state.pending[sequence as usize].as_mut() {
                    Some(pending)
                        if pending.outbound().sent_count()
                            >= self.options.packet_timeout_thresholded =>
                    {
                        match pending.outbound_mut().serialise() {
                            Ok(bytes) => {
                                Outcome::Retransmit(pending.outbound().packet().clone(), bytes)
                            }
                            Err(_) => Outcome::Fail,
                        }
                    }
                    _ => Outcome::Fail,
                }
            }
        };

        match outcome {
            Outcome::Pending => {}
            Outcome::Complete(bytes) => {
                let data = String::from_utf8_lossy(&bytes).into_owned();
                let packet = Packet::CommandReply { sequence, data: data.clone() };
                self.handle_command_reply(sequence, data, packet);
            }
            Outcome::Retransmit(packet, bytes) => {
                self.socket.enqueue(packet, bytes);
            }
            Outcome::Fail => {
                let pending = {
                    let mut state = self.state.lock().unwrap();
                    state.pending[sequence as usize].take()
                };
                if let Some(mut pending) = pending {
                    pending.complete(Err(Error::MaxRetries));
                }
            }
        }
    }

    fn handle_message(&self, sequence: u8, message: String, packet: Packet) {
        self.emit(ConnectionEvent::Message {
            text: message,
            packet,
        });

        let ack = Packet::MessageAck { sequence };
        match ack.serialise() {
            Ok(bytes) => {
                self.socket.enqueue(ack, bytes);
            }
            Err(error) => self.emit(ConnectionEvent::Error { error }),
        }
    }

    /// Tear down the session with an explicit reason. Does not reconnect.
    pub fn disconnect(&self) {
        self.disconnect_with_reason(Error::ServerDisconnect);
    }

    fn disconnect_with_reason(&self, reason: Error) {
        let (login, commands) = {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.generation = state.generation.wrapping_add(1);

            let login = state.login_pending.take();
            let mut commands = Vec::new();
            for slot in state.pending.iter_mut() {
                if let Some(pending) = slot.take() {
                    commands.push(pending);
                }
            }
            for slot in state.reassembly.iter_mut() {
                *slot = None;
            }
            (login, commands)
        };

        if let Some(mut pending) = login {
            pending.complete(Err(reason.clone()));
        }
        for mut pending in commands {
            pending.complete(Err(reason.clone()));
        }

        self.emit(ConnectionEvent::Disconnected {
            reason: reason.clone(),
        });

        if matches!(reason, Error::ServerTimeout) && self.options.reconnect {
            if let Some(this) = self.weak_self.upgrade() {
                let delay = self.options.reconnect_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(error) = this.connect().await {
                        warn!(?error, "reconnect attempt failed");
                        this.emit(ConnectionEvent::Error { error });
                    }
                });
            }
        }
    }

    /// Called by the [`Multiplexer`](crate::Multiplexer) when the socket
    /// itself has failed: emit the error, then tear down unconditionally
    /// (never reconnects, since the socket is gone).
    pub(crate) fn kill(&self, error: Error) {
        self.emit(ConnectionEvent::Error {
            error: error.clone(),
        });
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        let login = state.login_pending.take();
        let mut commands = Vec::new();
        for slot in state.pending.iter_mut() {
            if let Some(pending) = slot.take() {
                commands.push(pending);
            }
        }
        drop(state);

        if let Some(mut pending) = login {
            pending.complete(Err(error.clone()));
        }
        for mut pending in commands {
            pending.complete(Err(error.clone()));
        }
        self.emit(ConnectionEvent::Disconnected { reason: error });
    }

    fn start_schedulers(&self, generation: u64) {
        if self.options.keep_alive {
            if let Some(this) = self.weak_self.upgrade() {
                let interval = self.options.keep_alive_interval;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await; // the first tick fires immediately
                    loop {
                        ticker.tick().await;
                        if this.current_generation() != generation {
                            break;
                        }
                        if !this.is_connected() {
                            continue;
                        }

                        let started = Instant::now();
                        match this.command(String::new()).await {
                            Ok(_) => this.emit(ConnectionEvent::Debug {
                                text: format!("keep-alive round trip in {:?}", started.elapsed()),
                            }),
                            Err(error) => {
                                debug!(?error, "keep-alive command failed");
                                this.emit(ConnectionEvent::Error { error });
                            }
                        }
                    }
                });
            }
        }

        if self.options.timeout {
            if let Some(this) = self.weak_self.upgrade() {
                let interval = self.options.timeout_interval;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        ticker.tick().await;
                        if this.current_generation() != generation {
                            break;
                        }
                        this.run_timeout_checks();
                    }
                });
            }
        }
    }

    fn run_timeout_checks(&self) {
        let liveness_exceeded = {
            let state = self.state.lock().unwrap();
            state.last_packet_at.elapsed() >= self.options.server_timeout
        };
        if liveness_exceeded {
            self.disconnect_with_reason(Error::ServerTimeout);
            return;
        }

        let mut retransmits = Vec::new();
        let expired = {
            let mut state = self.state.lock().unwrap();
            let mut to_expire: Vec<Option<u8>> = Vec::new();

            if let Some(pending) = state.login_pending.as_mut() {
                match evaluate_retry(
                    pending,
                    self.options.packet_timeout,
                    self.options.packet_timeout_thresholded,
                ) {
                    Some(RetryOutcome::Retransmit(packet, bytes)) => {
                        retransmits.push((packet, bytes))
                    }
                    Some(RetryOutcome::Expire) => to_expire.push(None),
                    None => {}
                }
            }

            for seq in 0..=255u8 {
                if let Some(pending) = state.pending[seq as usize].as_mut() {
                    match evaluate_retry(
                        pending,
                        self.options.packet_timeout,
                        self.options.packet_timeout_thresholded,
                    ) {
                        Some(RetryOutcome::Retransmit(packet, bytes)) => {
                            retransmits.push((packet, bytes))
                        }
                        Some(RetryOutcome::Expire) => to_expire.push(Some(seq)),
                        None => {}
                    }
                }
            }

            let mut expired = Vec::new();
            for slot in to_expire {
                match slot {
                    Some(seq) => {
                        if let Some(p) = state.pending[seq as usize].take() {
                            expired.push(p);
                        }
                    }
                    None => {
                        if let Some(p) = state.login_pending.take() {
                            expired.push(p);
                        }
                    }
                }
            }
            expired
        };

        for (packet, bytes) in retransmits {
            self.socket.enqueue(packet, bytes);
        }
        for mut pending in expired {
            pending.complete(Err(Error::ServerTimeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ConnectionOptions;

    fn sink_socket() -> (SocketHandle, mpsc::UnboundedReceiver<crate::socket::OutboundDatagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2302);
        let addr: SocketAddr = "127.0.0.1:2302".parse().unwrap();
        (SocketHandle::new(id, addr, tx), rx)
    }

    fn new_connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (socket, _rx) = sink_socket();
        let details = ConnectionDetails::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2302);
        Connection::new(details, "password", ConnectionOptions::default(), socket)
    }

    #[test]
    fn test_sequence_wrap() {
        let mut state = State::new();
        let first_256: Vec<u8> = (0..256).map(|_| state.next_sequence()).collect();
        assert_eq!(first_256, (0u16..256).map(|v| v as u8).collect::<Vec<_>>());
        assert_eq!(state.next_sequence(), 0);
    }

    #[tokio::test]
    async fn test_sequence_overflow_on_duplicate_pending() {
        let (conn, _events) = new_connection();
        // Force the connection into the "connected" state without a real
        // login round trip.
        conn.state.lock().unwrap().connected = true;

        // Manually occupy every sequence slot with a pending request so the
        // next allocation collides.
        {
            let mut state = conn.state.lock().unwrap();
            for seq in 0..=255u8 {
                let (tx, _rx) = oneshot::channel();
                state.pending[seq as usize] = Some(PendingRequest::new(
                    OutboundPacket::new(Packet::CommandRequest {
                        sequence: Some(seq),
                        command: Some("x".to_string()),
                    }),
                    0,
                    tx,
                ));
            }
        }

        let result = conn.command("players").await;
        assert_eq!(result.unwrap_err(), Error::PacketOverflow);
    }

    #[test]
    fn test_reassembly_completes_out_of_order() {
        let mut r = Reassembly::new(2);
        r.set(1, b"world".to_vec());
        assert!(r.concatenate().is_none());
        r.set(0, b"hello ".to_vec());
        assert_eq!(r.concatenate().unwrap(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn test_not_connected_command_fails_fast() {
        let (conn, _events) = new_connection();
        let result = conn.command("players").await;
        assert_eq!(result.unwrap_err(), Error::NoConnection);
    }

    #[tokio::test]
    async fn test_login_reply_rejection_disconnects() {
        let (conn, mut events) = new_connection();
        conn.state.lock().unwrap().connected = false;

        let (tx, rx) = oneshot::channel();
        conn.state.lock().unwrap().login_pending = Some(PendingRequest::new(
            OutboundPacket::new(Packet::LoginRequest {
                password: Some("secret".to_string()),
            }),
            0,
            tx,
        ));

        conn.handle_login_reply(false, Packet::LoginReply { login: false });

        assert_eq!(rx.await.unwrap().unwrap_err(), Error::InvalidPassword);
        assert!(!conn.is_connected());

        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, ConnectionEvent::Disconnected { reason: Error::InvalidPassword }));
    }

    #[tokio::test]
    async fn test_unknown_command_reply() {
        let (conn, mut events) = new_connection();
        conn.state.lock().unwrap().connected = true;

        let (tx, rx) = oneshot::channel();
        conn.state.lock().unwrap().pending[4] = Some(PendingRequest::new(
            OutboundPacket::new(Packet::CommandRequest {
                sequence: Some(4),
                command: Some("frobnicate".to_string()),
            }),
            0,
            tx,
        ));

        conn.handle_command_reply(
            4,
            "Unknown command".to_string(),
            Packet::CommandReply {
                sequence: 4,
                data: "Unknown command".to_string(),
            },
        );

        assert_eq!(
            rx.await.unwrap().unwrap_err(),
            Error::UnknownCommand("frobnicate".to_string())
        );

        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, ConnectionEvent::Command { resolved: true, .. }));
    }
}
