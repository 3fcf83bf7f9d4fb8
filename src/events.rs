//! The typed event surface described in `spec.md` §4.5 and §9 — a sum type
//! per emitter rather than a multi-listener event-emitter, so a consumer
//! can `match` exhaustively (modulo `#[non_exhaustive]`) instead of
//! registering named listeners.

use std::net::SocketAddr;

use crate::id::ConnectionId;
use crate::packet::Packet;
use crate::Error;

/// Events emitted by a single [`Connection`](crate::Connection).
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// An asynchronous server message was received (and already acked).
    Message {
        /// The message text.
        text: String,
        /// The packet that carried it.
        packet: Packet,
    },

    /// A command reply was received (or synthesised from a completed
    /// multipart group).
    Command {
        /// The reply text.
        data: String,
        /// Whether this reply matched a pending request. `false` if the
        /// server replied to a sequence this connection has no record of
        /// (e.g. after a duplicate or very late reply).
        resolved: bool,
        /// The packet that carried the reply.
        packet: Packet,
    },

    /// The connection successfully logged in.
    Connected,

    /// The connection was torn down, for the given reason.
    Disconnected {
        /// Why the connection was torn down.
        reason: Error,
    },

    /// A low-level diagnostic message (retransmits, scheduler ticks, ...).
    Debug {
        /// The diagnostic text.
        text: String,
    },

    /// A non-fatal error (bad checksum, unknown type, multipart gap, ...).
    Error {
        /// The error that occurred.
        error: Error,
    },
}

/// Events emitted by the [`Multiplexer`](crate::Multiplexer).
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum MultiplexerEvent {
    /// The UDP socket is bound and the receive loop has started.
    Listening {
        /// The bound local address.
        local_addr: SocketAddr,
    },

    /// A datagram was received and decoded.
    Received {
        /// `true` if the sender matched a registered connection and the
        /// packet was routed to it; `false` if no connection is registered
        /// for that remote address (see `MultiplexerEvent::Error` for the
        /// accompanying `UnknownConnection`).
        resolved: bool,
        /// The decoded packet.
        packet: Packet,
        /// The raw datagram bytes.
        buffer: Vec<u8>,
        /// The connection the datagram was routed to.
        connection: ConnectionId,
        /// The sender's address.
        remote: SocketAddr,
    },

    /// A packet was serialised and handed to the socket for transmission.
    Sent {
        /// The packet that was sent.
        packet: Packet,
        /// Its serialised wire bytes.
        buffer: Vec<u8>,
        /// The number of bytes written to the socket.
        bytes: usize,
        /// The connection the packet was sent on behalf of.
        connection: ConnectionId,
    },

    /// A socket-level or routing error occurred.
    Error {
        /// The error that occurred.
        error: Error,
    },
}
